use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

/// Upper bound for the body of control and error frames.
const MAX_CONTROL_LEN: usize = 4096;

/// The payload data for the `Data` variant of the `Msg` enum.
///
/// Every variant carries a full flattened parameter buffer.
#[derive(Debug)]
pub enum Payload<'a> {
    /// The coordinator's parameters, broadcast once at startup.
    Initial(&'a [f32]),
    /// A peer's snapshot of its canonical buffer for one exchange round.
    Exchange(&'a [f32]),
    /// The coordinator's answer to an `Exchange`.
    Merged(&'a [f32]),
    /// A peer's parameters at shutdown.
    Final(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a peer, announces its rank and its parameter count.
    Hello { rank: usize, params: usize },
    /// The coordinator accepted the peer.
    Welcome { broadcast: bool, collect: bool },
    Disconnect,
}

/// The application layer message exchanged between ranks.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for the message kind, used in error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "hello",
            Msg::Control(Command::Welcome { .. }) => "welcome",
            Msg::Control(Command::Disconnect) => "disconnect",
            Msg::Data(Payload::Initial(_)) => "initial",
            Msg::Data(Payload::Exchange(_)) => "exchange",
            Msg::Data(Payload::Merged(_)) => "merged",
            Msg::Data(Payload::Final(_)) => "final",
            Msg::Err(_) => "err",
        }
    }

    /// The largest frame a link carrying `params` parameters can legitimately receive.
    ///
    /// # Arguments
    /// * `params` - The amount of parameters of a full buffer, `0` for control-only links.
    pub fn max_len(params: usize) -> usize {
        let body = params
            .saturating_mul(size_of::<f32>())
            .max(MAX_CONTROL_LEN);

        HEADER_SIZE.saturating_add(body)
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&(0 as Header).to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(1 as Header).to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums): (Header, &[f32]) = match payload {
                    Payload::Initial(params) => (2, params),
                    Payload::Exchange(params) => (3, params),
                    Payload::Merged(params) => (4, params),
                    Payload::Final(params) => (5, params),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind_buf, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len());
        };

        match Header::from_be_bytes(*kind_buf) {
            0 => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            1 => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ 2..=5 => {
                let nums = bytemuck::try_cast_slice(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}"))
                })?;

                let payload = match kind {
                    2 => Payload::Initial(nums),
                    3 => Payload::Exchange(nums),
                    4 => Payload::Merged(nums),
                    _ => Payload::Final(nums),
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}
