//! The receiving end of the framing protocol.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType};

/// Frames above this size are refused unless the link raises its limit.
pub const DEFAULT_MAX_FRAME: usize = 1 << 30;

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Sets the largest frame, in bytes, this receiver accepts.
    ///
    /// A larger length prefix fails `recv_into` with `InvalidData` before anything is allocated.
    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Waits for the next frame and deserializes it.
    ///
    /// # Arguments
    /// * `buf` - The buffer backing the frame, the returned `T` borrows from it.
    ///
    /// # Returns
    /// The received `T` or an io error on failure.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let prefix = LenType::from_be_bytes(size_buf);

        let len = match usize::try_from(prefix) {
            Ok(len) if len <= self.max_frame => len,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame of {prefix} bytes exceeds the limit of {} bytes",
                        self.max_frame
                    ),
                ));
            }
        };

        let needed = len.div_ceil(size_of::<B>());
        buf.resize(needed, B::zeroed());

        let view: &'buf mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let frame = &mut view[..len];
        self.rx.read_exact(frame).await?;

        T::deserialize(frame)
    }
}
