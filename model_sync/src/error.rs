use std::{error::Error, fmt, io};

/// The synchronization module's result type.
pub type Result<T> = std::result::Result<T, SyncErr>;

/// Failures of the synchronization core.
///
/// Configuration errors (`InvalidConfig`, `MissingPeers`, `PeerRejected`, `Rejected`)
/// are fatal and must stop the run before training starts. `Uninitialized` is a
/// contract violation by the caller.
#[derive(Debug)]
pub enum SyncErr {
    Io(io::Error),
    InvalidConfig(String),
    Uninitialized,
    SizeMismatch {
        got: usize,
        expected: usize,
    },
    MissingPeers {
        expected: usize,
        joined: usize,
    },
    PeerRejected {
        rank: usize,
        reason: String,
    },
    Rejected(String),
    UnexpectedMessage {
        rank: usize,
        got: &'static str,
    },
}

impl fmt::Display for SyncErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErr::Io(e) => write!(f, "io error: {e}"),
            SyncErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            SyncErr::Uninitialized => {
                f.write_str("the model was used before being initialized in the synchronizer")
            }
            SyncErr::SizeMismatch { got, expected } => write!(
                f,
                "buffer length mismatch: got {got}, expected {expected}"
            ),
            SyncErr::MissingPeers { expected, joined } => write!(
                f,
                "only {joined} of {expected} peer ranks joined before the startup timeout"
            ),
            SyncErr::PeerRejected { rank, reason } => {
                write!(f, "rank {rank} was rejected: {reason}")
            }
            SyncErr::Rejected(reason) => write!(f, "rejected by the coordinator: {reason}"),
            SyncErr::UnexpectedMessage { rank, got } => {
                write!(f, "unexpected message from rank {rank}: got {got}")
            }
        }
    }
}

impl Error for SyncErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SyncErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for SyncErr {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidConfig(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SyncErr> for io::Error {
    fn from(value: SyncErr) -> Self {
        match value {
            SyncErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
