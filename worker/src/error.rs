use std::{error::Error, fmt, io};

use seqml::MlError;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, TrainerErr>;

/// Training-driver failures.
#[derive(Debug)]
pub enum TrainerErr {
    Io(io::Error),
    Ml(MlError),
    /// An invalid experiment specification, caught at startup.
    Config(String),
    /// An error message sent back by a parameter server.
    Server(String),
    /// The protocol produced a reply the current operation cannot use.
    UnexpectedReply {
        expected: &'static str,
        got: String,
    },
    /// A malformed or inconsistent checkpoint file.
    Checkpoint(String),
}

impl fmt::Display for TrainerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerErr::Io(e) => write!(f, "io error: {e}"),
            TrainerErr::Ml(e) => write!(f, "model error: {e}"),
            TrainerErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            TrainerErr::Server(msg) => write!(f, "parameter server error: {msg}"),
            TrainerErr::UnexpectedReply { expected, got } => {
                write!(f, "unexpected reply: expected {expected}, got {got}")
            }
            TrainerErr::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
        }
    }
}

impl Error for TrainerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainerErr::Io(e) => Some(e),
            TrainerErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlError> for TrainerErr {
    fn from(value: MlError) -> Self {
        Self::Ml(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainerErr> for io::Error {
    fn from(value: TrainerErr) -> Self {
        match value {
            TrainerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
