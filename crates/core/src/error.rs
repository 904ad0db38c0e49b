use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid party size {0}: must be a nonzero power of two")]
    InvalidPartySize(usize),

    #[error("Corrupt topology: {0}")]
    CorruptTopology(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptTopology(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
