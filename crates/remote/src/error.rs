use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Command on {host} exited with {code:?}: {stderr}")]
    CommandFailed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Lost connection to {0} (ssh exited with 255)")]
    ConnectionLost(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn command_failed(host: impl Into<String>, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            host: host.into(),
            code,
            stderr: stderr.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
