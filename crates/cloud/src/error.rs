use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Cluster \"{0}\" already exists")]
    ResourceGroupExists(String),

    #[error("Cluster \"{0}\" does not exist")]
    ResourceGroupMissing(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("Failed to parse provider output: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;
