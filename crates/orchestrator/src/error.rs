use clusterbench_core::CoreError;
use cloud::CloudError;
use remote::RemoteError;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Topology error: {0}")]
    Core(#[from] CoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("{phase} failed for {} task(s): {}", .failures.len(), .failures.join("; "))]
    FanOutFailed { phase: String, failures: Vec<String> },

    #[error("Topology file {} already exists; deallocate the cluster first", .0.display())]
    TopologyExists(PathBuf),

    #[error("No topology file at {}", .0.display())]
    TopologyMissing(PathBuf),

    #[error("Invalid machine stage transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Create a fan-out failure from every failed task of one phase.
    pub fn fan_out(phase: impl Into<String>, failures: Vec<String>) -> Self {
        Self::FanOutFailed {
            phase: phase.into(),
            failures,
        }
    }

    /// Whether the error means the cluster being created already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::TopologyExists(_)
                | Self::Core(CoreError::AlreadyExists(_))
                | Self::Cloud(CloudError::ResourceGroupExists(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Split joined fan-out results into successes, or fail with every error at once.
pub(crate) fn collect<K, T, E>(
    phase: &str,
    results: Vec<(K, std::result::Result<T, E>)>,
) -> Result<Vec<(K, T)>>
where
    K: Display,
    E: Display,
{
    let mut succeeded = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (key, result) in results {
        match result {
            Ok(value) => succeeded.push((key, value)),
            Err(e) => failures.push(format!("{}: {}", key, e)),
        }
    }
    if failures.is_empty() {
        Ok(succeeded)
    } else {
        Err(OrchestratorError::fan_out(phase, failures))
    }
}
