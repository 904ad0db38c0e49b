pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ssh;
pub mod traits;

pub use error::{RemoteError, Result};
pub use ssh::{SshConfig, SshShell};
pub use traits::{CopyDirection, ExitResult, RemoteShell};
