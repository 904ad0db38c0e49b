use async_trait::async_trait;
use std::path::Path;

use crate::error::{RemoteError, Result};

/// Outcome of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitResult {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExitResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToRemote,
    FromRemote,
}

/// Runs commands on, and copies files to and from, remote machines.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Get the name of the transport
    fn name(&self) -> &'static str;

    /// Check if the transport's client tools are installed
    async fn is_available(&self) -> bool;

    /// Run a shell command on `host` and wait for it to exit.
    ///
    /// A nonzero exit is reported in the result, not as an error.
    async fn run(&self, host: &str, command: &str) -> Result<ExitResult>;

    /// Copy a file or, if `recursive`, a directory between this machine and `host`.
    async fn copy(
        &self,
        host: &str,
        direction: CopyDirection,
        recursive: bool,
        local: &Path,
        remote: &str,
    ) -> Result<()>;

    /// Run a command and turn a nonzero exit into [`RemoteError::CommandFailed`].
    async fn run_checked(&self, host: &str, command: &str) -> Result<ExitResult> {
        let result = self.run(host, command).await?;
        if !result.success() {
            return Err(RemoteError::command_failed(host, result.code, result.stderr));
        }
        Ok(result)
    }

    async fn copy_to(&self, host: &str, recursive: bool, local: &Path, remote: &str) -> Result<()> {
        self.copy(host, CopyDirection::ToRemote, recursive, local, remote)
            .await
    }

    async fn copy_from(&self, host: &str, recursive: bool, remote: &str, local: &Path) -> Result<()> {
        self.copy(host, CopyDirection::FromRemote, recursive, local, remote)
            .await
    }

    /// Push a local script into the remote home directory and run it with `args`.
    async fn run_script(&self, host: &str, script: &Path, args: &str) -> Result<ExitResult> {
        let file_name = script
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RemoteError::InvalidPath(script.display().to_string()))?;
        let remote_path = format!("~/{}", file_name);
        self.copy_to(host, false, script, &remote_path).await?;

        let command = if args.trim().is_empty() {
            remote_path
        } else {
            format!("{} {}", remote_path, args.trim())
        };
        self.run(host, &command).await
    }
}
