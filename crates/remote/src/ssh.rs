use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::traits::{CopyDirection, ExitResult, RemoteShell};

/// ssh exits with this code when the connection itself fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Account the benchmark images are built for
    pub user: String,
    /// Private key offered to every machine
    pub identity_file: PathBuf,
    pub strict_host_key_checking: bool,
    /// Seconds before an unanswered connection attempt is abandoned
    pub connect_timeout_secs: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "bench".to_string(),
            identity_file: PathBuf::from("bench"),
            strict_host_key_checking: false,
            connect_timeout_secs: None,
        }
    }
}

impl SshConfig {
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = path.into();
        self
    }
}

/// [`RemoteShell`] over the system `ssh` and `scp` clients.
pub struct SshShell {
    config: SshConfig,
}

impl SshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.config.strict_host_key_checking { "yes" } else { "no" }
            ),
        ];
        if let Some(secs) = self.config.connect_timeout_secs {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={}", secs));
        }
        args.push("-i".to_string());
        args.push(self.config.identity_file.display().to_string());
        args
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.config.user, host)
    }

    pub(crate) fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    pub(crate) fn scp_args(
        &self,
        host: &str,
        direction: CopyDirection,
        recursive: bool,
        local: &Path,
        remote: &str,
    ) -> Result<Vec<String>> {
        let local = local
            .to_str()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RemoteError::InvalidPath(local.display().to_string()))?;
        if remote.is_empty() {
            return Err(RemoteError::InvalidPath(remote.to_string()));
        }

        let mut args = self.common_options();
        if recursive {
            args.push("-r".to_string());
        }
        let remote = format!("{}:{}", self.destination(host), remote);
        match direction {
            CopyDirection::ToRemote => {
                args.push(local.to_string());
                args.push(remote);
            }
            CopyDirection::FromRemote => {
                args.push(remote);
                args.push(local.to_string());
            }
        }
        Ok(args)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn is_available(&self) -> bool {
        which::which("ssh").is_ok() && which::which("scp").is_ok()
    }

    async fn run(&self, host: &str, command: &str) -> Result<ExitResult> {
        debug!(host, command, "Running remote command");

        let output = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .output()
            .await?;

        let code = output.status.code();
        if code == Some(SSH_CONNECTION_FAILURE) {
            return Err(RemoteError::ConnectionLost(host.to_string()));
        }

        let result = ExitResult {
            code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            warn!(host, command, code = ?code, "Remote command exited with failure");
        }
        Ok(result)
    }

    async fn copy(
        &self,
        host: &str,
        direction: CopyDirection,
        recursive: bool,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let args = self.scp_args(host, direction, recursive, local, remote)?;
        debug!(host, ?direction, recursive, "Copying with scp");

        let output = Command::new("scp").args(&args).output().await?;
        if !output.status.success() {
            return Err(RemoteError::command_failed(
                host,
                output.status.code(),
                format!(
                    "scp {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> SshShell {
        SshShell::new(
            SshConfig::default()
                .with_user("runner")
                .with_identity_file("/keys/bench"),
        )
    }

    #[test]
    fn test_ssh_args() {
        let args = shell().ssh_args("10.0.0.5", "uptime");
        assert_eq!(
            args,
            vec![
                "-q",
                "-o",
                "StrictHostKeyChecking=no",
                "-i",
                "/keys/bench",
                "runner@10.0.0.5",
                "uptime",
            ]
        );
    }

    #[test]
    fn test_scp_directions() {
        let to = shell()
            .scp_args("h", CopyDirection::ToRemote, false, Path::new("a.json"), "~/a.json")
            .unwrap();
        assert_eq!(&to[to.len() - 2..], ["a.json", "runner@h:~/a.json"]);

        let from = shell()
            .scp_args("h", CopyDirection::FromRemote, true, Path::new("logs/00"), "~/logs/*")
            .unwrap();
        assert!(from.contains(&"-r".to_string()));
        assert_eq!(&from[from.len() - 2..], ["runner@h:~/logs/*", "logs/00"]);
    }

    #[test]
    fn test_scp_rejects_empty_paths() {
        let err = shell()
            .scp_args("h", CopyDirection::ToRemote, false, Path::new(""), "~/x")
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidPath(_)));
        assert!(shell()
            .scp_args("h", CopyDirection::ToRemote, false, Path::new("x"), "")
            .is_err());
    }

    #[test]
    fn test_connect_timeout_option() {
        let mut config = SshConfig::default();
        config.connect_timeout_secs = Some(10);
        let args = SshShell::new(config).ssh_args("h", "true");
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
    }
}
