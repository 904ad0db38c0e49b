//! In-memory [`RemoteShell`] that records every call, for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{RemoteError, Result};
use crate::traits::{CopyDirection, ExitResult, RemoteShell};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run {
        host: String,
        command: String,
    },
    Copy {
        host: String,
        direction: CopyDirection,
        recursive: bool,
        local: PathBuf,
        remote: String,
    },
}

/// A command as it was started, with the (possibly paused) clock reading.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub host: String,
    pub command: String,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingShell {
    calls: Mutex<Vec<RemoteCall>>,
    runs: Mutex<Vec<RunRecord>>,
    responses: Vec<(String, ExitResult)>,
    delays: Vec<(String, Duration)>,
    unreachable: HashSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `result`; earlier patterns win.
    pub fn with_response(mut self, pattern: impl Into<String>, result: ExitResult) -> Self {
        self.responses.push((pattern.into(), result));
        self
    }

    /// Make commands containing `pattern` take `delay` before they exit.
    pub fn with_delay(mut self, pattern: impl Into<String>, delay: Duration) -> Self {
        self.delays.push((pattern.into(), delay));
        self
    }

    /// Fail every call to `host` as a lost connection.
    pub fn with_unreachable(mut self, host: impl Into<String>) -> Self {
        self.unreachable.insert(host.into());
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        lock(&self.runs).clone()
    }

    /// Commands in the order they were started.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.runs).iter().map(|r| r.command.clone()).collect()
    }

    pub fn runs_matching(&self, pattern: &str) -> Vec<RunRecord> {
        lock(&self.runs)
            .iter()
            .filter(|r| r.command.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn copies(&self) -> Vec<RemoteCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, RemoteCall::Copy { .. }))
            .cloned()
            .collect()
    }

    fn check_reachable(&self, host: &str) -> Result<()> {
        if self.unreachable.contains(host) {
            return Err(RemoteError::ConnectionLost(host.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn run(&self, host: &str, command: &str) -> Result<ExitResult> {
        lock(&self.calls).push(RemoteCall::Run {
            host: host.to_string(),
            command: command.to_string(),
        });
        lock(&self.runs).push(RunRecord {
            host: host.to_string(),
            command: command.to_string(),
            at: Instant::now(),
        });
        self.check_reachable(host)?;

        let delay = self
            .delays
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| ExitResult::ok("")))
    }

    async fn copy(
        &self,
        host: &str,
        direction: CopyDirection,
        recursive: bool,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        lock(&self.calls).push(RemoteCall::Copy {
            host: host.to_string(),
            direction,
            recursive,
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        self.check_reachable(host)
    }
}
