use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CloudError, Result};

/// Run a provider CLI and return its stdout.
pub(crate) async fn run(program: &str, args: &[String]) -> Result<String> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CloudError::CommandFailed(format!(
            "{} {} failed: {}",
            program,
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) async fn run_json(program: &str, args: &[String]) -> Result<Value> {
    let stdout = run(program, args).await?;
    serde_json::from_str(&stdout)
        .map_err(|e| CloudError::Parse(format!("{} output is not JSON: {}", program, e)))
}

/// String at a JSON pointer such as `/newVNet/id`.
pub(crate) fn string_at(value: &Value, pointer: &str) -> Result<String> {
    optional_string_at(value, pointer)
        .ok_or_else(|| CloudError::Parse(format!("missing {} in provider output", pointer)))
}

pub(crate) fn optional_string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
