use anyhow::{bail, Context, Result};
use cloud::{AzureConfig, GcloudConfig};
use orchestrator::{PipelineConfig, SetupConfig};
use remote::SshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_FILE: &str = "clusterbench.toml";
const CONFIG_DIR: &str = "clusterbench";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub ssh: SshConfig,
    pub azure: AzureConfig,
    pub gcloud: GcloudConfig,
    pub experiment: PipelineConfig,
    pub spawn: SetupConfig,
}

impl BenchConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }
}

fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(CONFIG_DIR).join(CONFIG_FILE));
    }
    paths
}

/// Load the configuration and report which file it came from.
///
/// An explicit path must exist. Otherwise the working directory is searched
/// first, then the user configuration directory; no file means defaults.
pub async fn load(explicit: Option<&Path>) -> Result<(BenchConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("Configuration file {} does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => candidates().into_iter().find(|p| p.exists()),
    };

    match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config = BenchConfig::parse(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        }
        None => Ok((BenchConfig::default(), None)),
    }
}
