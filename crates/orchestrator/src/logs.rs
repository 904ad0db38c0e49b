use clusterbench_core::Cluster;
use remote::RemoteShell;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{collect, OrchestratorError, Result};

const REMOTE_LOGS: &str = "~/logs/*";

/// Copy every machine's logs into its own directory under `dir`.
///
/// Directories are created for all machines before any copy starts. Returns
/// the directory of each machine, by id.
pub async fn fetch_logs(shell: &dyn RemoteShell, cluster: &Cluster, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::with_capacity(cluster.len());
    for id in cluster.all_ids() {
        let target = dir.join(cluster.log_directory_name(id)?);
        tokio::fs::create_dir_all(&target).await?;
        targets.push(target);
    }
    info!(machines = cluster.len(), dir = %dir.display(), "Fetching logs");

    let targets_ref = &targets;
    let results = cluster
        .for_each(&cluster.all_ids(), |machine, id| async move {
            let host = machine.ssh_host()?;
            shell.copy_from(host, false, REMOTE_LOGS, &targets_ref[id]).await?;
            Ok::<_, OrchestratorError>(())
        })
        .await?;
    collect("fetch logs", results)?;
    Ok(targets)
}
