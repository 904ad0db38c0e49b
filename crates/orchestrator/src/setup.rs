//! Software setup of freshly spawned machines.

use clusterbench_core::{Cluster, CoreError, Machine, Provider};
use remote::RemoteShell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{collect, OrchestratorError, Result};
use crate::gate::seconds;

const INSTALL_DEPS: &str = "install_deps.sh";
const PROVISION: &str = "provision.sh";
const SETUP_CODE: &str = "setup_code.sh";
const GENERATE_CONFIGS: &str = "generate_configs.py";

const REMOTE_TOPOLOGY: &str = "~/cluster.json";
const GENERATE_KEYS: &str =
    "cd ~/work/mage/bin; ./ckks_utils keygen; mkdir -p ~/ckks_keys; cp *.ckks ~/ckks_keys";
const REMOTE_KEYS: &str = "~/ckks_keys";
const REMOTE_KEY_FILES: &str = "~/ckks_keys/*";
const CLEAR_KEYS: &str = "rm -rf ~/ckks_keys";
const INSTALL_KEYS: &str = "cp ~/ckks_keys/* ~/work/mage/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub scripts_dir: PathBuf,
    /// Repository the benchmark code is built from
    pub repository: String,
    pub checkout: String,
    /// Time freshly spawned machines get to boot before setup starts
    #[serde(with = "seconds")]
    pub startup_wait: Duration,
    /// Local staging directory for the CKKS keys
    pub keys_dir: PathBuf,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("./scripts"),
            repository: "https://github.com/ucbrise/mage".to_string(),
            checkout: "main".to_string(),
            startup_wait: Duration::from_secs(180),
            keys_dir: PathBuf::from("./ckks_keys"),
        }
    }
}

impl SetupConfig {
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>, checkout: impl Into<String>) -> Self {
        self.repository = repository.into();
        self.checkout = checkout.into();
        self
    }

    pub fn with_startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }

    pub fn with_keys_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keys_dir = dir.into();
        self
    }
}

/// Cloud name the provisioning script switches on.
fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Local => "azure",
        Provider::Remote => "gcloud",
    }
}

/// Arguments of every config generation machine `id` runs.
pub fn config_generations(cluster: &Cluster, id: usize) -> Vec<String> {
    let mut generations = Vec::new();
    if cluster.is_lan(id) {
        generations.push(format!(
            "{} {} lan ~/config {}",
            REMOTE_TOPOLOGY,
            id,
            cluster.is_paired()
        ));
    }
    for (location, &first) in &cluster.location_to_id {
        if cluster.is_paired() {
            let in_block = (first..first + cluster.num_lan_machines).contains(&id);
            if cluster.is_lan(id) || in_block {
                generations.push(format!(
                    "{} {} {}-paired ~/config-{}-paired",
                    REMOTE_TOPOLOGY, id, location, location
                ));
            }
        } else if id == 0 || id == first {
            generations.push(format!(
                "{} 0 {} ~/config-{}",
                REMOTE_TOPOLOGY, location, location
            ));
        }
    }
    generations
}

pub struct SoftwareSetup {
    shell: Arc<dyn RemoteShell>,
    config: SetupConfig,
}

impl SoftwareSetup {
    pub fn new(shell: Arc<dyn RemoteShell>, config: SetupConfig) -> Self {
        Self { shell, config }
    }

    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// Give freshly spawned machines time to boot.
    pub async fn wait_for_startup(&self) {
        info!(secs = self.config.startup_wait.as_secs(), "Waiting for machines to start up");
        tokio::time::sleep(self.config.startup_wait).await;
    }

    /// Install, build and configure the benchmark on every machine, then distribute CKKS keys.
    pub async fn provision(&self, cluster: &Cluster, topology_path: &Path) -> Result<()> {
        if tokio::fs::metadata(topology_path).await.is_err() {
            return Err(OrchestratorError::TopologyMissing(topology_path.to_path_buf()));
        }
        info!(cluster = %cluster.name, machines = cluster.len(), "Provisioning machines");

        let results = cluster
            .for_each(&cluster.all_ids(), |machine, id| {
                self.provision_machine(cluster, machine, id, topology_path)
            })
            .await?;
        collect("provision", results)?;

        self.distribute_ckks_keys(cluster).await
    }

    async fn provision_machine(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        id: usize,
        topology_path: &Path,
    ) -> Result<()> {
        let host = machine.ssh_host()?;
        let provider = machine
            .provider
            .ok_or_else(|| CoreError::corrupt(format!("machine {} has no provider", id)))?;
        let image = machine.image.unwrap_or_default();
        debug!(machine_id = id, host, image = image.as_str(), "Provisioning machine");

        if image.needs_dependencies() {
            self.script(host, INSTALL_DEPS, "--install-mage-deps --install-utils --setup-wan-tcp")
                .await?;
        }
        self.script(
            host,
            PROVISION,
            &format!("{} {}", provider_label(provider), cluster.setup),
        )
        .await?;
        self.script(
            host,
            SETUP_CODE,
            &format!(
                "{} {} {}",
                image.as_str(),
                self.config.repository,
                self.config.checkout
            ),
        )
        .await?;

        self.shell
            .copy_to(host, false, topology_path, REMOTE_TOPOLOGY)
            .await?;
        for args in config_generations(cluster, id) {
            self.script(host, GENERATE_CONFIGS, &args).await?;
        }
        Ok(())
    }

    /// Generate CKKS keys on machine 0 and install them on every other machine.
    pub async fn distribute_ckks_keys(&self, cluster: &Cluster) -> Result<()> {
        let head = cluster.machine(0)?.ssh_host()?;
        let keys_dir = &self.config.keys_dir;
        remove_dir(keys_dir).await?;

        info!(host = head, "Generating CKKS keys");
        self.shell.run_checked(head, GENERATE_KEYS).await?;

        let distributed = self.copy_keys(cluster, head, keys_dir).await;
        remove_dir(keys_dir).await?;
        distributed
    }

    /// Pull the key files into `keys_dir`, then push that directory to `~/ckks_keys` on the others.
    async fn copy_keys(&self, cluster: &Cluster, head: &str, keys_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(keys_dir).await?;
        self.shell
            .copy_from(head, false, REMOTE_KEY_FILES, keys_dir)
            .await?;

        let others: Vec<usize> = (1..cluster.len()).collect();
        let results = cluster
            .for_each(&others, |machine, _| async move {
                let host = machine.ssh_host()?;
                self.shell.run_checked(host, CLEAR_KEYS).await?;
                self.shell.copy_to(host, true, keys_dir, REMOTE_KEYS).await?;
                self.shell.run_checked(host, INSTALL_KEYS).await?;
                Ok::<_, OrchestratorError>(())
            })
            .await?;
        collect("distribute ckks keys", results)?;
        Ok(())
    }

    async fn script(&self, host: &str, name: &str, args: &str) -> Result<()> {
        let path = self.config.scripts_dir.join(name);
        let result = self.shell.run_script(host, &path, args).await?;
        if !result.success() {
            return Err(remote::RemoteError::command_failed(host, result.code, result.stderr).into());
        }
        Ok(())
    }
}

async fn remove_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterbench_core::{ImageKind, WanSetup};
    use remote::mock::{RecordingShell, RemoteCall};
    use remote::{CopyDirection, ExitResult};

    fn ready(mut cluster: Cluster, wan_from: usize) -> Cluster {
        for (id, machine) in cluster.machines.iter_mut().enumerate() {
            machine.public_ip_address = Some(format!("203.0.113.{}", id + 10));
            machine.provider = Some(if id < wan_from { Provider::Local } else { Provider::Remote });
            machine.image = Some(ImageKind::Ubuntu);
        }
        cluster
    }

    fn regular_wan() -> Cluster {
        let mut cluster = Cluster::create("bench", 4).with_lan_machines(2);
        cluster.location_to_id.insert("iowa".to_string(), 2);
        cluster.location_to_id.insert("oregon".to_string(), 3);
        ready(cluster, 2)
    }

    #[test]
    fn test_lan_config_generation() {
        let cluster = Cluster::create("bench", 2);
        assert_eq!(
            config_generations(&cluster, 1),
            vec!["~/cluster.json 1 lan ~/config false".to_string()]
        );
    }

    #[test]
    fn test_regular_wan_config_generation() {
        let cluster = regular_wan();
        assert_eq!(
            config_generations(&cluster, 0),
            vec![
                "~/cluster.json 0 lan ~/config false".to_string(),
                "~/cluster.json 0 iowa ~/config-iowa".to_string(),
                "~/cluster.json 0 oregon ~/config-oregon".to_string(),
            ]
        );
        assert_eq!(config_generations(&cluster, 1).len(), 1);
        assert_eq!(
            config_generations(&cluster, 3),
            vec!["~/cluster.json 0 oregon ~/config-oregon".to_string()]
        );
    }

    #[test]
    fn test_paired_config_generation() {
        let mut cluster = Cluster::create("bench", 6)
            .with_lan_machines(2)
            .with_setup(WanSetup::PairedSwap);
        cluster.location_to_id.insert("iowa".to_string(), 2);
        cluster.location_to_id.insert("oregon".to_string(), 4);

        assert_eq!(
            config_generations(&cluster, 1),
            vec![
                "~/cluster.json 1 lan ~/config true".to_string(),
                "~/cluster.json 1 iowa-paired ~/config-iowa-paired".to_string(),
                "~/cluster.json 1 oregon-paired ~/config-oregon-paired".to_string(),
            ]
        );
        assert_eq!(
            config_generations(&cluster, 5),
            vec!["~/cluster.json 5 oregon-paired ~/config-oregon-paired".to_string()]
        );
    }

    #[tokio::test]
    async fn test_provision_runs_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let topology = dir.path().join("cluster.json");
        std::fs::write(&topology, "{}").unwrap();

        let shell = Arc::new(RecordingShell::new());
        let mut cluster = regular_wan();
        cluster.machines[3].image = Some(ImageKind::Prebuilt);
        let setup = SoftwareSetup::new(
            shell.clone(),
            SetupConfig::default().with_keys_dir(dir.path().join("keys")),
        );
        setup.provision(&cluster, &topology).await.unwrap();

        assert_eq!(shell.runs_matching(INSTALL_DEPS).len(), 3);
        assert!(shell
            .runs()
            .iter()
            .any(|r| r.host == "203.0.113.12" && r.command == "~/provision.sh gcloud regular"));
        assert!(shell
            .commands()
            .contains(&"~/setup_code.sh prebuilt https://github.com/ucbrise/mage main".to_string()));
        assert_eq!(shell.runs_matching(GENERATE_CONFIGS).len(), 6);

        let topology_pushes = shell
            .copies()
            .into_iter()
            .filter(|c| matches!(c, RemoteCall::Copy { remote, .. } if remote == REMOTE_TOPOLOGY))
            .count();
        assert_eq!(topology_pushes, 4);

        assert_eq!(shell.runs_matching("ckks_utils keygen").len(), 1);
        assert_eq!(shell.runs_matching(INSTALL_KEYS).len(), 3);
        assert!(shell.copies().contains(&RemoteCall::Copy {
            host: "203.0.113.10".to_string(),
            direction: CopyDirection::FromRemote,
            recursive: false,
            local: dir.path().join("keys"),
            remote: REMOTE_KEY_FILES.to_string(),
        }));
        assert!(!dir.path().join("keys").exists());
    }

    #[tokio::test]
    async fn test_keys_are_pushed_from_where_they_were_pulled() {
        let dir = tempfile::tempdir().unwrap();
        let keys_dir = dir.path().join("staging");
        let shell = Arc::new(RecordingShell::new());
        let setup = SoftwareSetup::new(
            shell.clone(),
            SetupConfig::default().with_keys_dir(&keys_dir),
        );
        setup.distribute_ckks_keys(&regular_wan()).await.unwrap();

        let mut pulled = Vec::new();
        let mut pushed = Vec::new();
        for call in shell.copies() {
            if let RemoteCall::Copy {
                host,
                direction,
                local,
                remote,
                ..
            } = call
            {
                match direction {
                    CopyDirection::FromRemote => pulled.push(local),
                    CopyDirection::ToRemote => {
                        assert_eq!(remote, REMOTE_KEYS);
                        assert_ne!(host, "203.0.113.10");
                        pushed.push(local);
                    }
                }
            }
        }
        assert_eq!(pulled, vec![keys_dir.clone()]);
        assert_eq!(pushed.len(), 3);
        assert!(pushed.iter().all(|local| *local == keys_dir));
        assert_eq!(shell.runs_matching(CLEAR_KEYS).len(), 3);

        assert!(!keys_dir.exists());
        assert!(!dir.path().join("ckks_keys").exists());
    }

    #[tokio::test]
    async fn test_provision_requires_topology_file() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Arc::new(RecordingShell::new());
        let setup = SoftwareSetup::new(shell.clone(), SetupConfig::default());
        let err = setup
            .provision(&regular_wan(), &dir.path().join("cluster.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TopologyMissing(_)));
        assert_eq!(shell.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_script_stops_before_keys() {
        let dir = tempfile::tempdir().unwrap();
        let topology = dir.path().join("cluster.json");
        std::fs::write(&topology, "{}").unwrap();

        let shell = Arc::new(
            RecordingShell::new().with_response(SETUP_CODE, ExitResult::failed(2, "clone failed")),
        );
        let setup = SoftwareSetup::new(
            shell.clone(),
            SetupConfig::default().with_keys_dir(dir.path().join("keys")),
        );
        let err = setup.provision(&regular_wan(), &topology).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::FanOutFailed { ref failures, .. } if failures.len() == 4));
        assert!(shell.runs_matching("keygen").is_empty());
    }
}
