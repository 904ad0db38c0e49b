//! Cluster creation and teardown against the cloud providers.
//!
//! A spawn builds the topology in memory, creates the shared LAN network
//! once, then creates every machine concurrently. The topology file is only
//! written after every machine has reached [`MachineStage::Ready`].

use chrono::Utc;
use cloud::{lookup_location, CloudProvider, InstanceRef, MachineSpec, NetworkHandle};
use clusterbench_core::{for_each_mut, Cluster, CoreError, ImageKind, LocationRegistry, WanSetup};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{collect, OrchestratorError, Result};

/// Progress of one machine through a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MachineStage {
    Requested,
    NetworkAllocated,
    Provisioned,
    Ready,
}

impl MachineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::NetworkAllocated => "network_allocated",
            Self::Provisioned => "provisioned",
            Self::Ready => "ready",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Requested => Some(Self::NetworkAllocated),
            Self::NetworkAllocated => Some(Self::Provisioned),
            Self::Provisioned => Some(Self::Ready),
            Self::Ready => None,
        }
    }

    /// Move to `to`, which must be the stage directly after this one.
    pub fn advance(self, to: Self) -> Result<Self> {
        if self.next() == Some(to) {
            Ok(to)
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

/// Shape of a cluster to spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub num_lan_machines: usize,
    pub wan_locations: Vec<String>,
    pub setup: WanSetup,
    pub image: ImageKind,
    pub large_work_disk: bool,
}

impl SpawnRequest {
    pub fn new(name: impl Into<String>, num_lan_machines: usize) -> Self {
        Self {
            name: name.into(),
            num_lan_machines,
            wan_locations: Vec::new(),
            setup: WanSetup::Regular,
            image: ImageKind::Ubuntu,
            large_work_disk: false,
        }
    }

    pub fn with_wan_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wan_locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_setup(mut self, setup: WanSetup) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_image(mut self, image: ImageKind) -> Self {
        self.image = image;
        self
    }

    pub fn with_large_work_disk(mut self, enabled: bool) -> Self {
        self.large_work_disk = enabled;
        self
    }

    /// Reject requests that could never produce a valid topology.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid("cluster name must not be empty").into());
        }
        if self.num_lan_machines == 0 {
            return Err(CoreError::invalid("a cluster needs at least one LAN machine").into());
        }
        let mut seen = HashSet::new();
        for location in &self.wan_locations {
            if !seen.insert(location.as_str()) {
                return Err(CoreError::invalid(format!(
                    "WAN location {} is repeated",
                    location
                ))
                .into());
            }
            if lookup_location(location).is_none() {
                return Err(CoreError::UnknownLocation(location.clone()).into());
            }
        }
        if self.large_work_disk && !self.wan_locations.is_empty() {
            return Err(CoreError::invalid(
                "a large work disk cannot be combined with WAN machines",
            )
            .into());
        }
        Ok(())
    }

    fn machines_per_location(&self) -> usize {
        if self.setup.is_paired() {
            self.num_lan_machines
        } else {
            1
        }
    }

    /// Empty topology with every machine's id fixed.
    pub fn topology(&self) -> Cluster {
        let size = self.num_lan_machines + self.wan_locations.len() * self.machines_per_location();
        Cluster::create(&self.name, size)
            .with_lan_machines(self.num_lan_machines)
            .with_setup(self.setup)
    }

    /// One spec per global id, in id order.
    pub fn machine_specs(&self) -> Vec<MachineSpec> {
        let mut specs: Vec<MachineSpec> = (0..self.num_lan_machines)
            .map(|id| {
                MachineSpec::lan(id, self.image, self.setup)
                    .with_large_work_disk(self.large_work_disk)
            })
            .collect();
        let per_location = self.machines_per_location();
        for (index, location) in self.wan_locations.iter().enumerate() {
            let first = self.num_lan_machines + index * per_location;
            specs.extend((0..per_location).map(|offset| {
                MachineSpec::wan(first + offset, location.as_str(), offset, self.setup)
                    .with_image(self.image)
            }));
        }
        specs
    }
}

/// Default cluster name, derived from this machine's hostname.
pub fn default_cluster_name() -> String {
    let host = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "local".to_string());
    format!("clusterbench-{}", host)
}

/// Load a topology, reporting a missing file as [`OrchestratorError::TopologyMissing`].
pub fn load_topology(path: &Path) -> Result<Cluster> {
    match Cluster::load_from_file(path) {
        Ok(cluster) => Ok(cluster),
        Err(CoreError::NotFound(_)) => Err(OrchestratorError::TopologyMissing(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

/// Creates and destroys clusters through one LAN and one WAN provider.
pub struct Provisioner {
    lan: Arc<dyn CloudProvider>,
    wan: Arc<dyn CloudProvider>,
}

impl Provisioner {
    pub fn new(lan: Arc<dyn CloudProvider>, wan: Arc<dyn CloudProvider>) -> Self {
        Self { lan, wan }
    }

    /// Spawn the cluster described by `request` and persist it to `topology_path`.
    pub async fn spawn(&self, request: &SpawnRequest, topology_path: &Path) -> Result<Cluster> {
        if topology_path.exists() {
            return Err(OrchestratorError::TopologyExists(
                topology_path.to_path_buf(),
            ));
        }
        request.validate()?;

        let mut cluster = request.topology();
        let specs = request.machine_specs();
        info!(
            cluster = %request.name,
            lan = request.num_lan_machines,
            wan = cluster.wan_ids().len(),
            setup = %request.setup,
            "Spawning cluster"
        );

        let lan_network = self.lan.ensure_network(&request.name).await?;
        cluster.lan_network = lan_network.clone().into();
        let wan_network = if request.wan_locations.is_empty() {
            NetworkHandle::default()
        } else {
            self.wan.ensure_network(&request.name).await?
        };

        let registry = LocationRegistry::new();
        let name = request.name.as_str();
        let specs = &specs;
        let registry_ref = &registry;
        let (lan, wan) = (self.lan.as_ref(), self.wan.as_ref());
        let (lan_network, wan_network) = (&lan_network, &wan_network);

        let ids: Vec<usize> = (0..specs.len()).collect();
        let results = for_each_mut(&mut cluster.machines, &ids, move |machine, id| async move {
            let spec = &specs[id];
            let (provider, network) = match &spec.location {
                Some(location) => {
                    if spec.location_offset == 0 {
                        registry_ref.register(location, id)?;
                    }
                    (wan, wan_network)
                }
                None => (lan, lan_network),
            };

            let mut stage = MachineStage::Requested;
            let interface = provider.allocate_interface(name, spec, network).await?;
            interface.apply(machine);
            stage = stage.advance(MachineStage::NetworkAllocated)?;
            debug!(machine_id = id, stage = stage.as_str(), "Machine advanced");

            let instance = provider
                .create_instance(name, spec, network, &interface)
                .await?;
            instance.apply(machine);
            machine.provider = Some(provider.provider());
            machine.image = Some(spec.image);
            stage = stage.advance(MachineStage::Provisioned)?;
            debug!(machine_id = id, stage = stage.as_str(), "Machine advanced");

            if !machine.is_ready() {
                return Err(OrchestratorError::from(CoreError::NotFound(format!(
                    "machine {} was created without an address",
                    id
                ))));
            }
            stage.advance(MachineStage::Ready)
        })
        .await?;

        if let Err(e) = collect("spawn", results) {
            warn!(
                cluster = %request.name,
                "Spawn failed; created resources remain until the cluster is purged"
            );
            return Err(e);
        }

        cluster.location_to_id = registry.into_map()?;
        cluster.spawned_at = Some(Utc::now());
        cluster.save_to_file(topology_path)?;
        info!(cluster = %cluster.name, machines = cluster.len(), path = %topology_path.display(), "Cluster spawned");
        Ok(cluster)
    }

    /// Delete every resource of the cluster in `topology_path`, then the file itself.
    pub async fn deallocate(&self, topology_path: &Path) -> Result<()> {
        let cluster = load_topology(topology_path)?;
        info!(cluster = %cluster.name, "Deallocating cluster");

        let wan_instances: Vec<InstanceRef> = cluster
            .wan_ids()
            .filter_map(|id| InstanceRef::from_machine(&cluster.machines[id]))
            .collect();

        let lan = async {
            if cluster.num_lan_machines > 0 {
                self.lan.delete_all(&cluster.name, &[], true).await
            } else {
                Ok(false)
            }
        };
        let wan = self.wan.delete_all(&cluster.name, &wan_instances, false);
        let (lan, wan) = futures::join!(lan, wan);
        collect("deallocate", vec![("LAN", lan), ("WAN", wan)])?;

        Cluster::discard_file(topology_path)?;
        info!(cluster = %cluster.name, "Cluster deallocated");
        Ok(())
    }

    /// Best-effort teardown by name, for clusters whose topology file is lost.
    pub async fn purge(&self, name: &str, topology_path: &Path) -> Result<()> {
        info!(cluster = name, "Purging cluster");

        let lan = self.lan.delete_all(name, &[], false);
        let wan = async {
            let instances = self.wan.list_instances(name).await?;
            self.wan.delete_all(name, &instances, false).await
        };
        let (lan, wan) = futures::join!(lan, wan);
        collect("purge", vec![("LAN", lan), ("WAN", wan)])?;

        if Cluster::discard_file(topology_path)? {
            debug!(path = %topology_path.display(), "Removed stale topology file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud::mock::CountingProvider;
    use clusterbench_core::Provider;
    use tempfile::TempDir;

    fn provisioner() -> (Arc<CountingProvider>, Arc<CountingProvider>, Provisioner) {
        let lan = Arc::new(CountingProvider::lan());
        let wan = Arc::new(CountingProvider::wan());
        let provisioner = Provisioner::new(lan.clone(), wan.clone());
        (lan, wan, provisioner)
    }

    #[test]
    fn test_stage_transitions() {
        let stage = MachineStage::Requested;
        let stage = stage.advance(MachineStage::NetworkAllocated).unwrap();
        assert!(stage.advance(MachineStage::Ready).is_err());
        assert!(MachineStage::Ready.next().is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(SpawnRequest::new("bench", 0).validate().is_err());
        assert!(SpawnRequest::new("bench", 2)
            .with_wan_locations(["oregon", "oregon"])
            .validate()
            .is_err());
        assert!(matches!(
            SpawnRequest::new("bench", 2)
                .with_wan_locations(["mars"])
                .validate(),
            Err(OrchestratorError::Core(CoreError::UnknownLocation(_)))
        ));
        assert!(SpawnRequest::new("bench", 2)
            .with_wan_locations(["iowa"])
            .with_large_work_disk(true)
            .validate()
            .is_err());
        assert!(SpawnRequest::new("bench", 2)
            .with_wan_locations(["iowa", "virginia"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_paired_specs() {
        let request = SpawnRequest::new("bench", 2)
            .with_wan_locations(["oregon", "iowa"])
            .with_setup(WanSetup::PairedSwap);
        let specs = request.machine_specs();
        assert_eq!(specs.len(), 6);
        assert_eq!(request.topology().len(), 6);
        assert_eq!(specs[4].location.as_deref(), Some("iowa"));
        assert_eq!(specs[5].location_offset, 1);
        assert!(specs.iter().enumerate().all(|(i, s)| s.id == i));
    }

    #[tokio::test]
    async fn test_spawn_writes_complete_topology() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        let (lan, wan, provisioner) = provisioner();

        let request = SpawnRequest::new("bench", 2).with_wan_locations(["oregon", "iowa"]);
        let cluster = provisioner.spawn(&request, &path).await.unwrap();

        assert_eq!(cluster.len(), 4);
        assert_eq!(cluster.location_to_id.get("oregon"), Some(&2));
        assert_eq!(cluster.location_to_id.get("iowa"), Some(&3));
        assert!(cluster.machines.iter().all(|m| m.is_ready()));
        assert_eq!(cluster.machines[3].provider, Some(Provider::Remote));
        assert!(cluster.lan_network.subnet_id.is_some());
        assert_eq!(lan.created().len(), 2);
        assert_eq!(wan.created().len(), 2);

        let restored = Cluster::load_from_file(&path).unwrap();
        assert_eq!(restored, cluster);
    }

    #[tokio::test]
    async fn test_spawn_over_existing_topology_makes_no_calls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, "{}").unwrap();
        let (lan, wan, provisioner) = provisioner();

        let err = provisioner
            .spawn(&SpawnRequest::new("bench", 2), &path)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(lan.call_count() + wan.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_machine_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        let lan = Arc::new(CountingProvider::lan().failing_on(1));
        let provisioner = Provisioner::new(lan.clone(), Arc::new(CountingProvider::wan()));

        let err = provisioner
            .spawn(&SpawnRequest::new("bench", 3), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::FanOutFailed { ref failures, .. } if failures.len() == 1));
        assert_eq!(lan.created().len(), 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_deallocate_removes_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        let (lan, wan, provisioner) = provisioner();
        let request = SpawnRequest::new("bench", 2).with_wan_locations(["virginia"]);
        provisioner.spawn(&request, &path).await.unwrap();

        provisioner.deallocate(&path).await.unwrap();
        assert!(!path.exists());
        assert_eq!(lan.deleted(), vec!["bench".to_string()]);
        assert!(wan.deleted().contains(&"bench-virginia-0".to_string()));

        assert!(matches!(
            provisioner.deallocate(&path).await,
            Err(OrchestratorError::TopologyMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_without_topology() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        let (_, _, provisioner) = provisioner();
        provisioner.purge("bench", &path).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_leaves_clusters_sharing_the_name_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        let lan = Arc::new(CountingProvider::lan());
        let wan = Arc::new(CountingProvider::wan().with_instances([
            "bench-oregon",
            "bench-iowa-1",
            "bench-prod-oregon",
            "bench-prod-iowa-2",
            "benchmark-virginia",
        ]));
        let provisioner = Provisioner::new(lan, wan.clone());

        provisioner.purge("bench", &path).await.unwrap();

        let deleted = wan.deleted();
        assert!(deleted.contains(&"bench-oregon".to_string()));
        assert!(deleted.contains(&"bench-iowa-1".to_string()));
        assert_eq!(
            wan.running(),
            vec!["bench-prod-oregon", "bench-prod-iowa-2", "benchmark-virginia"]
        );
    }
}
