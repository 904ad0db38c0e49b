use async_trait::async_trait;
use clusterbench_core::{ImageKind, Provider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::command::{args, optional_string_at, run, run_json, string_at};
use crate::error::{CloudError, Result};
use crate::naming::{self, WanLocation};
use crate::traits::CloudProvider;
use crate::types::{InstanceHandles, InstanceRef, InterfaceHandles, MachineSpec, NetworkHandle};

const GCLOUD: &str = "gcloud";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcloudConfig {
    /// Project to create instances in; the CLI's active project when unset
    pub project: Option<String>,
    pub machine_type: String,
    pub base_image_family: String,
    pub base_image_project: String,
    pub prebuilt_image_family: String,
    /// Project owning the prebuilt image family; defaults to `project`
    pub prebuilt_image_project: Option<String>,
    /// Network tag matched by the firewall rule opening the benchmark ports
    pub network_tag: String,
    pub boot_disk_size_gb: u32,
    /// File of `user:key` lines installed as the instance's ssh keys
    pub ssh_keys_file: Option<PathBuf>,
    pub cloud_init: Option<PathBuf>,
}

impl Default for GcloudConfig {
    fn default() -> Self {
        Self {
            project: None,
            machine_type: "n2-highcpu-2".to_string(),
            base_image_family: "ubuntu-2004-lts".to_string(),
            base_image_project: "ubuntu-os-cloud".to_string(),
            prebuilt_image_family: "bench-deps".to_string(),
            prebuilt_image_project: None,
            network_tag: "bench-wan".to_string(),
            boot_disk_size_gb: 10,
            ssh_keys_file: None,
            cloud_init: None,
        }
    }
}

impl GcloudConfig {
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }
}

/// WAN provider backed by the `gcloud` CLI.
///
/// WAN instances use the provider's default network and receive their
/// addresses when the instance is created, so there is no separate network
/// or interface step.
pub struct GcloudCli {
    config: GcloudConfig,
}

impl GcloudCli {
    pub fn new(config: GcloudConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GcloudConfig {
        &self.config
    }

    fn finish(&self, mut list: Vec<String>) -> Vec<String> {
        if let Some(project) = &self.config.project {
            list.push("--project".to_string());
            list.push(project.clone());
        }
        list.push("--format".to_string());
        list.push("json".to_string());
        list
    }

    fn location(spec: &MachineSpec) -> Result<&'static WanLocation> {
        let name = spec.location.as_deref().ok_or_else(|| {
            CloudError::UnknownLocation(format!("machine {} has no WAN location", spec.id))
        })?;
        naming::lookup_location(name).ok_or_else(|| CloudError::UnknownLocation(name.to_string()))
    }

    pub(crate) fn instance_name(cluster: &str, spec: &MachineSpec) -> Result<String> {
        let location = Self::location(spec)?;
        let offset = spec.setup.is_paired().then_some(spec.location_offset);
        Ok(naming::wan_instance_name(cluster, location.name, offset))
    }

    pub(crate) fn create_args(&self, cluster: &str, spec: &MachineSpec) -> Result<Vec<String>> {
        let location = Self::location(spec)?;
        let (family, image_project) = match spec.image {
            ImageKind::Ubuntu => (
                self.config.base_image_family.clone(),
                self.config.base_image_project.clone(),
            ),
            ImageKind::Prebuilt => (
                self.config.prebuilt_image_family.clone(),
                self.config
                    .prebuilt_image_project
                    .clone()
                    .or_else(|| self.config.project.clone())
                    .ok_or_else(|| {
                        CloudError::Config(
                            "gcloud.prebuilt_image_project or gcloud.project is required for prebuilt machines"
                                .into(),
                        )
                    })?,
            ),
        };

        let mut list = args([
            "compute",
            "instances",
            "create",
            &Self::instance_name(cluster, spec)?,
            "--zone",
            &location.zone(),
            "--machine-type",
            &self.config.machine_type,
            "--image-family",
            &family,
            "--image-project",
            &image_project,
            "--boot-disk-size",
            &format!("{}GB", self.config.boot_disk_size_gb),
            "--boot-disk-type",
            "pd-standard",
            "--local-ssd",
            "interface=NVME",
            "--tags",
            &self.config.network_tag,
        ]);

        let mut metadata = Vec::new();
        if let Some(keys) = &self.config.ssh_keys_file {
            metadata.push(format!("ssh-keys={}", keys.display()));
        }
        if let Some(cloud_init) = &self.config.cloud_init {
            metadata.push(format!("user-data={}", cloud_init.display()));
        }
        if !metadata.is_empty() {
            list.push("--metadata-from-file".to_string());
            list.push(metadata.join(","));
        }
        Ok(self.finish(list))
    }

    fn zone_of(instance: &Value) -> Option<String> {
        optional_string_at(instance, "/zone")
            .map(|url| url.rsplit('/').next().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl CloudProvider for GcloudCli {
    fn name(&self) -> &'static str {
        GCLOUD
    }

    fn provider(&self) -> Provider {
        Provider::Remote
    }

    async fn is_available(&self) -> bool {
        which::which(GCLOUD).is_ok()
    }

    async fn cluster_exists(&self, cluster_name: &str) -> Result<bool> {
        Ok(!self.list_instances(cluster_name).await?.is_empty())
    }

    async fn ensure_network(&self, _cluster_name: &str) -> Result<NetworkHandle> {
        Ok(NetworkHandle::default())
    }

    async fn allocate_interface(
        &self,
        _cluster_name: &str,
        _spec: &MachineSpec,
        _network: &NetworkHandle,
    ) -> Result<InterfaceHandles> {
        Ok(InterfaceHandles::default())
    }

    async fn create_instance(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        _network: &NetworkHandle,
        _interface: &InterfaceHandles,
    ) -> Result<InstanceHandles> {
        let list = self.create_args(cluster_name, spec)?;
        info!(machine_id = spec.id, location = ?spec.location, "Creating WAN instance");

        let value = run_json(GCLOUD, &list).await?;
        let instance = value
            .as_array()
            .and_then(|created| created.first())
            .unwrap_or(&value);

        Ok(InstanceHandles {
            vm_id: Some(string_at(instance, "/id")?),
            vm_name: Some(string_at(instance, "/name")?),
            disk_name: optional_string_at(instance, "/disks/0/deviceName"),
            work_disk_name: None,
            zone: Self::zone_of(instance),
            public_ip_address: Some(string_at(
                instance,
                "/networkInterfaces/0/accessConfigs/0/natIP",
            )?),
            private_ip_address: Some(string_at(instance, "/networkInterfaces/0/networkIP")?),
        })
    }

    async fn list_instances(&self, cluster_name: &str) -> Result<Vec<InstanceRef>> {
        let value = run_json(
            GCLOUD,
            &self.finish(args([
                "compute",
                "instances",
                "list",
                "--filter",
                &naming::wan_instance_filter(cluster_name),
            ])),
        )
        .await?;
        let instances = value
            .as_array()
            .ok_or_else(|| CloudError::Parse("gcloud instances list did not return a list".into()))?;

        let mut found = Vec::new();
        for instance in instances {
            let name = string_at(instance, "/name")?;
            if naming::is_wan_instance_of(cluster_name, &name) {
                found.push(InstanceRef {
                    name,
                    zone: Self::zone_of(instance),
                });
            }
        }
        Ok(found)
    }

    async fn delete_all(
        &self,
        cluster_name: &str,
        instances: &[InstanceRef],
        error_if_missing: bool,
    ) -> Result<bool> {
        if instances.is_empty() {
            debug!(cluster = cluster_name, "No WAN instances to delete");
            return Ok(false);
        }

        let mut deleted = false;
        for instance in instances {
            let zone = instance.zone.as_deref().ok_or_else(|| {
                CloudError::Config(format!("instance {} has no zone", instance.name))
            })?;
            info!(instance = %instance.name, zone, "Deleting WAN instance");

            let mut list = args([
                "compute",
                "instances",
                "delete",
                &instance.name,
                "--zone",
                zone,
                "--quiet",
            ]);
            if let Some(project) = &self.config.project {
                list.push("--project".to_string());
                list.push(project.clone());
            }
            match run(GCLOUD, &list).await {
                Ok(_) => deleted = true,
                Err(e) if !error_if_missing => {
                    warn!(instance = %instance.name, error = %e, "Could not delete WAN instance");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
