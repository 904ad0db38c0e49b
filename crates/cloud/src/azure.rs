use async_trait::async_trait;
use clusterbench_core::{ImageKind, Provider, WanSetup};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::command::{args, optional_string_at, run, run_json, string_at};
use crate::error::{CloudError, Result};
use crate::naming;
use crate::traits::CloudProvider;
use crate::types::{InstanceHandles, InstanceRef, InterfaceHandles, MachineSpec, NetworkHandle};

const AZ: &str = "az";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Subscription to bill; the CLI's active subscription when unset
    pub subscription: Option<String>,
    pub location: String,
    /// Image reference for stock machines
    pub base_image: String,
    /// Image id with benchmark dependencies preinstalled
    pub prebuilt_image: Option<String>,
    pub vm_size: String,
    pub zone: String,
    pub admin_username: String,
    pub ssh_public_key: PathBuf,
    /// Cloud-init file for regular clusters
    pub cloud_init: Option<PathBuf>,
    /// Cloud-init file for paired clusters that keep swap off the work disk
    pub paired_cloud_init: Option<PathBuf>,
    pub work_disk_size_gb: u32,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription: None,
            location: "westus2".to_string(),
            base_image: "Ubuntu2204".to_string(),
            prebuilt_image: None,
            vm_size: "Standard_D16d_v4".to_string(),
            zone: "2".to_string(),
            admin_username: "bench".to_string(),
            ssh_public_key: PathBuf::from("bench.pub"),
            cloud_init: None,
            paired_cloud_init: None,
            work_disk_size_gb: 8192,
        }
    }
}

impl AzureConfig {
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_prebuilt_image(mut self, image: impl Into<String>) -> Self {
        self.prebuilt_image = Some(image.into());
        self
    }

    fn image_for(&self, kind: ImageKind) -> Result<&str> {
        match kind {
            ImageKind::Ubuntu => Ok(&self.base_image),
            ImageKind::Prebuilt => self.prebuilt_image.as_deref().ok_or_else(|| {
                CloudError::Config("azure.prebuilt_image is required for prebuilt machines".into())
            }),
        }
    }

    fn cloud_init_for(&self, setup: WanSetup) -> Option<&PathBuf> {
        match setup {
            WanSetup::PairedNoSwap => self.paired_cloud_init.as_ref().or(self.cloud_init.as_ref()),
            _ => self.cloud_init.as_ref(),
        }
    }
}

/// LAN provider backed by the `az` CLI.
///
/// All resources of a cluster live in one resource group, so deleting the
/// group tears the whole LAN side down.
pub struct AzureCli {
    config: AzureConfig,
}

impl AzureCli {
    pub fn new(config: AzureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AzureConfig {
        &self.config
    }

    /// Append the subscription and JSON output flags every call shares.
    fn finish(&self, mut args: Vec<String>) -> Vec<String> {
        if let Some(subscription) = &self.config.subscription {
            args.push("--subscription".to_string());
            args.push(subscription.clone());
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }

    pub(crate) fn nsg_rule_args(&self, cluster: &str, rule: &str, priority: u32, ports: &str) -> Vec<String> {
        self.finish(args([
            "network",
            "nsg",
            "rule",
            "create",
            "--resource-group",
            &naming::resource_group_name(cluster),
            "--nsg-name",
            &naming::nsg_name(cluster),
            "--name",
            &format!("{}-{}", cluster, rule),
            "--priority",
            &priority.to_string(),
            "--protocol",
            "Tcp",
            "--direction",
            "Inbound",
            "--access",
            "Allow",
            "--destination-port-ranges",
            ports,
        ]))
    }

    pub(crate) fn vm_create_args(
        &self,
        cluster: &str,
        spec: &MachineSpec,
        nic_id: &str,
    ) -> Result<Vec<String>> {
        let vm = naming::vm_name(cluster, spec.id);
        let mut list = args([
            "vm",
            "create",
            "--resource-group",
            &naming::resource_group_name(cluster),
            "--name",
            &vm,
            "--computer-name",
            &vm,
            "--location",
            &self.config.location,
            "--zone",
            &self.config.zone,
            "--size",
            &self.config.vm_size,
            "--image",
            self.config.image_for(spec.image)?,
            "--nics",
            nic_id,
            "--admin-username",
            &self.config.admin_username,
            "--ssh-key-values",
            &self.config.ssh_public_key.display().to_string(),
        ]);
        if let Some(cloud_init) = self.config.cloud_init_for(spec.setup) {
            list.push("--custom-data".to_string());
            list.push(cloud_init.display().to_string());
        }
        if spec.large_work_disk {
            list.push("--data-disk-sizes-gb".to_string());
            list.push(self.config.work_disk_size_gb.to_string());
        }
        Ok(self.finish(list))
    }
}

#[async_trait]
impl CloudProvider for AzureCli {
    fn name(&self) -> &'static str {
        AZ
    }

    fn provider(&self) -> Provider {
        Provider::Local
    }

    async fn is_available(&self) -> bool {
        which::which(AZ).is_ok()
    }

    async fn cluster_exists(&self, cluster_name: &str) -> Result<bool> {
        let value = run_json(
            AZ,
            &self.finish(args([
                "group",
                "exists",
                "--name",
                &naming::resource_group_name(cluster_name),
            ])),
        )
        .await?;
        value
            .as_bool()
            .ok_or_else(|| CloudError::Parse(format!("az group exists returned {}", value)))
    }

    async fn ensure_network(&self, cluster_name: &str) -> Result<NetworkHandle> {
        if self.cluster_exists(cluster_name).await? {
            return Err(CloudError::ResourceGroupExists(cluster_name.to_string()));
        }
        let group = naming::resource_group_name(cluster_name);
        let location = self.config.location.as_str();
        info!(resource_group = %group, location, "Creating LAN network");

        let rg = run_json(
            AZ,
            &self.finish(args(["group", "create", "--name", &group, "--location", location])),
        )
        .await?;

        let vnet = run_json(
            AZ,
            &self.finish(args([
                "network",
                "vnet",
                "create",
                "--resource-group",
                &group,
                "--name",
                &naming::vnet_name(cluster_name),
                "--location",
                location,
                "--address-prefixes",
                "10.0.0.0/24",
            ])),
        )
        .await?;

        let nsg = run_json(
            AZ,
            &self.finish(args([
                "network",
                "nsg",
                "create",
                "--resource-group",
                &group,
                "--name",
                &naming::nsg_name(cluster_name),
                "--location",
                location,
            ])),
        )
        .await?;
        run(AZ, &self.nsg_rule_args(cluster_name, "ssh", 300, "22")).await?;
        run(AZ, &self.nsg_rule_args(cluster_name, "wan", 301, "40000-65535")).await?;

        let subnet = run_json(
            AZ,
            &self.finish(args([
                "network",
                "vnet",
                "subnet",
                "create",
                "--resource-group",
                &group,
                "--vnet-name",
                &naming::vnet_name(cluster_name),
                "--name",
                &naming::subnet_name(cluster_name),
                "--address-prefixes",
                "10.0.0.0/26",
                "--network-security-group",
                &naming::nsg_name(cluster_name),
            ])),
        )
        .await?;

        Ok(NetworkHandle {
            resource_group_id: Some(string_at(&rg, "/id")?),
            vnet_id: Some(string_at(&vnet, "/newVNet/id")?),
            nsg_id: Some(string_at(&nsg, "/NewNSG/id")?),
            subnet_id: Some(string_at(&subnet, "/id")?),
        })
    }

    async fn allocate_interface(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        network: &NetworkHandle,
    ) -> Result<InterfaceHandles> {
        let group = naming::resource_group_name(cluster_name);
        let subnet_id = network.subnet_id.as_deref().ok_or_else(|| {
            CloudError::Config(format!("cluster {} has no subnet", cluster_name))
        })?;
        let ip_name = naming::public_ip_name(cluster_name, spec.id);
        debug!(machine_id = spec.id, "Allocating public address and interface");

        let ip = run_json(
            AZ,
            &self.finish(args([
                "network",
                "public-ip",
                "create",
                "--resource-group",
                &group,
                "--name",
                &ip_name,
                "--location",
                &self.config.location,
                "--sku",
                "Standard",
                "--allocation-method",
                "Static",
                "--version",
                "IPv4",
            ])),
        )
        .await?;

        let nic = run_json(
            AZ,
            &self.finish(args([
                "network",
                "nic",
                "create",
                "--resource-group",
                &group,
                "--name",
                &naming::nic_name(cluster_name, spec.id),
                "--location",
                &self.config.location,
                "--subnet",
                subnet_id,
                "--public-ip-address",
                &ip_name,
                "--accelerated-networking",
                "true",
            ])),
        )
        .await?;

        Ok(InterfaceHandles {
            public_ip_address: Some(string_at(&ip, "/publicIp/ipAddress")?),
            public_ip_address_id: Some(string_at(&ip, "/publicIp/id")?),
            nic_id: Some(string_at(&nic, "/NewNIC/id")?),
            ip_configuration_id: optional_string_at(&nic, "/NewNIC/ipConfigurations/0/id"),
            private_ip_address: Some(string_at(
                &nic,
                "/NewNIC/ipConfigurations/0/privateIPAddress",
            )?),
        })
    }

    async fn create_instance(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        _network: &NetworkHandle,
        interface: &InterfaceHandles,
    ) -> Result<InstanceHandles> {
        let nic_id = interface.nic_id.as_deref().ok_or_else(|| {
            CloudError::Config(format!("machine {} has no network interface", spec.id))
        })?;
        let vm = naming::vm_name(cluster_name, spec.id);
        debug!(machine_id = spec.id, vm = %vm, "Creating instance");

        let created = run_json(AZ, &self.vm_create_args(cluster_name, spec, nic_id)?).await?;
        let shown = run_json(
            AZ,
            &self.finish(args([
                "vm",
                "show",
                "--resource-group",
                &naming::resource_group_name(cluster_name),
                "--name",
                &vm,
            ])),
        )
        .await?;

        instance_handles(vm, &created, &shown, spec.large_work_disk)
    }

    async fn list_instances(&self, cluster_name: &str) -> Result<Vec<InstanceRef>> {
        if !self.cluster_exists(cluster_name).await? {
            return Ok(Vec::new());
        }
        let value = run_json(
            AZ,
            &self.finish(args([
                "vm",
                "list",
                "--resource-group",
                &naming::resource_group_name(cluster_name),
            ])),
        )
        .await?;
        let vms = value
            .as_array()
            .ok_or_else(|| CloudError::Parse("az vm list did not return a list".into()))?;
        vms.iter()
            .map(|vm| {
                Ok(InstanceRef {
                    name: string_at(vm, "/name")?,
                    zone: optional_string_at(vm, "/zones/0"),
                })
            })
            .collect()
    }

    async fn delete_all(
        &self,
        cluster_name: &str,
        _instances: &[InstanceRef],
        error_if_missing: bool,
    ) -> Result<bool> {
        if !self.cluster_exists(cluster_name).await? {
            if error_if_missing {
                return Err(CloudError::ResourceGroupMissing(cluster_name.to_string()));
            }
            debug!(cluster = cluster_name, "No resource group to delete");
            return Ok(false);
        }

        let group = naming::resource_group_name(cluster_name);
        info!(resource_group = %group, "Deleting resource group");
        let mut list = args(["group", "delete", "--name", &group, "--yes"]);
        if let Some(subscription) = &self.config.subscription {
            list.push("--subscription".to_string());
            list.push(subscription.clone());
        }
        run(AZ, &list).await?;
        Ok(true)
    }
}

/// Handles of a VM from the output of `az vm create` and `az vm show`.
fn instance_handles(
    vm: String,
    created: &Value,
    shown: &Value,
    large_work_disk: bool,
) -> Result<InstanceHandles> {
    Ok(InstanceHandles {
        vm_id: Some(string_at(created, "/id")?),
        vm_name: Some(vm),
        disk_name: optional_string_at(shown, "/storageProfile/osDisk/name"),
        work_disk_name: if large_work_disk {
            optional_string_at(shown, "/storageProfile/dataDisks/0/name")
        } else {
            None
        },
        zone: optional_string_at(created, "/zones/0")
            .or_else(|| optional_string_at(shown, "/zones/0")),
        public_ip_address: None,
        private_ip_address: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_create_args() {
        let cli = AzureCli::new(
            AzureConfig::default()
                .with_subscription("sub-1")
                .with_prebuilt_image("/images/bench-deps"),
        );
        let spec = MachineSpec::lan(3, ImageKind::Prebuilt, WanSetup::Regular)
            .with_large_work_disk(true);
        let list = cli.vm_create_args("bench", &spec, "/nics/bench-3-nic").unwrap();

        let value_of = |flag: &str| {
            list.iter()
                .position(|a| a == flag)
                .map(|i| list[i + 1].as_str())
        };
        assert_eq!(value_of("--name"), Some("bench-3"));
        assert_eq!(value_of("--image"), Some("/images/bench-deps"));
        assert_eq!(value_of("--nics"), Some("/nics/bench-3-nic"));
        assert_eq!(value_of("--data-disk-sizes-gb"), Some("8192"));
        assert_eq!(value_of("--subscription"), Some("sub-1"));
        assert_eq!(value_of("--output"), Some("json"));
        assert!(value_of("--custom-data").is_none());
    }

    #[test]
    fn test_instance_handles_reads_first_zone() {
        let created = serde_json::json!({ "id": "/vms/bench-0", "zones": ["2"] });
        let shown = serde_json::json!({
            "storageProfile": {
                "osDisk": { "name": "bench-0-osdisk" },
                "dataDisks": [{ "name": "bench-0-wdisk" }]
            }
        });
        let handles = instance_handles("bench-0".into(), &created, &shown, true).unwrap();
        assert_eq!(handles.zone.as_deref(), Some("2"));
        assert_eq!(handles.work_disk_name.as_deref(), Some("bench-0-wdisk"));

        let created = serde_json::json!({ "id": "/vms/bench-1" });
        let shown = serde_json::json!({ "zones": ["3"] });
        let handles = instance_handles("bench-1".into(), &created, &shown, false).unwrap();
        assert_eq!(handles.zone.as_deref(), Some("3"));
        assert!(handles.work_disk_name.is_none());
    }

    #[test]
    fn test_prebuilt_image_requires_config() {
        let cli = AzureCli::new(AzureConfig::default());
        let spec = MachineSpec::lan(0, ImageKind::Prebuilt, WanSetup::Regular);
        assert!(matches!(
            cli.vm_create_args("bench", &spec, "nic"),
            Err(CloudError::Config(_))
        ));
    }

    #[test]
    fn test_paired_cloud_init() {
        let mut config = AzureConfig::default();
        config.cloud_init = Some(PathBuf::from("init.yaml"));
        config.paired_cloud_init = Some(PathBuf::from("init-paired.yaml"));
        assert_eq!(
            config.cloud_init_for(WanSetup::PairedNoSwap),
            Some(&PathBuf::from("init-paired.yaml"))
        );
        assert_eq!(
            config.cloud_init_for(WanSetup::PairedSwap),
            Some(&PathBuf::from("init.yaml"))
        );
    }

    #[test]
    fn test_nsg_rule_args() {
        let cli = AzureCli::new(AzureConfig::default());
        let list = cli.nsg_rule_args("bench", "wan", 301, "40000-65535");
        assert!(list.contains(&"bench-wan".to_string()));
        assert!(list.contains(&"40000-65535".to_string()));
        assert!(list.contains(&"bench-nsg".to_string()));
    }
}
