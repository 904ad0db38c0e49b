//! In-memory [`CloudProvider`] that counts calls, for tests.

use async_trait::async_trait;
use clusterbench_core::Provider;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CloudError, Result};
use crate::naming;
use crate::traits::CloudProvider;
use crate::types::{InstanceHandles, InstanceRef, InterfaceHandles, MachineSpec, NetworkHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CountingProvider {
    provider: Provider,
    calls: AtomicUsize,
    existing: Mutex<BTreeSet<String>>,
    failing_ids: HashSet<usize>,
    created: Mutex<Vec<usize>>,
    instances: Mutex<Vec<InstanceRef>>,
    deleted: Mutex<Vec<String>>,
}

impl CountingProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            calls: AtomicUsize::new(0),
            existing: Mutex::new(BTreeSet::new()),
            failing_ids: HashSet::new(),
            created: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn lan() -> Self {
        Self::new(Provider::Local)
    }

    pub fn wan() -> Self {
        Self::new(Provider::Remote)
    }

    /// Pretend the resources of `cluster` already exist.
    pub fn with_existing(self, cluster: impl Into<String>) -> Self {
        lock(&self.existing).insert(cluster.into());
        self
    }

    /// Pretend instances with these names are running, whichever cluster owns them.
    pub fn with_instances<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.instances).extend(names.into_iter().map(|name| InstanceRef {
            name: name.into(),
            zone: Some("test-zone".to_string()),
        }));
        self
    }

    /// Names of the instances still running.
    pub fn running(&self) -> Vec<String> {
        lock(&self.instances).iter().map(|i| i.name.clone()).collect()
    }

    /// Fail instance creation for machine `id`.
    pub fn failing_on(mut self, id: usize) -> Self {
        self.failing_ids.insert(id);
        self
    }

    /// Every call made through the trait so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Machine ids whose instances were created, in completion order.
    pub fn created(&self) -> Vec<usize> {
        lock(&self.created).clone()
    }

    /// Instance names passed to `delete_all`, plus one entry per cluster deleted.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn octet(&self) -> &'static str {
        match self.provider {
            Provider::Local => "203.0.113",
            Provider::Remote => "198.51.100",
        }
    }
}

#[async_trait]
impl CloudProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn cluster_exists(&self, cluster_name: &str) -> Result<bool> {
        self.count();
        Ok(lock(&self.existing).contains(cluster_name))
    }

    async fn ensure_network(&self, cluster_name: &str) -> Result<NetworkHandle> {
        self.count();
        if !lock(&self.existing).insert(cluster_name.to_string()) {
            return Err(CloudError::ResourceGroupExists(cluster_name.to_string()));
        }
        Ok(NetworkHandle {
            resource_group_id: Some(format!("/groups/{}-rg", cluster_name)),
            vnet_id: Some(format!("/vnets/{}-vnet", cluster_name)),
            nsg_id: Some(format!("/nsgs/{}-nsg", cluster_name)),
            subnet_id: Some(format!("/subnets/{}-subnet", cluster_name)),
        })
    }

    async fn allocate_interface(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        _network: &NetworkHandle,
    ) -> Result<InterfaceHandles> {
        self.count();
        tokio::task::yield_now().await;
        Ok(InterfaceHandles {
            public_ip_address: Some(format!("{}.{}", self.octet(), spec.id + 10)),
            public_ip_address_id: Some(format!("/ips/{}-{}-ip", cluster_name, spec.id)),
            nic_id: Some(format!("/nics/{}-{}-nic", cluster_name, spec.id)),
            ip_configuration_id: None,
            private_ip_address: Some(format!("10.0.0.{}", spec.id + 4)),
        })
    }

    async fn create_instance(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        _network: &NetworkHandle,
        _interface: &InterfaceHandles,
    ) -> Result<InstanceHandles> {
        self.count();
        tokio::task::yield_now().await;
        if self.failing_ids.contains(&spec.id) {
            return Err(CloudError::CommandFailed(format!(
                "instance for machine {} could not be created",
                spec.id
            )));
        }
        lock(&self.created).push(spec.id);

        let vm_name = match &spec.location {
            Some(location) => format!("{}-{}-{}", cluster_name, location, spec.location_offset),
            None => format!("{}-{}", cluster_name, spec.id),
        };
        let zone = spec.location.as_ref().map(|l| format!("{}-zone", l));
        if spec.location.is_some() {
            lock(&self.instances).push(InstanceRef {
                name: vm_name.clone(),
                zone: zone.clone(),
            });
        }
        Ok(InstanceHandles {
            vm_id: Some(format!("/vms/{}", vm_name)),
            disk_name: Some(format!("{}-osdisk", vm_name)),
            work_disk_name: spec
                .large_work_disk
                .then(|| format!("{}-wdisk", vm_name)),
            zone,
            vm_name: Some(vm_name),
            public_ip_address: None,
            private_ip_address: None,
        })
    }

    async fn list_instances(&self, cluster_name: &str) -> Result<Vec<InstanceRef>> {
        self.count();
        Ok(lock(&self.instances)
            .iter()
            .filter(|i| naming::is_wan_instance_of(cluster_name, &i.name))
            .cloned()
            .collect())
    }

    async fn delete_all(
        &self,
        cluster_name: &str,
        instances: &[InstanceRef],
        error_if_missing: bool,
    ) -> Result<bool> {
        self.count();
        let existed = lock(&self.existing).remove(cluster_name);
        if !existed && instances.is_empty() {
            if error_if_missing {
                return Err(CloudError::ResourceGroupMissing(cluster_name.to_string()));
            }
            return Ok(false);
        }
        let mut deleted = lock(&self.deleted);
        if existed {
            deleted.push(cluster_name.to_string());
        }
        deleted.extend(instances.iter().map(|i| i.name.clone()));
        lock(&self.instances).retain(|running| instances.iter().all(|i| i.name != running.name));
        Ok(true)
    }
}
