use async_trait::async_trait;
use clusterbench_core::Provider;

use crate::error::Result;
use crate::types::{
    InstanceHandles, InstanceRef, InterfaceHandles, MachineHandles, MachineSpec, NetworkHandle,
};

/// Creates and deletes the machines of one cloud.
///
/// A provider is constructed per command invocation and shared by reference
/// across the concurrent per-machine tasks of that invocation.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Get the name of the provider's CLI
    fn name(&self) -> &'static str;

    /// Tag recorded on every machine this provider creates
    fn provider(&self) -> Provider;

    /// Check if the provider's CLI is installed
    async fn is_available(&self) -> bool;

    /// Whether any resources of `cluster_name` exist with this provider.
    async fn cluster_exists(&self, cluster_name: &str) -> Result<bool>;

    /// Create the cluster-level network every machine attaches to.
    ///
    /// Called once, before any machine is created.
    async fn ensure_network(&self, cluster_name: &str) -> Result<NetworkHandle>;

    /// Allocate the public address and network interface of one machine.
    async fn allocate_interface(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        network: &NetworkHandle,
    ) -> Result<InterfaceHandles>;

    /// Create the compute instance of one machine on its allocated interface.
    async fn create_instance(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        network: &NetworkHandle,
        interface: &InterfaceHandles,
    ) -> Result<InstanceHandles>;

    /// Allocate the interface and then the instance of one machine.
    async fn create_machine(
        &self,
        cluster_name: &str,
        spec: &MachineSpec,
        network: &NetworkHandle,
    ) -> Result<MachineHandles> {
        let interface = self.allocate_interface(cluster_name, spec, network).await?;
        let instance = self
            .create_instance(cluster_name, spec, network, &interface)
            .await?;
        Ok(MachineHandles {
            provider: self.provider(),
            image: spec.image,
            interface,
            instance,
        })
    }

    /// Instances of `cluster_name` the provider currently knows about.
    async fn list_instances(&self, cluster_name: &str) -> Result<Vec<InstanceRef>>;

    /// Delete every resource of `cluster_name`, including `instances`.
    ///
    /// Returns whether anything was deleted. When nothing exists this is a
    /// no-op, or an error if `error_if_missing` is set.
    async fn delete_all(
        &self,
        cluster_name: &str,
        instances: &[InstanceRef],
        error_if_missing: bool,
    ) -> Result<bool>;
}
