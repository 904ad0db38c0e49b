use clusterbench_core::{ImageKind, LanNetwork, Machine, Provider, WanSetup};
use serde::{Deserialize, Serialize};

/// Cluster-level network resources shared by every machine of one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub resource_group_id: Option<String>,
    pub vnet_id: Option<String>,
    pub nsg_id: Option<String>,
    pub subnet_id: Option<String>,
}

impl From<NetworkHandle> for LanNetwork {
    fn from(handle: NetworkHandle) -> Self {
        LanNetwork {
            resource_group_id: handle.resource_group_id,
            vnet_id: handle.vnet_id,
            nsg_id: handle.nsg_id,
            subnet_id: handle.subnet_id,
        }
    }
}

/// What to create for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    /// Global id of the machine in its cluster
    pub id: usize,
    pub image: ImageKind,
    pub setup: WanSetup,
    pub large_work_disk: bool,
    /// WAN location, unset for LAN machines
    pub location: Option<String>,
    /// Offset inside the location's block of a paired cluster
    pub location_offset: usize,
}

impl MachineSpec {
    pub fn lan(id: usize, image: ImageKind, setup: WanSetup) -> Self {
        Self {
            id,
            image,
            setup,
            large_work_disk: false,
            location: None,
            location_offset: 0,
        }
    }

    pub fn wan(id: usize, location: impl Into<String>, offset: usize, setup: WanSetup) -> Self {
        Self {
            id,
            image: ImageKind::Ubuntu,
            setup,
            large_work_disk: false,
            location: Some(location.into()),
            location_offset: offset,
        }
    }

    pub fn with_image(mut self, image: ImageKind) -> Self {
        self.image = image;
        self
    }

    pub fn with_large_work_disk(mut self, enabled: bool) -> Self {
        self.large_work_disk = enabled;
        self
    }
}

/// Public address and network interface allocated for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceHandles {
    pub public_ip_address: Option<String>,
    pub public_ip_address_id: Option<String>,
    pub nic_id: Option<String>,
    pub ip_configuration_id: Option<String>,
    pub private_ip_address: Option<String>,
}

/// Compute instance created for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceHandles {
    pub vm_id: Option<String>,
    pub vm_name: Option<String>,
    pub disk_name: Option<String>,
    pub work_disk_name: Option<String>,
    pub zone: Option<String>,
    /// Addresses assigned with the instance, for providers without a separate interface step
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineHandles {
    pub provider: Provider,
    pub image: ImageKind,
    pub interface: InterfaceHandles,
    pub instance: InstanceHandles,
}

fn fill(slot: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

impl InterfaceHandles {
    pub fn apply(&self, machine: &mut Machine) {
        fill(&mut machine.public_ip_address, &self.public_ip_address);
        fill(&mut machine.public_ip_address_id, &self.public_ip_address_id);
        fill(&mut machine.nic_id, &self.nic_id);
        fill(&mut machine.ip_configuration_id, &self.ip_configuration_id);
        fill(&mut machine.private_ip_address, &self.private_ip_address);
    }
}

impl InstanceHandles {
    pub fn apply(&self, machine: &mut Machine) {
        fill(&mut machine.vm_id, &self.vm_id);
        fill(&mut machine.vm_name, &self.vm_name);
        fill(&mut machine.disk_name, &self.disk_name);
        fill(&mut machine.work_disk_name, &self.work_disk_name);
        fill(&mut machine.zone, &self.zone);
        fill(&mut machine.public_ip_address, &self.public_ip_address);
        fill(&mut machine.private_ip_address, &self.private_ip_address);
    }
}

impl MachineHandles {
    /// Merge every handle into `machine`; unset handles leave the field alone.
    pub fn apply(&self, machine: &mut Machine) {
        machine.provider = Some(self.provider);
        machine.image = Some(self.image);
        self.interface.apply(machine);
        self.instance.apply(machine);
    }
}

/// A compute instance as listed by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub name: String,
    pub zone: Option<String>,
}

impl InstanceRef {
    /// The instance recorded for a provisioned machine, if it got that far.
    pub fn from_machine(machine: &Machine) -> Option<Self> {
        machine.vm_name.as_ref().map(|name| Self {
            name: name.clone(),
            zone: machine.zone.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_never_resets() {
        let mut machine = Machine::default();
        InterfaceHandles {
            public_ip_address: Some("203.0.113.7".to_string()),
            private_ip_address: Some("10.0.0.7".to_string()),
            ..Default::default()
        }
        .apply(&mut machine);

        let handles = MachineHandles {
            provider: Provider::Local,
            image: ImageKind::Prebuilt,
            interface: InterfaceHandles::default(),
            instance: InstanceHandles {
                vm_name: Some("bench-0".to_string()),
                ..Default::default()
            },
        };
        handles.apply(&mut machine);

        assert_eq!(machine.public_ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(machine.vm_name.as_deref(), Some("bench-0"));
        assert_eq!(machine.image, Some(ImageKind::Prebuilt));
        assert!(machine.is_ready());
    }

    #[test]
    fn test_instance_ref_from_machine() {
        let mut machine = Machine::default();
        assert!(InstanceRef::from_machine(&machine).is_none());
        machine.vm_name = Some("bench-iowa".to_string());
        machine.zone = Some("us-central1-b".to_string());
        let instance = InstanceRef::from_machine(&machine).unwrap();
        assert_eq!(instance.zone.as_deref(), Some("us-central1-b"));
    }
}
