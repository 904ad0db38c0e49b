use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Which cloud a machine was provisioned from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// The LAN provider hosting the co-located machines
    #[serde(alias = "azure")]
    Local,
    /// A WAN provider hosting machines at named locations
    #[serde(alias = "gcloud")]
    Remote,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Image a machine was booted from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Stock distribution image; dependencies are installed during setup
    #[default]
    Ubuntu,
    /// Image with all benchmark dependencies baked in
    Prebuilt,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::Prebuilt => "prebuilt",
        }
    }

    pub fn needs_dependencies(&self) -> bool {
        matches!(self, Self::Ubuntu)
    }
}

/// Identity and addressing record for one virtual machine.
///
/// Every field starts unset when the topology is created. The provisioning
/// step fills them in exactly once; a restored topology fills them all at
/// load time. Missing keys in a persisted record deserialize as unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Machine {
    pub provider: Option<Provider>,
    pub image: Option<ImageKind>,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub public_ip_address_id: Option<String>,
    pub nic_id: Option<String>,
    pub ip_configuration_id: Option<String>,
    pub vm_id: Option<String>,
    pub vm_name: Option<String>,
    pub disk_name: Option<String>,
    /// Large scratch disk attached for out-of-core runs
    pub work_disk_name: Option<String>,
    /// Zone assigned by the provider (WAN machines)
    pub zone: Option<String>,
}

impl Machine {
    /// Address used to reach the machine over SSH.
    pub fn ssh_host(&self) -> Result<&str> {
        self.public_ip_address
            .as_deref()
            .ok_or_else(|| CoreError::NotFound("machine has no public address".to_string()))
    }

    /// Address peers inside the same network use.
    pub fn internal_host(&self) -> Result<&str> {
        self.private_ip_address
            .as_deref()
            .ok_or_else(|| CoreError::NotFound("machine has no private address".to_string()))
    }

    /// Whether the provisioning step has produced a reachable compute instance.
    pub fn is_ready(&self) -> bool {
        self.provider.is_some() && self.vm_name.is_some() && self.public_ip_address.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_default_is_unset() {
        let machine = Machine::default();
        assert!(machine.provider.is_none());
        assert!(!machine.is_ready());
        assert!(machine.ssh_host().is_err());
    }

    #[test]
    fn test_provider_serialization() {
        assert_eq!(serde_json::to_string(&Provider::Local).unwrap(), "\"local\"");
        assert_eq!(serde_json::to_string(&Provider::Remote).unwrap(), "\"remote\"");

        let legacy: Provider = serde_json::from_str("\"azure\"").unwrap();
        assert_eq!(legacy, Provider::Local);
        let legacy: Provider = serde_json::from_str("\"gcloud\"").unwrap();
        assert_eq!(legacy, Provider::Remote);
    }

    #[test]
    fn test_missing_fields_default_to_unset() {
        let machine: Machine =
            serde_json::from_str(r#"{"public_ip_address": "20.1.2.3", "extra": 7}"#).unwrap();
        assert_eq!(machine.ssh_host().unwrap(), "20.1.2.3");
        assert!(machine.private_ip_address.is_none());
        assert!(machine.zone.is_none());
    }

    #[test]
    fn test_image_kind() {
        assert!(ImageKind::Ubuntu.needs_dependencies());
        assert!(!ImageKind::Prebuilt.needs_dependencies());
        assert_eq!(ImageKind::default(), ImageKind::Ubuntu);
    }
}
