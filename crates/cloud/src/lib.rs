pub mod azure;
mod command;
pub mod error;
pub mod gcloud;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod naming;
pub mod traits;
pub mod types;

pub use azure::{AzureCli, AzureConfig};
pub use error::{CloudError, Result};
pub use gcloud::{GcloudCli, GcloudConfig};
pub use naming::{lookup_location, WanLocation, KNOWN_LOCATIONS};
pub use traits::CloudProvider;
pub use types::{
    InstanceHandles, InstanceRef, InterfaceHandles, MachineHandles, MachineSpec, NetworkHandle,
};
