pub mod cluster;
pub mod machine;
pub mod program;
pub mod protocol;
pub mod registry;
pub mod role;

pub use cluster::{Cluster, LanNetwork, WanSetup};
pub use machine::{ImageKind, Machine, Provider};
pub use program::Program;
pub use protocol::{
    num_pages, MemoryBudget, ObliviousTransferConfig, Protocol, ProtocolConfig, Scenario,
};
pub use registry::LocationRegistry;
pub use role::{
    lan_party, local_worker_id, party_from_id, wan_party_from_id, Party, WorkerGrouping,
    WorkerLayout,
};
