//! Cluster topology, role resolution and concurrent dispatch for benchmark clusters.

pub mod dispatch;
pub mod domain;
pub mod error;

pub use dispatch::{for_each, for_each_multiple, for_each_mut, WorkerKey};
pub use domain::*;
pub use error::{CoreError, Result};
