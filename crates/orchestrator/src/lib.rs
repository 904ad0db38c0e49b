pub mod error;
pub mod gate;
pub mod logs;
pub mod pipeline;
pub mod plan;
pub mod provision;
pub mod setup;
pub mod sweep;

pub use error::{OrchestratorError, Result};
pub use gate::{GateOutcome, ProbePolicy, StaggerPolicy, StartGate};
pub use logs::fetch_logs;
pub use pipeline::{ExperimentPipeline, PipelineConfig};
pub use plan::{resolve, Experiment, ExperimentPlan, Participant, Variant};
pub use provision::{default_cluster_name, load_topology, MachineStage, Provisioner, SpawnRequest};
pub use setup::{SetupConfig, SoftwareSetup};
pub use sweep::{run_steps, BaselineKind, BaselineScenario, BaselineSweep, LanSweep, SweepStep, WanSweep};
