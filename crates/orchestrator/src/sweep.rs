//! Expansion of command-line sweeps into experiment sequences.
//!
//! A sweep is flattened into an ordered list of steps up front, so invalid
//! combinations are reported before the first experiment starts.

use clusterbench_core::{
    Cluster, CoreError, MemoryBudget, ObliviousTransferConfig, Program, Protocol, Scenario,
};
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::ExperimentPipeline;
use crate::plan::{Experiment, Variant};

/// One unit of work of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepStep {
    Experiment(Experiment),
    HalfgatesBaseline { size: u64, log_name: String },
    CkksBaseline { size: u64, log_name: String },
}

impl SweepStep {
    pub fn log_name(&self) -> &str {
        match self {
            Self::Experiment(experiment) => &experiment.log_name,
            Self::HalfgatesBaseline { log_name, .. } | Self::CkksBaseline { log_name, .. } => log_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LanSweep {
    pub programs: Option<Vec<Program>>,
    pub scenarios: Option<Vec<Scenario>>,
    pub budget: MemoryBudget,
    pub trials: u32,
}

impl Default for LanSweep {
    fn default() -> Self {
        Self {
            programs: None,
            scenarios: None,
            budget: MemoryBudget::Gigabytes(1),
            trials: 1,
        }
    }
}

impl LanSweep {
    pub fn steps(&self, cluster: &Cluster) -> Vec<SweepStep> {
        let programs = match &self.programs {
            Some(programs) => programs.clone(),
            None => Program::defaults_for_lan(cluster.len()).unwrap_or_else(|| {
                warn!(machines = cluster.len(), "No default programs for this cluster size");
                Vec::new()
            }),
        };
        let scenarios = self.scenarios.clone().unwrap_or_else(|| Scenario::ALL.to_vec());
        let nodes_per_party = cluster.num_lan_machines / 2;

        let mut steps = Vec::new();
        for program in &programs {
            for trial in 1..=self.trials {
                for &scenario in &scenarios {
                    let log_name = format!(
                        "workers_{}_{}_{}_{}_t{}",
                        nodes_per_party, program.problem, program.size, scenario, trial
                    );
                    steps.push(SweepStep::Experiment(
                        Experiment::new(program.clone(), scenario, self.budget, Variant::Lan { ids: None })
                            .with_log_name(log_name),
                    ));
                }
            }
        }
        steps
    }
}

#[derive(Debug, Clone)]
pub struct WanSweep {
    pub location: String,
    pub paired: bool,
    pub programs: Vec<Program>,
    pub scenarios: Vec<Scenario>,
    pub budget: MemoryBudget,
    pub trials: u32,
    pub workers_per_node: Vec<usize>,
    pub ot_connections: Vec<u32>,
    pub ot_concurrency: Vec<u32>,
}

impl WanSweep {
    /// Defaults: one merge sort in the planned scenario, unbounded memory for paired runs.
    pub fn new(location: impl Into<String>, paired: bool) -> Self {
        Self {
            location: location.into(),
            paired,
            programs: vec![Program::new("merge_sorted", "1048576")],
            scenarios: vec![Scenario::Mage],
            budget: if paired {
                MemoryBudget::Unbounded
            } else {
                MemoryBudget::Gigabytes(1)
            },
            trials: 1,
            workers_per_node: vec![1],
            ot_connections: vec![3],
            ot_concurrency: vec![3],
        }
    }

    pub fn steps(&self) -> Vec<SweepStep> {
        let mut steps = Vec::new();
        for program in &self.programs {
            if program.protocol() != Protocol::Halfgates {
                warn!(program = %program, "Skipping, only halfgates runs over the WAN");
                continue;
            }
            for trial in 1..=self.trials {
                for &scenario in &self.scenarios {
                    for &workers_per_node in &self.workers_per_node {
                        for &num_daemons in &self.ot_connections {
                            for &concurrency in &self.ot_concurrency {
                                steps.push(SweepStep::Experiment(self.experiment(
                                    program,
                                    scenario,
                                    trial,
                                    workers_per_node,
                                    num_daemons,
                                    concurrency,
                                )));
                            }
                        }
                    }
                }
            }
        }
        steps
    }

    fn experiment(
        &self,
        program: &Program,
        scenario: Scenario,
        trial: u32,
        workers_per_node: usize,
        num_daemons: u32,
        concurrency: u32,
    ) -> Experiment {
        let workers = u32::try_from(workers_per_node).unwrap_or(u32::MAX);
        let ot = ObliviousTransferConfig::for_concurrency(concurrency, num_daemons, workers);
        let log_name = format!(
            "{}wan_{}_{}_{}_{}_{}_{}_{}_t{}",
            if self.paired { "paired" } else { "" },
            self.location,
            workers_per_node,
            ot.pipeline_depth,
            ot.num_daemons,
            program.problem,
            program.size,
            scenario,
            trial
        );
        let location = self.location.clone();
        let variant = if self.paired {
            Variant::PairedWan {
                location,
                workers_per_node,
                ot,
            }
        } else {
            Variant::Wan {
                location,
                workers_per_node,
                ot,
            }
        };
        Experiment::new(program.clone(), scenario, self.budget, variant).with_log_name(log_name)
    }
}

/// Scenario of a baseline sweep: a regular benchmark or the reference implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineScenario {
    Benchmark(Scenario),
    Reference,
}

impl FromStr for BaselineScenario {
    type Err = CoreError;

    fn from_str(s: &str) -> clusterbench_core::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emp" | "seal" | "reference" => Ok(Self::Reference),
            other => other.parse().map(Self::Benchmark),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineKind {
    Halfgates,
    Ckks,
}

impl BaselineKind {
    fn problem(&self) -> &'static str {
        match self {
            Self::Halfgates => "merge_sorted",
            Self::Ckks => "real_statistics",
        }
    }

    fn reference(&self) -> &'static str {
        match self {
            Self::Halfgates => "emp",
            Self::Ckks => "seal",
        }
    }

    fn default_sizes(&self) -> Vec<u64> {
        let exponents = match self {
            Self::Halfgates => 10..=20,
            Self::Ckks => 6..=14,
        };
        exponents.map(|e| 1u64 << e).collect()
    }

    fn worker_ids(&self) -> Vec<usize> {
        match self {
            Self::Halfgates => vec![0, 1],
            Self::Ckks => vec![0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaselineSweep {
    pub kind: BaselineKind,
    pub sizes: Option<Vec<u64>>,
    pub scenarios: Option<Vec<BaselineScenario>>,
    pub budget: MemoryBudget,
    pub trials: u32,
}

impl BaselineSweep {
    pub fn new(kind: BaselineKind) -> Self {
        Self {
            kind,
            sizes: None,
            scenarios: None,
            budget: MemoryBudget::Gigabytes(1),
            trials: 1,
        }
    }

    pub fn steps(&self, cluster: &Cluster) -> Result<Vec<SweepStep>> {
        let fits = match self.kind {
            BaselineKind::Halfgates => cluster.len() == 2,
            BaselineKind::Ckks => cluster.len() == 1 || cluster.len() == 2,
        };
        if !fits {
            return Err(CoreError::invalid(format!(
                "a {} baseline cannot run on a {}-machine cluster",
                self.kind.reference(),
                cluster.len()
            ))
            .into());
        }

        let sizes = self.sizes.clone().unwrap_or_else(|| self.kind.default_sizes());
        let scenarios = self.scenarios.clone().unwrap_or_else(|| {
            let mut all: Vec<_> = Scenario::ALL.iter().copied().map(BaselineScenario::Benchmark).collect();
            all.push(BaselineScenario::Reference);
            all
        });

        let problem = self.kind.problem();
        let mut steps = Vec::new();
        for &size in &sizes {
            for trial in 1..=self.trials {
                for &scenario in &scenarios {
                    let label = match scenario {
                        BaselineScenario::Benchmark(s) => s.as_str(),
                        BaselineScenario::Reference => self.kind.reference(),
                    };
                    let log_name = format!(
                        "{}_baseline_{}_{}_{}_t{}",
                        match self.kind {
                            BaselineKind::Halfgates => "halfgates",
                            BaselineKind::Ckks => "ckks",
                        },
                        problem,
                        size,
                        label,
                        trial
                    );
                    steps.push(match (scenario, self.kind) {
                        (BaselineScenario::Reference, BaselineKind::Halfgates) => {
                            SweepStep::HalfgatesBaseline { size, log_name }
                        }
                        (BaselineScenario::Reference, BaselineKind::Ckks) => {
                            SweepStep::CkksBaseline { size, log_name }
                        }
                        (BaselineScenario::Benchmark(s), _) => SweepStep::Experiment(
                            Experiment::new(
                                Program::new(problem, size.to_string()),
                                s,
                                self.budget,
                                Variant::Lan {
                                    ids: Some(self.kind.worker_ids()),
                                },
                            )
                            .with_log_name(log_name),
                        ),
                    });
                }
            }
        }
        Ok(steps)
    }
}

/// Run `steps` one after another, stopping at the first failure.
pub async fn run_steps(pipeline: &ExperimentPipeline, cluster: &Cluster, steps: &[SweepStep]) -> Result<usize> {
    for (index, step) in steps.iter().enumerate() {
        info!(step = index + 1, total = steps.len(), log = step.log_name(), "Starting sweep step");
        match step {
            SweepStep::Experiment(experiment) => {
                pipeline.run(cluster, experiment).await?;
            }
            SweepStep::HalfgatesBaseline { size, log_name } => {
                pipeline.run_halfgates_baseline(cluster, *size, log_name).await?;
            }
            SweepStep::CkksBaseline { size, log_name } => {
                pipeline.run_ckks_baseline(cluster, *size, log_name).await?;
            }
        }
    }
    Ok(steps.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;
    use remote::mock::RecordingShell;
    use std::sync::Arc;

    fn names(steps: &[SweepStep]) -> Vec<&str> {
        steps.iter().map(|s| s.log_name()).collect()
    }

    #[test]
    fn test_lan_sweep_defaults() {
        let cluster = Cluster::create("bench", 2);
        let steps = LanSweep::default().steps(&cluster);
        assert_eq!(steps.len(), 30);
        assert_eq!(steps[0].log_name(), "workers_1_merge_sorted_1048576_mage_t1");
        assert_eq!(steps[2].log_name(), "workers_1_merge_sorted_1048576_os_t1");

        let unknown = Cluster::create("bench", 3);
        assert!(LanSweep::default().steps(&unknown).is_empty());
    }

    #[test]
    fn test_lan_sweep_order() {
        let cluster = Cluster::create("bench", 8);
        let sweep = LanSweep {
            programs: Some(vec!["loop_join_64".parse().unwrap()]),
            scenarios: Some(vec![Scenario::Os]),
            trials: 2,
            ..Default::default()
        };
        assert_eq!(
            names(&sweep.steps(&cluster)),
            vec!["workers_4_loop_join_64_os_t1", "workers_4_loop_join_64_os_t2"]
        );
    }

    #[test]
    fn test_wan_sweep() {
        let mut sweep = WanSweep::new("oregon", false);
        sweep.programs.push("real_sum_64".parse().unwrap());
        sweep.workers_per_node = vec![1, 2];
        sweep.ot_concurrency = vec![3, 12];
        let steps = sweep.steps();

        assert_eq!(
            names(&steps),
            vec![
                "wan_oregon_1_1_3_merge_sorted_1048576_mage_t1",
                "wan_oregon_1_4_3_merge_sorted_1048576_mage_t1",
                "wan_oregon_2_1_3_merge_sorted_1048576_mage_t1",
                "wan_oregon_2_2_3_merge_sorted_1048576_mage_t1",
            ]
        );
        match &steps[1] {
            SweepStep::Experiment(experiment) => {
                assert_eq!(experiment.budget, MemoryBudget::Gigabytes(1));
                assert!(matches!(experiment.variant, Variant::Wan { workers_per_node: 1, .. }));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_paired_wan_sweep() {
        let steps = WanSweep::new("iowa", true).steps();
        assert_eq!(names(&steps), vec!["pairedwan_iowa_1_1_3_merge_sorted_1048576_mage_t1"]);
        match &steps[0] {
            SweepStep::Experiment(experiment) => {
                assert_eq!(experiment.budget, MemoryBudget::Unbounded);
                assert!(matches!(experiment.variant, Variant::PairedWan { .. }));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_baseline_sweeps() {
        let pair = Cluster::create("bench", 2);
        let halfgates = BaselineSweep::new(BaselineKind::Halfgates).steps(&pair).unwrap();
        assert_eq!(halfgates.len(), 11 * 4);
        assert_eq!(halfgates[0].log_name(), "halfgates_baseline_merge_sorted_1024_mage_t1");
        assert_eq!(
            halfgates[3],
            SweepStep::HalfgatesBaseline {
                size: 1024,
                log_name: "halfgates_baseline_merge_sorted_1024_emp_t1".to_string(),
            }
        );

        let mut ckks = BaselineSweep::new(BaselineKind::Ckks);
        ckks.sizes = Some(vec![64]);
        ckks.scenarios = Some(vec!["seal".parse().unwrap(), "os".parse().unwrap()]);
        let steps = ckks.steps(&Cluster::create("bench", 1)).unwrap();
        assert_eq!(
            names(&steps),
            vec!["ckks_baseline_real_statistics_64_seal_t1", "ckks_baseline_real_statistics_64_os_t1"]
        );
        match &steps[1] {
            SweepStep::Experiment(experiment) => {
                assert_eq!(experiment.variant, Variant::Lan { ids: Some(vec![0]) });
            }
            other => panic!("unexpected step {:?}", other),
        }

        assert!(BaselineSweep::new(BaselineKind::Halfgates)
            .steps(&Cluster::create("bench", 4))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_steps_sequentially() {
        let shell = Arc::new(RecordingShell::new());
        let mut cluster = Cluster::create("bench", 1);
        cluster.machines[0].public_ip_address = Some("203.0.113.10".to_string());
        let pipeline = ExperimentPipeline::new(shell.clone(), PipelineConfig::default());

        let mut sweep = BaselineSweep::new(BaselineKind::Ckks);
        sweep.sizes = Some(vec![64]);
        let steps = sweep.steps(&cluster).unwrap();
        let ran = run_steps(&pipeline, &cluster, &steps).await.unwrap();

        assert_eq!(ran, 4);
        assert_eq!(shell.runs_matching("run_mage.sh").len(), 3);
        assert_eq!(shell.runs_matching("run_ckks_baseline.sh").len(), 1);
    }
}
