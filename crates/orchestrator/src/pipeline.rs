//! Runs one experiment over a provisioned cluster.
//!
//! An experiment is resolved into a plan first, then driven through input
//! generation, memory program generation and the run itself. Each phase fans
//! out over every worker of the plan and reports all of its failures at once.

use clusterbench_core::{party_from_id, Cluster, CoreError, Party, Protocol, Scenario};
use remote::{ExitResult, RemoteError, RemoteShell};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{collect, OrchestratorError, Result};
use crate::gate::{seconds, StartGate};
use crate::plan::{resolve, Experiment, ExperimentPlan, Participant};

const CLEAR_CACHES: &str = "sudo swapoff -a; sudo sync; echo 3 | sudo tee /proc/sys/vm/drop_caches";

const GENERATE_INPUT: &str = "generate_input.sh";
const GENERATE_MEMPROG: &str = "generate_memprog.sh";
const RUN_MAGE: &str = "run_mage.sh";
const RUN_HALFGATES_BASELINE: &str = "run_halfgates_baseline.sh";
const RUN_CKKS_BASELINE: &str = "run_ckks_baseline.sh";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Local directory holding the scripts pushed to each machine
    pub scripts_dir: PathBuf,
    /// Pause before two-party runs so sockets of the previous run leave TIME_WAIT
    #[serde(with = "seconds")]
    pub settle_delay: Duration,
    pub start_gate: StartGate,
    /// Treat a nonzero script exit as a failure of the phase
    pub check_exit_codes: bool,
    pub generate_fresh_input: bool,
    pub generate_fresh_memprog: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("./scripts"),
            settle_delay: Duration::from_secs(70),
            start_gate: StartGate::default(),
            check_exit_codes: false,
            generate_fresh_input: true,
            generate_fresh_memprog: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_start_gate(mut self, gate: StartGate) -> Self {
        self.start_gate = gate;
        self
    }

    pub fn with_check_exit_codes(mut self, check: bool) -> Self {
        self.check_exit_codes = check;
        self
    }

    pub fn with_fresh_input(mut self, fresh: bool) -> Self {
        self.generate_fresh_input = fresh;
        self
    }

    pub fn with_fresh_memprog(mut self, fresh: bool) -> Self {
        self.generate_fresh_memprog = fresh;
        self
    }
}

pub struct ExperimentPipeline {
    shell: Arc<dyn RemoteShell>,
    config: PipelineConfig,
}

impl ExperimentPipeline {
    pub fn new(shell: Arc<dyn RemoteShell>, config: PipelineConfig) -> Self {
        Self { shell, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `experiment` on `cluster` and return the plan it ran with.
    pub async fn run(&self, cluster: &Cluster, experiment: &Experiment) -> Result<ExperimentPlan> {
        let plan = resolve(cluster, experiment)?;
        let program = &experiment.program;
        info!(
            program = %program,
            scenario = %experiment.scenario,
            workers = plan.participants.len(),
            log = %experiment.log_name,
            "Running experiment"
        );

        if self.config.generate_fresh_input {
            self.per_worker(cluster, &plan, "generate input", false, |p| {
                (
                    GENERATE_INPUT,
                    format!(
                        "{} {} {} {} {}",
                        program.problem, program.size, plan.protocol, p.local_id, plan.workers_per_party
                    ),
                )
            })
            .await?;
        }

        if self.config.generate_fresh_memprog {
            // Only the measured scenario records planning time
            let log = if experiment.scenario.is_measured_planning() {
                experiment.log_name.as_str()
            } else {
                ""
            };
            self.per_worker(cluster, &plan, "generate memory program", false, |p| {
                (GENERATE_MEMPROG, memprog_args(experiment, &plan, p, log))
            })
            .await?;
        }

        if plan.protocol == Protocol::Halfgates {
            self.settle().await;
        }
        self.clear_caches(cluster, &plan.ids).await?;

        self.per_worker(cluster, &plan, "run", true, |p| {
            (
                RUN_MAGE,
                format!(
                    "{} {} {} {} {} {} {} true{}",
                    experiment.scenario,
                    plan.protocol,
                    plan.config_file,
                    p.party.index(),
                    p.local_id,
                    program,
                    experiment.log_name,
                    suffix(&plan.extra_args)
                ),
            )
        })
        .await?;

        info!(program = %program, scenario = %experiment.scenario, "Experiment finished");
        Ok(plan)
    }

    /// Drop page caches and disable swap on `ids`.
    pub async fn clear_caches(&self, cluster: &Cluster, ids: &[usize]) -> Result<()> {
        debug!(machines = ids.len(), "Clearing memory caches");
        let results = cluster
            .for_each(ids, |machine, _| async move {
                let host = machine.ssh_host()?;
                let result = self.shell.run(host, CLEAR_CACHES).await?;
                self.check(host, result)
            })
            .await?;
        collect("clear caches", results)?;
        Ok(())
    }

    /// Reference garbled-circuit run between machines 0 and 1, outside the planner.
    pub async fn run_halfgates_baseline(&self, cluster: &Cluster, size: u64, log_name: &str) -> Result<()> {
        if cluster.len() != 2 {
            return Err(CoreError::invalid(format!(
                "the halfgates baseline needs a two-machine cluster (got {})",
                cluster.len()
            ))
            .into());
        }

        let mut invocations = BTreeMap::new();
        for id in 0..2 {
            let peer = 1 - id;
            let party = party_from_id(cluster, id)?;
            let participant = Participant {
                id,
                worker: 0,
                local_id: 0,
                party,
                peer: (party == Party::Garbler).then_some(peer),
            };
            let args = format!(
                "{} {} {} {} {}",
                Scenario::Os,
                party.index(),
                size,
                cluster.machine(peer)?.internal_host()?,
                log_name
            );
            invocations.insert(id, (participant, args));
        }

        info!(size, log = log_name, "Running halfgates baseline");
        self.settle().await;
        self.clear_caches(cluster, &[0, 1]).await?;

        let invocations = &invocations;
        let results = cluster
            .for_each(&[0, 1], |machine, id| async move {
                let (participant, args) = invocations
                    .get(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("machine {}", id)))?;
                let host = machine.ssh_host()?;
                self.config
                    .start_gate
                    .wait(self.shell.as_ref(), cluster, participant, 1)
                    .await?;
                self.invoke(host, RUN_HALFGATES_BASELINE, args).await
            })
            .await?;
        collect("halfgates baseline", results)?;
        Ok(())
    }

    /// Reference homomorphic run on machine 0, outside the planner.
    pub async fn run_ckks_baseline(&self, cluster: &Cluster, size: u64, log_name: &str) -> Result<()> {
        if cluster.is_empty() || cluster.len() > 2 {
            return Err(CoreError::invalid(format!(
                "the ckks baseline needs a one- or two-machine cluster (got {})",
                cluster.len()
            ))
            .into());
        }
        let host = cluster.machine(0)?.ssh_host()?;
        info!(size, log = log_name, "Running ckks baseline");

        if self.config.generate_fresh_input {
            let args = format!("real_statistics {} {} 0 1", size, Protocol::Ckks);
            self.invoke(host, GENERATE_INPUT, &args).await?;
        }
        self.clear_caches(cluster, &[0]).await?;
        self.invoke(
            host,
            RUN_CKKS_BASELINE,
            &format!("{} {} {}", Scenario::Os, size, log_name),
        )
        .await
    }

    async fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            debug!(secs = self.config.settle_delay.as_secs(), "Waiting for sockets to settle");
            tokio::time::sleep(self.config.settle_delay).await;
        }
    }

    async fn per_worker<F>(
        &self,
        cluster: &Cluster,
        plan: &ExperimentPlan,
        phase: &str,
        gated: bool,
        command: F,
    ) -> Result<()>
    where
        F: Fn(&Participant) -> (&'static str, String),
    {
        debug!(phase, workers = plan.participants.len(), "Starting phase");
        let command = &command;
        let results = cluster
            .for_each_multiple(&plan.ids, plan.workers_per_node, |machine, id, worker| async move {
                let participant = plan.participant(id, worker)?;
                let host = machine.ssh_host()?;
                if gated {
                    self.config
                        .start_gate
                        .wait(self.shell.as_ref(), cluster, participant, plan.workers_per_node)
                        .await?;
                }
                let (script, args) = command(participant);
                self.invoke(host, script, &args).await
            })
            .await?;
        collect(phase, results)?;
        Ok(())
    }

    async fn invoke(&self, host: &str, script: &str, args: &str) -> Result<()> {
        let path = self.config.scripts_dir.join(script);
        let result = self.shell.run_script(host, &path, args).await?;
        self.check(host, result)
    }

    fn check(&self, host: &str, result: ExitResult) -> Result<()> {
        if self.config.check_exit_codes && !result.success() {
            return Err(OrchestratorError::Remote(RemoteError::command_failed(
                host,
                result.code,
                result.stderr,
            )));
        }
        if !result.success() {
            warn!(host, code = ?result.code, "Script exited with a failure status");
        }
        Ok(())
    }
}

fn suffix(extra: &str) -> String {
    if extra.is_empty() {
        String::new()
    } else {
        format!(" {}", extra)
    }
}

fn memprog_args(experiment: &Experiment, plan: &ExperimentPlan, participant: &Participant, log: &str) -> String {
    // Keep trailing arguments in place when the log name is left out
    let log = if log.is_empty() && !plan.extra_args.is_empty() {
        "''"
    } else {
        log
    };
    let args = format!(
        "{} {} {} {} {} {} {}{}",
        experiment.program.problem,
        experiment.program.size,
        plan.protocol,
        plan.config_file,
        participant.party.index(),
        participant.local_id,
        log,
        suffix(&plan.extra_args)
    );
    args.trim_end().to_string()
}
