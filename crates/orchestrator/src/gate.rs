//! Start ordering between the two parties of a run.
//!
//! Garblers connect to listeners their evaluator opens, so an evaluator
//! worker must be up before its garbler starts. The fixed-delay gate only
//! staggers garblers and can lose against a slow evaluator; the probe gate
//! polls the evaluator's host until the worker's port is bound.

use clusterbench_core::{Cluster, Party};
use remote::RemoteShell;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::plan::Participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaggerPolicy {
    #[serde(with = "seconds")]
    pub base: Duration,
    #[serde(with = "seconds")]
    pub per_worker: Duration,
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            per_worker: Duration::from_secs(1),
        }
    }
}

impl StaggerPolicy {
    /// How long garbler worker `worker` of `num_workers` per node waits before starting.
    pub fn delay(&self, num_workers: usize, worker: usize) -> Duration {
        let steps = num_workers.saturating_sub(1).saturating_add(worker);
        let steps = u32::try_from(steps).unwrap_or(u32::MAX);
        self.base.saturating_add(self.per_worker.saturating_mul(steps))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbePolicy {
    #[serde(with = "seconds")]
    pub interval: Duration,
    #[serde(with = "seconds")]
    pub deadline: Duration,
    /// Port of the evaluator listener for local worker 0
    pub base_port: u16,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            deadline: Duration::from_secs(120),
            base_port: 57000,
        }
    }
}

impl ProbePolicy {
    pub fn port(&self, local_id: usize) -> u16 {
        let offset = u16::try_from(local_id).unwrap_or(u16::MAX);
        self.base_port.saturating_add(offset)
    }

    fn command(&self, local_id: usize) -> String {
        format!("ss -Hltn 'sport = :{}'", self.port(local_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartGate {
    FixedDelay(StaggerPolicy),
    ListenerProbe(ProbePolicy),
}

impl Default for StartGate {
    fn default() -> Self {
        Self::FixedDelay(StaggerPolicy::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Evaluators and unpaired workers start right away
    Immediate,
    Delayed(Duration),
    ListenerReady,
    /// The listener never showed up; the worker starts anyway
    DeadlineElapsed,
}

impl StartGate {
    /// Block until `participant` may start.
    pub async fn wait(
        &self,
        shell: &dyn RemoteShell,
        cluster: &Cluster,
        participant: &Participant,
        workers_per_node: usize,
    ) -> Result<GateOutcome> {
        if participant.party == Party::Evaluator {
            return Ok(GateOutcome::Immediate);
        }

        match self {
            Self::FixedDelay(policy) => {
                let delay = policy.delay(workers_per_node, participant.worker);
                debug!(
                    machine_id = participant.id,
                    worker = participant.worker,
                    delay_secs = delay.as_secs(),
                    "Staggering garbler start"
                );
                tokio::time::sleep(delay).await;
                Ok(GateOutcome::Delayed(delay))
            }
            Self::ListenerProbe(policy) => {
                let Some(peer) = participant.peer else {
                    return Ok(GateOutcome::Immediate);
                };
                let host = cluster.machine(peer)?.ssh_host()?;
                probe(shell, host, policy, participant.local_id).await
            }
        }
    }
}

async fn probe(
    shell: &dyn RemoteShell,
    host: &str,
    policy: &ProbePolicy,
    local_id: usize,
) -> Result<GateOutcome> {
    let command = policy.command(local_id);
    let deadline = Instant::now() + policy.deadline;
    loop {
        let result = shell.run(host, &command).await?;
        if result.success() && !result.stdout.trim().is_empty() {
            debug!(host, port = policy.port(local_id), "Evaluator listener is up");
            return Ok(GateOutcome::ListenerReady);
        }
        if Instant::now() + policy.interval > deadline {
            warn!(
                host,
                port = policy.port(local_id),
                deadline_secs = policy.deadline.as_secs(),
                "Evaluator listener not seen before deadline, starting anyway"
            );
            return Ok(GateOutcome::DeadlineElapsed);
        }
        tokio::time::sleep(policy.interval).await;
    }
}

pub(crate) mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::mock::RecordingShell;
    use remote::ExitResult;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::create("bench", 2);
        for (id, machine) in cluster.machines.iter_mut().enumerate() {
            machine.public_ip_address = Some(format!("203.0.113.{}", id + 10));
        }
        cluster
    }

    fn garbler(worker: usize) -> Participant {
        Participant {
            id: 1,
            worker,
            local_id: worker,
            party: Party::Garbler,
            peer: Some(0),
        }
    }

    #[test]
    fn test_stagger_grows_with_worker_index() {
        let policy = StaggerPolicy::default();
        assert_eq!(policy.delay(1, 0), Duration::from_secs(30));
        assert_eq!(policy.delay(4, 0), Duration::from_secs(33));
        assert_eq!(policy.delay(4, 3), Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluator_never_waits() {
        let shell = RecordingShell::new();
        let evaluator = Participant {
            party: Party::Evaluator,
            peer: None,
            ..garbler(0)
        };
        let start = Instant::now();
        let outcome = StartGate::default()
            .wait(&shell, &cluster(), &evaluator, 1)
            .await
            .unwrap();
        assert_eq!(outcome, GateOutcome::Immediate);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(shell.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_sleeps() {
        let shell = RecordingShell::new();
        let start = Instant::now();
        let outcome = StartGate::default()
            .wait(&shell, &cluster(), &garbler(1), 2)
            .await
            .unwrap();
        assert_eq!(outcome, GateOutcome::Delayed(Duration::from_secs(32)));
        assert!(start.elapsed() >= Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_stops_once_port_is_bound() {
        let shell = RecordingShell::new()
            .with_response(":57001", ExitResult::ok("LISTEN 0 128 0.0.0.0:57001 0.0.0.0:*"));
        let gate = StartGate::ListenerProbe(ProbePolicy::default());
        let outcome = gate.wait(&shell, &cluster(), &garbler(1), 2).await.unwrap();

        assert_eq!(outcome, GateOutcome::ListenerReady);
        let runs = shell.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].host, "203.0.113.10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gives_up_at_deadline() {
        let shell = RecordingShell::new();
        let policy = ProbePolicy {
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(20),
            ..Default::default()
        };
        let start = Instant::now();
        let outcome = StartGate::ListenerProbe(policy)
            .wait(&shell, &cluster(), &garbler(0), 1)
            .await
            .unwrap();

        assert_eq!(outcome, GateOutcome::DeadlineElapsed);
        assert!(start.elapsed() <= Duration::from_secs(20));
        assert_eq!(shell.commands().len(), 5);
    }

    #[test]
    fn test_gate_from_toml() {
        let gate: StartGate =
            toml::from_str("kind = \"listener_probe\"\ninterval = 1\ndeadline = 30\n").unwrap();
        assert_eq!(
            gate,
            StartGate::ListenerProbe(ProbePolicy {
                interval: Duration::from_secs(1),
                deadline: Duration::from_secs(30),
                base_port: 57000,
            })
        );
    }
}
