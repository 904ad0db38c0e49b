//! Resolution of an experiment into the workers that take part in it.
//!
//! Planning is pure: every role, local id and config path is computed and
//! validated against the topology before a single remote command runs.

use clusterbench_core::{
    lan_party, local_worker_id, wan_party_from_id, Cluster, CoreError, MemoryBudget,
    ObliviousTransferConfig, Party, Program, Protocol, Scenario, WorkerGrouping, WorkerKey,
    WorkerLayout,
};
use std::collections::BTreeMap;

use crate::error::Result;

/// Which machines run an experiment and how they pair up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// Both parties on LAN machines; `None` selects the protocol's default machines
    Lan { ids: Option<Vec<usize>> },
    /// The LAN head garbles against the single machine at `location`
    Wan {
        location: String,
        workers_per_node: usize,
        ot: ObliviousTransferConfig,
    },
    /// Every LAN machine garbles against its partner in the location's block
    PairedWan {
        location: String,
        workers_per_node: usize,
        ot: ObliviousTransferConfig,
    },
}

/// One benchmark invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub program: Program,
    pub scenario: Scenario,
    pub budget: MemoryBudget,
    pub log_name: String,
    pub variant: Variant,
}

impl Experiment {
    pub fn new(program: Program, scenario: Scenario, budget: MemoryBudget, variant: Variant) -> Self {
        let log_name = program.name();
        Self {
            program,
            scenario,
            budget,
            log_name,
            variant,
        }
    }

    pub fn with_log_name(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = log_name.into();
        self
    }
}

/// A single worker process of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub id: usize,
    pub worker: usize,
    pub local_id: usize,
    pub party: Party,
    /// Machine running the evaluator with the same local id, for garblers
    pub peer: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPlan {
    pub protocol: Protocol,
    pub ids: Vec<usize>,
    pub workers_per_node: usize,
    pub workers_per_party: usize,
    pub config_file: String,
    /// Trailing arguments for the program generation and run scripts
    pub extra_args: String,
    pub participants: BTreeMap<WorkerKey, Participant>,
}

impl ExperimentPlan {
    pub fn participant(&self, id: usize, worker: usize) -> Result<&Participant> {
        self.participants
            .get(&WorkerKey { id, worker })
            .ok_or_else(|| {
                CoreError::NotFound(format!("no worker {} on machine {} in this plan", worker, id))
                    .into()
            })
    }
}

fn config_file(dir: &str, experiment: &Experiment, protocol: Protocol, workers_per_party: usize) -> String {
    format!(
        "{}/{}/config_{}_{}.yaml",
        dir,
        experiment.scenario.config_budget(experiment.budget).label(),
        protocol,
        workers_per_party
    )
}

/// Default LAN machines for `protocol`: everything for two parties, the first half for one.
pub fn default_lan_ids(cluster: &Cluster, protocol: Protocol) -> Vec<usize> {
    let num_lan = cluster.num_lan_machines;
    match protocol {
        Protocol::Halfgates => cluster.lan_ids().collect(),
        Protocol::Ckks => (0..(num_lan / 2).max(1).min(num_lan)).collect(),
    }
}

/// Resolve `experiment` against `cluster`.
pub fn resolve(cluster: &Cluster, experiment: &Experiment) -> Result<ExperimentPlan> {
    let protocol = experiment.program.protocol();
    match &experiment.variant {
        Variant::Lan { ids } => {
            let ids = ids
                .clone()
                .unwrap_or_else(|| default_lan_ids(cluster, protocol));
            resolve_lan(cluster, experiment, protocol, ids)
        }
        Variant::Wan {
            location,
            workers_per_node,
            ot,
        } => {
            require_halfgates(protocol, &experiment.program)?;
            let remote_id = cluster.location_block(location)?.start;
            let layout = WorkerLayout::new(*workers_per_node, *workers_per_node, WorkerGrouping::PerMachine)?;
            let dir = format!("~/config-{}", location);
            resolve_pairs(cluster, experiment, vec![0, remote_id], layout, &dir, ot)
        }
        Variant::PairedWan {
            location,
            workers_per_node,
            ot,
        } => {
            require_halfgates(protocol, &experiment.program)?;
            if !cluster.is_paired() {
                return Err(CoreError::invalid(format!(
                    "cluster {} was not spawned with a paired setup",
                    cluster.name
                ))
                .into());
            }
            let mut ids: Vec<usize> = cluster.lan_ids().collect();
            ids.extend(cluster.location_block(location)?);
            let layout = WorkerLayout::new(
                cluster.num_lan_machines * workers_per_node,
                *workers_per_node,
                WorkerGrouping::PerNode,
            )?;
            let dir = format!("~/config-{}-paired", location);
            resolve_pairs(cluster, experiment, ids, layout, &dir, ot)
        }
    }
}

fn require_halfgates(protocol: Protocol, program: &Program) -> Result<()> {
    if protocol != Protocol::Halfgates {
        return Err(CoreError::invalid(format!(
            "{} uses {}, but only halfgates runs over the WAN",
            program, protocol
        ))
        .into());
    }
    Ok(())
}

fn resolve_lan(
    cluster: &Cluster,
    experiment: &Experiment,
    protocol: Protocol,
    ids: Vec<usize>,
) -> Result<ExperimentPlan> {
    if ids.is_empty() {
        return Err(CoreError::invalid("an experiment needs at least one machine").into());
    }
    if let Some(id) = ids.iter().find(|&&id| !cluster.is_lan(id)) {
        return Err(CoreError::invalid(format!("machine {} is not a LAN machine", id)).into());
    }
    if ids.len() % protocol.num_parties() != 0 {
        return Err(CoreError::invalid(format!(
            "{} machines cannot be split evenly between {} parties",
            ids.len(),
            protocol.num_parties()
        ))
        .into());
    }
    let workers_per_party = ids.len() / protocol.num_parties();
    let layout = WorkerLayout::new(workers_per_party, 1, WorkerGrouping::PerMachine)?;

    let mut participants = BTreeMap::new();
    for &id in &ids {
        participants.insert(
            WorkerKey { id, worker: 0 },
            Participant {
                id,
                worker: 0,
                local_id: local_worker_id(cluster, &layout, id, 0)?,
                party: lan_party(protocol, cluster, id)?,
                peer: None,
            },
        );
    }
    link_peers(&mut participants, protocol, workers_per_party)?;

    Ok(ExperimentPlan {
        protocol,
        config_file: config_file("~/config", experiment, protocol, workers_per_party),
        ids,
        workers_per_node: 1,
        workers_per_party,
        extra_args: String::new(),
        participants,
    })
}

fn resolve_pairs(
    cluster: &Cluster,
    experiment: &Experiment,
    ids: Vec<usize>,
    layout: WorkerLayout,
    config_dir: &str,
    ot: &ObliviousTransferConfig,
) -> Result<ExperimentPlan> {
    let protocol = Protocol::Halfgates;
    let mut participants = BTreeMap::new();
    for &id in &ids {
        for worker in 0..layout.workers_per_node() {
            participants.insert(
                WorkerKey { id, worker },
                Participant {
                    id,
                    worker,
                    local_id: local_worker_id(cluster, &layout, id, worker)?,
                    party: wan_party_from_id(cluster, id),
                    peer: None,
                },
            );
        }
    }
    link_peers(&mut participants, protocol, layout.party_size())?;

    Ok(ExperimentPlan {
        protocol,
        config_file: config_file(config_dir, experiment, protocol, layout.party_size()),
        ids,
        workers_per_node: layout.workers_per_node(),
        workers_per_party: layout.party_size(),
        extra_args: format!("{} {}", ot.pipeline_depth, ot.num_daemons),
        participants,
    })
}

/// Check every party has each local id exactly once and point garblers at their evaluator.
fn link_peers(
    participants: &mut BTreeMap<WorkerKey, Participant>,
    protocol: Protocol,
    workers_per_party: usize,
) -> Result<()> {
    let mut evaluators: BTreeMap<usize, usize> = BTreeMap::new();
    let mut garblers: BTreeMap<usize, usize> = BTreeMap::new();
    for participant in participants.values() {
        let side = match participant.party {
            Party::Evaluator => &mut evaluators,
            Party::Garbler => &mut garblers,
        };
        if side.insert(participant.local_id, participant.id).is_some() {
            return Err(CoreError::invalid(format!(
                "two {}s share local worker id {}",
                participant.party, participant.local_id
            ))
            .into());
        }
    }

    let expected_garblers = if protocol.num_parties() == 2 { workers_per_party } else { 0 };
    if evaluators.len() != workers_per_party || garblers.len() != expected_garblers {
        return Err(CoreError::invalid(format!(
            "expected {} evaluator and {} garbler workers, found {} and {}",
            workers_per_party,
            expected_garblers,
            evaluators.len(),
            garblers.len()
        ))
        .into());
    }

    for participant in participants.values_mut() {
        if participant.party == Party::Garbler {
            participant.peer = evaluators.get(&participant.local_id).copied();
        }
    }
    Ok(())
}
