//! Mapping from global machine and worker ids to protocol roles.
//!
//! Everything here is a pure function of the topology, so roles are resolved
//! and validated before any remote command is issued.

use serde::{Deserialize, Serialize};

use crate::domain::cluster::Cluster;
use crate::domain::protocol::Protocol;
use crate::error::{CoreError, Result};

/// One side of a two-party computation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// Binds the listening sockets; always started first
    Evaluator,
    /// Connects to the evaluator; started after it
    Garbler,
}

impl Party {
    /// Index the benchmark scripts expect on their command line.
    pub fn index(&self) -> u8 {
        match self {
            Self::Evaluator => 0,
            Self::Garbler => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluator => "evaluator",
            Self::Garbler => "garbler",
        }
    }

    pub fn starts_first(&self) -> bool {
        matches!(self, Self::Evaluator)
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Party of a LAN machine in a two-party run split evenly over the LAN.
///
/// The first half of the LAN id range evaluates and the second half garbles.
/// The split depends only on `num_lan_machines`, so WAN machines appended to
/// the cluster do not shift it.
pub fn party_from_id(cluster: &Cluster, id: usize) -> Result<Party> {
    let num_lan = cluster.num_lan_machines;
    if num_lan % 2 != 0 {
        return Err(CoreError::invalid(format!(
            "a two-party LAN run needs an even number of LAN machines (got {})",
            num_lan
        )));
    }
    if !cluster.is_lan(id) {
        return Err(CoreError::invalid(format!(
            "machine {} is not a LAN machine",
            id
        )));
    }
    if id < num_lan / 2 {
        Ok(Party::Evaluator)
    } else {
        Ok(Party::Garbler)
    }
}

/// Party of a LAN machine for `protocol`; single-party protocols always evaluate.
pub fn lan_party(protocol: Protocol, cluster: &Cluster, id: usize) -> Result<Party> {
    match protocol {
        Protocol::Halfgates => party_from_id(cluster, id),
        Protocol::Ckks => Ok(Party::Evaluator),
    }
}

/// Party of a machine in a LAN-versus-WAN run: the WAN side always evaluates.
pub fn wan_party_from_id(cluster: &Cluster, id: usize) -> Party {
    if cluster.is_lan(id) {
        Party::Garbler
    } else {
        Party::Evaluator
    }
}

/// How workers of one party are spread over physical machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerGrouping {
    /// Node index is the machine's position modulo the nodes in a party
    PerMachine,
    /// Node index is the machine's offset in the LAN range or its location block
    PerNode,
}

/// Shape of one party's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLayout {
    party_size: usize,
    workers_per_node: usize,
    grouping: WorkerGrouping,
}

impl WorkerLayout {
    pub fn new(party_size: usize, workers_per_node: usize, grouping: WorkerGrouping) -> Result<Self> {
        if party_size == 0 || !party_size.is_power_of_two() {
            return Err(CoreError::InvalidPartySize(party_size));
        }
        if workers_per_node == 0 || party_size % workers_per_node != 0 {
            return Err(CoreError::invalid(format!(
                "{} workers per node do not divide a party of {}",
                workers_per_node, party_size
            )));
        }
        Ok(Self {
            party_size,
            workers_per_node,
            grouping,
        })
    }

    pub fn party_size(&self) -> usize {
        self.party_size
    }

    pub fn workers_per_node(&self) -> usize {
        self.workers_per_node
    }

    pub fn nodes_per_party(&self) -> usize {
        self.party_size / self.workers_per_node
    }

    fn node_index(&self, cluster: &Cluster, id: usize) -> Result<usize> {
        let node = match self.grouping {
            WorkerGrouping::PerMachine => id % self.nodes_per_party(),
            WorkerGrouping::PerNode if cluster.is_lan(id) => id,
            WorkerGrouping::PerNode => cluster
                .location_of(id)
                .map(|(_, offset)| offset)
                .ok_or_else(|| CoreError::NotFound(format!("no location owns machine {}", id)))?,
        };
        if node >= self.nodes_per_party() {
            return Err(CoreError::invalid(format!(
                "machine {} is node {} but a party only has {} nodes",
                id,
                node,
                self.nodes_per_party()
            )));
        }
        Ok(node)
    }
}

/// Dense index of a worker within its party, used to pick ports and config entries.
///
/// Workers are interleaved across nodes: worker `w` of node `n` gets
/// `w * nodes_per_party + n`.
pub fn local_worker_id(
    cluster: &Cluster,
    layout: &WorkerLayout,
    id: usize,
    worker_index: usize,
) -> Result<usize> {
    if worker_index >= layout.workers_per_node {
        return Err(CoreError::invalid(format!(
            "worker index {} out of range for {} workers per node",
            worker_index, layout.workers_per_node
        )));
    }
    let node = layout.node_index(cluster, id)?;
    Ok(worker_index * layout.nodes_per_party() + node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::WanSetup;
    use std::collections::HashSet;

    fn paired_cluster(num_lan: usize, locations: &[&str]) -> Cluster {
        let mut cluster = Cluster::create("bench", num_lan * (1 + locations.len()))
            .with_lan_machines(num_lan)
            .with_setup(WanSetup::PairedNoSwap);
        for (i, location) in locations.iter().enumerate() {
            cluster
                .location_to_id
                .insert(location.to_string(), num_lan * (i + 1));
        }
        cluster
    }

    #[test]
    fn test_party_halves_of_lan() {
        let cluster = Cluster::create("bench", 8);
        let parties: Vec<Party> = (0..8).map(|id| party_from_id(&cluster, id).unwrap()).collect();
        assert!(parties[..4].iter().all(|p| *p == Party::Evaluator));
        assert!(parties[4..].iter().all(|p| *p == Party::Garbler));
    }

    #[test]
    fn test_party_ignores_wan_machines() {
        let mut cluster = Cluster::create("bench", 5).with_lan_machines(4);
        cluster.location_to_id.insert("oregon".to_string(), 4);
        assert_eq!(party_from_id(&cluster, 1).unwrap(), Party::Evaluator);
        assert_eq!(party_from_id(&cluster, 2).unwrap(), Party::Garbler);
        assert!(party_from_id(&cluster, 4).is_err());
    }

    #[test]
    fn test_party_rejects_odd_lan() {
        let cluster = Cluster::create("bench", 3);
        assert!(matches!(
            party_from_id(&cluster, 0),
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(lan_party(Protocol::Ckks, &cluster, 0).unwrap(), Party::Evaluator);
    }

    #[test]
    fn test_wan_party() {
        let cluster = paired_cluster(4, &["oregon"]);
        for id in 0..4 {
            assert_eq!(wan_party_from_id(&cluster, id), Party::Garbler);
        }
        assert_eq!(cluster.location_ids(&["oregon"]).unwrap(), vec![4, 5, 6, 7]);
        for id in 4..8 {
            assert_eq!(wan_party_from_id(&cluster, id), Party::Evaluator);
        }
    }

    #[test]
    fn test_invalid_party_size() {
        assert!(matches!(
            WorkerLayout::new(3, 1, WorkerGrouping::PerMachine),
            Err(CoreError::InvalidPartySize(3))
        ));
        assert!(matches!(
            WorkerLayout::new(0, 1, WorkerGrouping::PerMachine),
            Err(CoreError::InvalidPartySize(0))
        ));
        assert!(WorkerLayout::new(4, 3, WorkerGrouping::PerMachine).is_err());
    }

    #[test]
    fn test_per_machine_local_ids() {
        let cluster = Cluster::create("bench", 8);
        let layout = WorkerLayout::new(4, 1, WorkerGrouping::PerMachine).unwrap();
        let ids: Vec<usize> = (0..8)
            .map(|id| local_worker_id(&cluster, &layout, id, 0).unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert!(local_worker_id(&cluster, &layout, 0, 1).is_err());
    }

    #[test]
    fn test_paired_local_ids_are_dense() {
        let cluster = paired_cluster(2, &["iowa"]);
        let layout = WorkerLayout::new(4, 2, WorkerGrouping::PerNode).unwrap();
        for side in [vec![0, 1], vec![2, 3]] {
            let mut seen = HashSet::new();
            for &id in &side {
                for worker in 0..2 {
                    seen.insert(local_worker_id(&cluster, &layout, id, worker).unwrap());
                }
            }
            assert_eq!(seen, (0..4).collect::<HashSet<_>>());
        }
        assert_eq!(local_worker_id(&cluster, &layout, 3, 1).unwrap(), 3);
        assert_eq!(local_worker_id(&cluster, &layout, 1, 0).unwrap(), 1);
    }
}
