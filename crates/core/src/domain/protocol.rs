//! Protocols, scenarios and the memory configuration derived from them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Two-party garbled circuits; each party runs its own set of workers
    Halfgates,
    /// Homomorphic encryption; a single party runs every worker
    Ckks,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halfgates => "halfgates",
            Self::Ckks => "ckks",
        }
    }

    /// Number of parties whose workers are spread over the selected machines.
    pub fn num_parties(&self) -> usize {
        match self {
            Self::Halfgates => 2,
            Self::Ckks => 1,
        }
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "halfgates" => Ok(Self::Halfgates),
            "ckks" => Ok(Self::Ckks),
            other => Err(CoreError::invalid(format!(
                "protocol must be halfgates or ckks (got {})",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource scenario a benchmark program runs under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Planned memory program within the configured budget
    Mage,
    /// No memory limit at all
    Unbounded,
    /// Operating system paging under the memory limit
    Os,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Mage, Scenario::Unbounded, Scenario::Os];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mage => "mage",
            Self::Unbounded => "unbounded",
            Self::Os => "os",
        }
    }

    /// Only the planned scenario has its program generation counted as planning time.
    pub fn is_measured_planning(&self) -> bool {
        matches!(self, Self::Mage)
    }

    /// Memory budget whose configuration files this scenario reads.
    pub fn config_budget(&self, limit: MemoryBudget) -> MemoryBudget {
        match self {
            Self::Mage => limit,
            Self::Unbounded | Self::Os => MemoryBudget::Unbounded,
        }
    }
}

impl FromStr for Scenario {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mage" => Ok(Self::Mage),
            "unbounded" => Ok(Self::Unbounded),
            "os" => Ok(Self::Os),
            other => Err(CoreError::invalid(format!(
                "scenario must be mage, unbounded or os (got {})",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working-set budget granted to a benchmark program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryBudget {
    Gigabytes(u32),
    Unbounded,
}

impl MemoryBudget {
    /// Directory label of the configuration files for this budget.
    pub fn label(&self) -> String {
        match self {
            Self::Gigabytes(n) => format!("{}gb", n),
            Self::Unbounded => "unbounded".to_string(),
        }
    }
}

impl FromStr for MemoryBudget {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered == "max" || lowered == "unbounded" {
            return Ok(Self::Unbounded);
        }
        lowered
            .strip_suffix("gb")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|&n| n > 0)
            .map(Self::Gigabytes)
            .ok_or_else(|| {
                CoreError::invalid(format!(
                    "memory limit must look like 1gb, or be max/unbounded (got {})",
                    s
                ))
            })
    }
}

impl std::fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObliviousTransferConfig {
    pub max_batch_size: u32,
    pub pipeline_depth: u32,
    pub num_daemons: u32,
}

impl Default for ObliviousTransferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            pipeline_depth: 1,
            num_daemons: 3,
        }
    }
}

impl ObliviousTransferConfig {
    /// Split a total OT concurrency across daemons and workers, at least one deep.
    pub fn for_concurrency(concurrency: u32, num_daemons: u32, workers_per_node: u32) -> Self {
        let divisor = num_daemons.saturating_mul(workers_per_node).max(1);
        Self {
            pipeline_depth: (concurrency / divisor).max(1),
            num_daemons,
            ..Default::default()
        }
    }
}

/// Paging and prefetch parameters of one worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub page_shift: u32,
    pub num_pages: u64,
    pub prefetch_buffer_size: u32,
    pub prefetch_lookahead: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oblivious_transfer: Option<ObliviousTransferConfig>,
}

impl ProtocolConfig {
    pub fn derive(protocol: Protocol, budget: MemoryBudget) -> Self {
        let num_pages = num_pages(protocol, budget);
        match protocol {
            Protocol::Halfgates => Self {
                page_shift: 12,
                num_pages,
                prefetch_buffer_size: 256,
                prefetch_lookahead: 10000,
                oblivious_transfer: Some(ObliviousTransferConfig::default()),
            },
            Protocol::Ckks => Self {
                page_shift: 21,
                num_pages,
                prefetch_buffer_size: 16,
                prefetch_lookahead: 100,
                oblivious_transfer: None,
            },
        }
    }

    /// Bytes the page pool occupies.
    pub fn pool_bytes(&self) -> u64 {
        self.num_pages << self.page_shift
    }
}

/// Pages granted per gigabyte of budget, and the ceiling of the unbounded scenario.
fn page_table(protocol: Protocol) -> (u64, u64) {
    match protocol {
        Protocol::Halfgates => (14848, 524288),
        Protocol::Ckks => (464, 16384),
    }
}

/// Page count for a budget; non-decreasing in the budget and capped at the unbounded count.
pub fn num_pages(protocol: Protocol, budget: MemoryBudget) -> u64 {
    let (per_gigabyte, unbounded) = page_table(protocol);
    match budget {
        MemoryBudget::Gigabytes(n) => (per_gigabyte * u64::from(n)).min(unbounded),
        MemoryBudget::Unbounded => unbounded,
    }
}
