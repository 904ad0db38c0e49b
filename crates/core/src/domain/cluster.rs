use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use crate::domain::machine::Machine;
use crate::error::{CoreError, Result};

/// Tokens that `location_ids` resolves to the whole LAN id range.
const LAN_TOKENS: [&str; 2] = ["local", "lan"];

/// How WAN machines are laid out relative to the LAN machines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub enum WanSetup {
    /// One WAN machine per location, paired with the LAN head machine
    #[default]
    #[serde(rename = "regular")]
    Regular,
    /// One WAN machine per LAN machine at each location, no swap on the work disk
    #[serde(rename = "paired-noswap")]
    PairedNoSwap,
    /// One WAN machine per LAN machine at each location, swap on the work disk
    #[serde(rename = "paired-swap")]
    PairedSwap,
}

impl WanSetup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::PairedNoSwap => "paired-noswap",
            Self::PairedSwap => "paired-swap",
        }
    }

    pub fn is_paired(&self) -> bool {
        !matches!(self, Self::Regular)
    }
}

impl FromStr for WanSetup {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regular" => Ok(Self::Regular),
            "paired-noswap" => Ok(Self::PairedNoSwap),
            "paired-swap" => Ok(Self::PairedSwap),
            other => Err(CoreError::invalid(format!(
                "setup must be regular, paired-noswap or paired-swap (got {})",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WanSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-level LAN resources, kept only so teardown can find them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LanNetwork {
    pub resource_group_id: Option<String>,
    pub vnet_id: Option<String>,
    pub nsg_id: Option<String>,
    pub subnet_id: Option<String>,
}

/// The topology of a spawned cluster.
///
/// Machine `i` in `machines` has global id `i` for the lifetime of the cluster.
/// Ids `[0, num_lan_machines)` are LAN machines; the rest are WAN machines,
/// grouped by location. `location_to_id` maps each location to the first id of
/// its group, which spans `num_lan_machines` ids when the setup is paired and a
/// single id otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub machines: Vec<Machine>,
    pub num_lan_machines: usize,
    #[serde(default)]
    pub location_to_id: BTreeMap<String, usize>,
    #[serde(default)]
    pub setup: WanSetup,
    #[serde(default)]
    pub lan_network: LanNetwork,
    #[serde(default)]
    pub spawned_at: Option<DateTime<Utc>>,
}

impl Cluster {
    /// Allocate a topology of `size` empty machines, all of them LAN machines.
    pub fn create(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            machines: vec![Machine::default(); size],
            num_lan_machines: size,
            location_to_id: BTreeMap::new(),
            setup: WanSetup::default(),
            lan_network: LanNetwork::default(),
            spawned_at: None,
        }
    }

    pub fn with_lan_machines(mut self, num_lan_machines: usize) -> Self {
        self.num_lan_machines = num_lan_machines;
        self
    }

    pub fn with_setup(mut self, setup: WanSetup) -> Self {
        self.setup = setup;
        self
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn is_paired(&self) -> bool {
        self.setup.is_paired()
    }

    pub fn machine(&self, id: usize) -> Result<&Machine> {
        self.machines
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("machine {} in cluster {}", id, self.name)))
    }

    pub fn all_ids(&self) -> Vec<usize> {
        (0..self.machines.len()).collect()
    }

    pub fn lan_ids(&self) -> Range<usize> {
        0..self.num_lan_machines
    }

    pub fn wan_ids(&self) -> Range<usize> {
        self.num_lan_machines..self.machines.len()
    }

    pub fn is_lan(&self, id: usize) -> bool {
        id < self.num_lan_machines
    }

    /// Number of consecutive ids each WAN location occupies.
    pub fn machines_per_location(&self) -> usize {
        if self.is_paired() {
            self.num_lan_machines
        } else {
            1
        }
    }

    /// The ids belonging to one WAN location.
    pub fn location_block(&self, location: &str) -> Result<Range<usize>> {
        let first = *self
            .location_to_id
            .get(location)
            .ok_or_else(|| CoreError::UnknownLocation(location.to_string()))?;
        Ok(first..first + self.machines_per_location())
    }

    /// Resolve location tokens to global ids, in argument order.
    ///
    /// `"local"` and `"lan"` expand to the LAN range; any other token must be a
    /// WAN location of this cluster.
    pub fn location_ids(&self, names: &[&str]) -> Result<Vec<usize>> {
        let mut ids = Vec::new();
        for name in names {
            if LAN_TOKENS.contains(name) {
                ids.extend(self.lan_ids());
            } else {
                ids.extend(self.location_block(name)?);
            }
        }
        Ok(ids)
    }

    /// The WAN location owning `id` and the id's offset inside that location's block.
    pub fn location_of(&self, id: usize) -> Option<(&str, usize)> {
        let block = self.machines_per_location();
        self.location_to_id
            .iter()
            .find(|(_, &first)| id >= first && id < first + block)
            .map(|(location, &first)| (location.as_str(), id - first))
    }

    /// Name of the local directory that holds logs fetched from machine `id`.
    pub fn log_directory_name(&self, id: usize) -> Result<String> {
        if self.is_lan(id) {
            return Ok(format!("{:02}", id));
        }
        match self.location_of(id) {
            Some((location, _)) if self.is_paired() => Ok(format!("{}-{:02}", location, id)),
            Some((location, _)) => Ok(location.to_string()),
            None => Err(CoreError::NotFound(format!(
                "no location owns machine {}",
                id
            ))),
        }
    }

    /// Check the structural invariants that every persisted topology satisfies.
    pub fn validate(&self) -> Result<()> {
        let len = self.machines.len();
        if self.num_lan_machines > len {
            return Err(CoreError::corrupt(format!(
                "num_lan_machines is {} but only {} machines exist",
                self.num_lan_machines, len
            )));
        }

        let block = self.machines_per_location();
        let mut covered = vec![false; len];
        for (location, &first) in &self.location_to_id {
            if first < self.num_lan_machines || first + block > len {
                return Err(CoreError::corrupt(format!(
                    "location {} maps to ids {}..{} outside the WAN range {}..{}",
                    location,
                    first,
                    first + block,
                    self.num_lan_machines,
                    len
                )));
            }
            for slot in &mut covered[first..first + block] {
                if *slot {
                    return Err(CoreError::corrupt(format!(
                        "location {} overlaps another location",
                        location
                    )));
                }
                *slot = true;
            }
        }

        let wan_machines = self.location_to_id.len() * block;
        if self.num_lan_machines + wan_machines != len {
            return Err(CoreError::corrupt(format!(
                "{} LAN machines and {} WAN machines do not add up to {}",
                self.num_lan_machines, wan_machines, len
            )));
        }
        Ok(())
    }

    /// Render the topology as a human-diffable JSON document.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::corrupt(e.to_string()))
    }

    /// Parse and validate a topology document.
    pub fn from_json(text: &str) -> Result<Self> {
        let cluster: Cluster =
            serde_json::from_str(text).map_err(|e| CoreError::corrupt(e.to_string()))?;
        cluster.validate()?;
        Ok(cluster)
    }

    /// Persist the topology, replacing any previous file in one rename.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = self.to_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!(
                    "topology file {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&text)
    }

    /// Remove a topology file; a missing file is not an error.
    pub fn discard_file(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
