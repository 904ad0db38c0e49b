use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{CoreError, Result};

/// Location → first-id map filled in by concurrent provisioning tasks.
///
/// Every insert goes through the lock, so tasks that each own one machine can
/// register their location without aliasing the cluster's map.
#[derive(Debug, Default)]
pub struct LocationRegistry {
    entries: Mutex<BTreeMap<String, usize>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `location` starts at global id `id`.
    ///
    /// Registering the same location twice is an error even with the same id.
    pub fn register(&self, location: &str, id: usize) -> Result<()> {
        let mut entries = self.entries()?;
        if let Some(existing) = entries.get(location) {
            return Err(CoreError::AlreadyExists(format!(
                "location {} already registered at id {}",
                location, existing
            )));
        }
        entries.insert(location.to_string(), id);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.is_empty())
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, usize>>> {
        self.entries
            .lock()
            .map_err(|_| CoreError::corrupt("location registry lock poisoned"))
    }

    pub fn into_map(self) -> Result<BTreeMap<String, usize>> {
        self.entries
            .into_inner()
            .map_err(|_| CoreError::corrupt("location registry lock poisoned"))
    }
}
