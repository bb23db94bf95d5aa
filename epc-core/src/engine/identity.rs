//! Container identity registry.
//!
//! Maps the runtime-assigned container identifier (the string the admission
//! point knows) to the numeric cgroup id that keys every accounting table.
//! Populated by registration; the aggregator only reads it.

use crate::error::{AccountingError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Thread-safe `container key -> cgroup id` map.
#[derive(Debug, Default)]
pub struct ContainerIdentityTable {
    ids: RwLock<HashMap<String, u64>>,
}

impl ContainerIdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new key.  An existing key is never overwritten.
    pub fn register(&self, key: &str, cgroup_id: u64) -> Result<()> {
        let mut ids = self
            .ids
            .write()
            .map_err(|_| AccountingError::LockPoisoned("identity"))?;
        if ids.contains_key(key) {
            return Err(AccountingError::AlreadyRegistered(key.to_owned()));
        }
        debug!(key, cgroup_id, "Registering container identity");
        ids.insert(key.to_owned(), cgroup_id);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .ids
            .read()
            .map_err(|_| AccountingError::LockPoisoned("identity"))?
            .get(key)
            .copied())
    }

    /// Remove a key, returning the cgroup id it pointed at.
    pub fn unregister(&self, key: &str) -> Result<Option<u64>> {
        let removed = self
            .ids
            .write()
            .map_err(|_| AccountingError::LockPoisoned("identity"))?
            .remove(key);
        if removed.is_some() {
            debug!(key, "Container identity removed");
        }
        Ok(removed)
    }

    /// Copy of every mapping, sorted by key.
    pub fn snapshot(&self) -> Result<Vec<(String, u64)>> {
        let mut ids: Vec<_> = self
            .ids
            .read()
            .map_err(|_| AccountingError::LockPoisoned("identity"))?
            .iter()
            .map(|(key, id)| (key.clone(), *id))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let table = ContainerIdentityTable::new();
        table.register("abc123", 42).unwrap();
        assert_eq!(table.lookup("abc123").unwrap(), Some(42));
        assert_eq!(table.lookup("missing").unwrap(), None);
    }

    #[test]
    fn test_register_twice_rejected() {
        let table = ContainerIdentityTable::new();
        table.register("abc123", 42).unwrap();
        let err = table.register("abc123", 43).unwrap_err();
        assert!(matches!(err, AccountingError::AlreadyRegistered(_)));
        assert_eq!(table.lookup("abc123").unwrap(), Some(42));
    }

    #[test]
    fn test_unregister() {
        let table = ContainerIdentityTable::new();
        table.register("abc123", 42).unwrap();
        assert_eq!(table.unregister("abc123").unwrap(), Some(42));
        assert_eq!(table.unregister("abc123").unwrap(), None);
    }

    #[test]
    fn test_threaded_registration() {
        let table = std::sync::Arc::new(ContainerIdentityTable::new());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                table.register(&format!("ctr-{i}"), i).unwrap();
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(table.snapshot().unwrap().len(), 8);
    }
}
