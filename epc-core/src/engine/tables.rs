//! Usage and Quota Tables
//!
//! Process-wide accounting state lives in two tables with different access
//! patterns:
//!
//! - [`UsageTables`] holds the per-task and per-container running totals.
//!   Both maps sit behind ONE mutex so a CREATE or DELETE updates them in a
//!   single critical section; a reader can never see a container total that
//!   the task totals do not justify.
//! - [`QuotaTable`] holds configured limits and the `blocked` flag.  It is
//!   read far more often than written, so it uses an `RwLock`.
//!
//! Lock order is always usage before quota.
//!
//! Both usage maps are bounded, mirroring the fixed-size kernel maps they
//! replace.  A full map refuses the new key with
//! [`AccountingError::CapacityExhausted`] and only that event is lost; keys
//! already present keep updating.  An allocator failure while growing a map
//! is reported as [`AccountingError::AllocationFailed`].

use crate::engine::quota::QuotaEntry;
use crate::error::{AccountingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

/// EPC bytes currently attributed to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUsageEntry {
    pub task_id: u64,
    /// Container the task was first seen in
    pub container_id: u64,
    pub bytes: u64,
}

/// EPC bytes aggregated over every task attributed to one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsageEntry {
    pub container_id: u64,
    pub bytes: u64,
}

/// Result of applying a CREATE to the usage maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTotals {
    pub task_total: u64,
    pub container_total: u64,
}

/// Result of applying a DELETE for a known task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteTotals {
    /// Whole task total that was released
    pub released: u64,
    /// Container total after the (clamped) subtraction
    pub container_total: u64,
}

/// The two usage maps, only reachable through [`UsageTables::lock`].
#[derive(Debug)]
pub struct UsageState {
    tasks: HashMap<u64, TaskUsageEntry>,
    containers: HashMap<u64, ContainerUsageEntry>,
    max_tasks: usize,
    max_containers: usize,
}

impl UsageState {
    fn new(max_tasks: usize, max_containers: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            containers: HashMap::new(),
            max_tasks,
            max_containers,
        }
    }

    fn ensure_task_slot(&mut self, task_id: u64) -> Result<()> {
        if self.tasks.contains_key(&task_id) {
            return Ok(());
        }
        if self.tasks.len() >= self.max_tasks {
            return Err(AccountingError::CapacityExhausted {
                table: "task",
                capacity: self.max_tasks,
            });
        }
        self.tasks
            .try_reserve(1)
            .map_err(|_| AccountingError::AllocationFailed("task"))
    }

    fn ensure_container_slot(&mut self, container_id: u64) -> Result<()> {
        if self.containers.contains_key(&container_id) {
            return Ok(());
        }
        if self.containers.len() >= self.max_containers {
            return Err(AccountingError::CapacityExhausted {
                table: "container",
                capacity: self.max_containers,
            });
        }
        self.containers
            .try_reserve(1)
            .map_err(|_| AccountingError::AllocationFailed("container"))
    }

    /// Add `bytes` to both the task and the container total.
    ///
    /// Capacity is checked for both keys before either map is touched, so a
    /// refused CREATE leaves no partial state behind.
    pub fn create(&mut self, container_id: u64, task_id: u64, bytes: u64) -> Result<CreateTotals> {
        self.ensure_task_slot(task_id)?;
        self.ensure_container_slot(container_id)?;

        let task = self.tasks.entry(task_id).or_insert(TaskUsageEntry {
            task_id,
            container_id,
            bytes: 0,
        });
        task.bytes = task.bytes.saturating_add(bytes);
        let task_total = task.bytes;

        let container = self
            .containers
            .entry(container_id)
            .or_insert(ContainerUsageEntry {
                container_id,
                bytes: 0,
            });
        container.bytes = container.bytes.saturating_add(bytes);

        Ok(CreateTotals {
            task_total,
            container_total: container.bytes,
        })
    }

    /// Release a task's entire recorded usage from `container_id`.
    ///
    /// Returns `Ok(None)` when the task has no entry; nothing is touched in
    /// that case.  The container total is clamped at zero, and a container
    /// with no entry stays absent.
    pub fn delete(&mut self, container_id: u64, task_id: u64) -> Result<Option<DeleteTotals>> {
        let Some(task) = self.tasks.remove(&task_id) else {
            return Ok(None);
        };
        let released = task.bytes;

        let container_total = match self.containers.get_mut(&container_id) {
            Some(container) => {
                if released > container.bytes {
                    debug!(
                        container_id,
                        task_id,
                        released,
                        container_bytes = container.bytes,
                        "Clamping container usage at zero"
                    );
                }
                container.bytes = container.bytes.saturating_sub(released);
                container.bytes
            }
            None => {
                debug!(
                    container_id,
                    task_id,
                    released,
                    "DELETE for container with no usage entry"
                );
                0
            }
        };

        Ok(Some(DeleteTotals {
            released,
            container_total,
        }))
    }

    /// Seed a container total, used when restoring persisted state.
    pub fn restore_container(&mut self, container_id: u64, bytes: u64) -> Result<()> {
        self.ensure_container_slot(container_id)?;
        self.containers.insert(
            container_id,
            ContainerUsageEntry {
                container_id,
                bytes,
            },
        );
        Ok(())
    }

    pub fn container_bytes(&self, container_id: u64) -> Option<u64> {
        self.containers.get(&container_id).map(|entry| entry.bytes)
    }

    pub fn task_bytes(&self, task_id: u64) -> Option<u64> {
        self.tasks.get(&task_id).map(|entry| entry.bytes)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Copy of every task entry, sorted by task id.
    pub fn tasks(&self) -> Vec<TaskUsageEntry> {
        let mut tasks: Vec<_> = self.tasks.values().copied().collect();
        tasks.sort_by_key(|entry| entry.task_id);
        tasks
    }

    /// Copy of every container entry, sorted by container id.
    pub fn containers(&self) -> Vec<ContainerUsageEntry> {
        let mut containers: Vec<_> = self.containers.values().copied().collect();
        containers.sort_by_key(|entry| entry.container_id);
        containers
    }
}

/// Per-task and per-container usage guarded by a single mutex.
#[derive(Debug)]
pub struct UsageTables {
    state: Mutex<UsageState>,
}

impl UsageTables {
    /// Create empty tables bounded to the given number of keys.
    pub fn new(max_tasks: usize, max_containers: usize) -> Self {
        Self {
            state: Mutex::new(UsageState::new(max_tasks, max_containers)),
        }
    }

    /// Enter the usage critical section.
    pub fn lock(&self) -> Result<MutexGuard<'_, UsageState>> {
        self.state
            .lock()
            .map_err(|_| AccountingError::LockPoisoned("usage"))
    }

    pub fn container_bytes(&self, container_id: u64) -> Result<Option<u64>> {
        Ok(self.lock()?.container_bytes(container_id))
    }

    pub fn task_bytes(&self, task_id: u64) -> Result<Option<u64>> {
        Ok(self.lock()?.task_bytes(task_id))
    }

    pub fn tasks(&self) -> Result<Vec<TaskUsageEntry>> {
        Ok(self.lock()?.tasks())
    }

    pub fn containers(&self) -> Result<Vec<ContainerUsageEntry>> {
        Ok(self.lock()?.containers())
    }
}

/// Configured limits and blocked flags, keyed by container id.
#[derive(Debug, Default)]
pub struct QuotaTable {
    entries: RwLock<HashMap<u64, QuotaEntry>>,
}

impl QuotaTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<u64, QuotaEntry>>> {
        self.entries
            .read()
            .map_err(|_| AccountingError::LockPoisoned("quota"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<u64, QuotaEntry>>> {
        self.entries
            .write()
            .map_err(|_| AccountingError::LockPoisoned("quota"))
    }

    /// Set (or replace) the limit for a container, keeping its blocked flag.
    pub fn set_limit(&self, container_id: u64, limit_bytes: u64) -> Result<QuotaEntry> {
        let mut entries = self.write()?;
        let entry = entries
            .entry(container_id)
            .or_insert_with(|| QuotaEntry::new(container_id, limit_bytes));
        entry.limit_bytes = limit_bytes;
        Ok(*entry)
    }

    /// Insert a complete entry, used when restoring persisted state.
    pub fn insert(&self, entry: QuotaEntry) -> Result<()> {
        self.write()?.insert(entry.container_id, entry);
        Ok(())
    }

    pub fn get(&self, container_id: u64) -> Result<Option<QuotaEntry>> {
        Ok(self.read()?.get(&container_id).copied())
    }

    pub fn limit(&self, container_id: u64) -> Result<Option<u64>> {
        Ok(self.get(container_id)?.map(|entry| entry.limit_bytes))
    }

    /// `None` when the container has no quota configured.
    pub fn is_blocked(&self, container_id: u64) -> Result<Option<bool>> {
        Ok(self.get(container_id)?.map(|entry| entry.blocked))
    }

    /// Overwrite the blocked flag (external policy decision).
    ///
    /// Returns `false` if the container has no quota entry.
    pub fn set_blocked(&self, container_id: u64, blocked: bool) -> Result<bool> {
        let mut entries = self.write()?;
        match entries.get_mut(&container_id) {
            Some(entry) => {
                entry.blocked = blocked;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run `f` on the entry for `container_id`, if any.
    pub fn update<F, T>(&self, container_id: u64, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut QuotaEntry) -> T,
    {
        let mut entries = self.write()?;
        Ok(entries.get_mut(&container_id).map(f))
    }

    pub fn remove(&self, container_id: u64) -> Result<Option<QuotaEntry>> {
        Ok(self.write()?.remove(&container_id))
    }

    /// Copy of every entry, sorted by container id.
    pub fn snapshot(&self) -> Result<Vec<QuotaEntry>> {
        let mut entries: Vec<_> = self.read()?.values().copied().collect();
        entries.sort_by_key(|entry| entry.container_id);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── UsageTables tests ─────────────────────────────────────────────

    #[test]
    fn test_create_accumulates() {
        let tables = UsageTables::new(16, 16);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 100).unwrap();
        let totals = usage.create(1, 10, 50).unwrap();
        assert_eq!(totals.task_total, 150);
        assert_eq!(totals.container_total, 150);
        assert_eq!(usage.task_count(), 1);
    }

    #[test]
    fn test_delete_releases_whole_task() {
        let tables = UsageTables::new(16, 16);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 100).unwrap();
        usage.create(1, 11, 30).unwrap();

        let totals = usage.delete(1, 10).unwrap().unwrap();
        assert_eq!(totals.released, 100);
        assert_eq!(totals.container_total, 30);
        assert_eq!(usage.task_bytes(10), None);
    }

    #[test]
    fn test_delete_unknown_task_is_noop() {
        let tables = UsageTables::new(16, 16);
        let mut usage = tables.lock().unwrap();
        assert_eq!(usage.delete(1, 99).unwrap(), None);
        assert_eq!(usage.container_count(), 0);
        assert_eq!(usage.task_count(), 0);
    }

    #[test]
    fn test_delete_clamps_at_zero() {
        let tables = UsageTables::new(16, 16);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 100).unwrap();
        // Pretend earlier drops left the container undercounted.
        usage.restore_container(1, 40).unwrap();
        let totals = usage.delete(1, 10).unwrap().unwrap();
        assert_eq!(totals.container_total, 0);
    }

    #[test]
    fn test_task_capacity_is_enforced_without_partial_state() {
        let tables = UsageTables::new(1, 16);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 4096).unwrap();

        let err = usage.create(2, 11, 4096).unwrap_err();
        assert!(matches!(
            err,
            AccountingError::CapacityExhausted { table: "task", .. }
        ));
        // Container 2 must not have been created.
        assert_eq!(usage.container_bytes(2), None);
        // Existing keys still accept updates.
        assert_eq!(usage.create(1, 10, 4096).unwrap().task_total, 8192);
    }

    #[test]
    fn test_container_capacity_is_enforced() {
        let tables = UsageTables::new(16, 1);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 4096).unwrap();
        let err = usage.create(2, 11, 4096).unwrap_err();
        assert!(matches!(
            err,
            AccountingError::CapacityExhausted {
                table: "container",
                ..
            }
        ));
        assert_eq!(usage.task_bytes(11), None);
    }

    #[test]
    fn test_delete_never_needs_a_container_slot() {
        let tables = UsageTables::new(16, 1);
        let mut usage = tables.lock().unwrap();
        usage.create(1, 10, 4096).unwrap();

        // Task 10 exits reported under a container the full table has never seen.
        let totals = usage.delete(2, 10).unwrap().unwrap();
        assert_eq!(totals.released, 4096);
        assert_eq!(totals.container_total, 0);
        assert_eq!(usage.container_count(), 1);
        assert_eq!(usage.container_bytes(2), None);
        assert_eq!(usage.task_bytes(10), None);
    }

    #[test]
    fn test_snapshots_sorted() {
        let tables = UsageTables::new(16, 16);
        {
            let mut usage = tables.lock().unwrap();
            usage.create(3, 30, 1).unwrap();
            usage.create(1, 10, 1).unwrap();
            usage.create(2, 20, 1).unwrap();
        }
        let ids: Vec<_> = tables
            .containers()
            .unwrap()
            .iter()
            .map(|c| c.container_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tables.tasks().unwrap()[0].task_id, 10);
    }

    // ── QuotaTable tests ──────────────────────────────────────────────

    #[test]
    fn test_quota_set_and_get() {
        let quotas = QuotaTable::new();
        assert_eq!(quotas.limit(1).unwrap(), None);
        assert_eq!(quotas.is_blocked(1).unwrap(), None);

        quotas.set_limit(1, 100).unwrap();
        assert_eq!(quotas.limit(1).unwrap(), Some(100));
        assert_eq!(quotas.is_blocked(1).unwrap(), Some(false));
    }

    #[test]
    fn test_quota_set_limit_keeps_blocked() {
        let quotas = QuotaTable::new();
        quotas.set_limit(1, 100).unwrap();
        assert!(quotas.set_blocked(1, true).unwrap());
        let entry = quotas.set_limit(1, 200).unwrap();
        assert!(entry.blocked);
        assert_eq!(entry.limit_bytes, 200);
    }

    #[test]
    fn test_quota_set_blocked_missing() {
        let quotas = QuotaTable::new();
        assert!(!quotas.set_blocked(7, true).unwrap());
    }

    #[test]
    fn test_quota_remove_and_snapshot() {
        let quotas = QuotaTable::new();
        quotas.set_limit(2, 20).unwrap();
        quotas.set_limit(1, 10).unwrap();
        assert_eq!(quotas.snapshot().unwrap()[0].container_id, 1);
        assert!(quotas.remove(1).unwrap().is_some());
        assert_eq!(quotas.snapshot().unwrap().len(), 1);
    }
}
