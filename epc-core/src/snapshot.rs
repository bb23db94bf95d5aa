//! Point-in-time views and persisted state.
//!
//! Views are built by copying the tables under a short lock and iterating
//! the copy, so exporters never hold a lock the aggregator needs for longer
//! than a few map clones.
//!
//! Persisted state keeps one record per container (`limit_bytes`, `bytes`,
//! `blocked`) plus the identity map.  Task entries are never persisted: after
//! a restart they are re-derived from new CREATE events, and the container
//! totals undercount until running processes re-report.

use crate::engine::identity::ContainerIdentityTable;
use crate::engine::quota::QuotaEntry;
use crate::engine::tables::{ContainerUsageEntry, QuotaTable, TaskUsageEntry, UsageTables};
use crate::error::{AccountingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Current on-disk format version.
pub const PERSISTED_STATE_VERSION: u32 = 1;

/// Usage and quota state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerView {
    pub container_id: u64,
    pub bytes: u64,
    /// `None` when no quota is configured
    pub limit_bytes: Option<u64>,
    pub blocked: bool,
}

/// Usage of one live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: u64,
    pub container_id: u64,
    pub bytes: u64,
}

impl From<TaskUsageEntry> for TaskView {
    fn from(entry: TaskUsageEntry) -> Self {
        Self {
            task_id: entry.task_id,
            container_id: entry.container_id,
            bytes: entry.bytes,
        }
    }
}

/// Registered container key and the cgroup id it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityView {
    pub key: String,
    pub cgroup_id: u64,
}

/// Read-only copy of every accounting table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingSnapshot {
    pub containers: Vec<ContainerView>,
    pub tasks: Vec<TaskView>,
    pub identities: Vec<IdentityView>,
    /// Milliseconds since the Unix epoch
    pub taken_at_ms: u64,
}

impl AccountingSnapshot {
    /// Copy the tables.
    ///
    /// Usage and quota state are copied under one usage lock, so every
    /// container total equals the sum of its tasks and its blocked flag
    /// matches that total.  Identities are copied afterwards.
    pub(crate) fn capture(
        usage: &UsageTables,
        quotas: &QuotaTable,
        identities: &ContainerIdentityTable,
    ) -> Result<Self> {
        let (containers, tasks, quotas) = {
            let usage = usage.lock()?;
            (usage.containers(), usage.tasks(), quotas.snapshot()?)
        };

        Ok(Self {
            containers: merge_container_views(&containers, &quotas),
            tasks: tasks.into_iter().map(TaskView::from).collect(),
            identities: identities
                .snapshot()?
                .into_iter()
                .map(|(key, cgroup_id)| IdentityView { key, cgroup_id })
                .collect(),
            taken_at_ms: now_ms(),
        })
    }

    /// Total EPC bytes over every tracked container.
    pub fn total_bytes(&self) -> u64 {
        self.containers
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.bytes))
    }

    /// Containers currently flagged as blocked.
    pub fn blocked_containers(&self) -> Vec<u64> {
        self.containers
            .iter()
            .filter(|c| c.blocked)
            .map(|c| c.container_id)
            .collect()
    }
}

/// Join usage and quota entries into one view per container id.
///
/// Containers with a quota but no usage yet are listed with zero bytes.
pub(crate) fn merge_container_views(
    usage: &[ContainerUsageEntry],
    quotas: &[QuotaEntry],
) -> Vec<ContainerView> {
    let mut views: BTreeMap<u64, ContainerView> = usage
        .iter()
        .map(|entry| {
            (
                entry.container_id,
                ContainerView {
                    container_id: entry.container_id,
                    bytes: entry.bytes,
                    limit_bytes: None,
                    blocked: false,
                },
            )
        })
        .collect();

    for quota in quotas {
        let view = views.entry(quota.container_id).or_insert(ContainerView {
            container_id: quota.container_id,
            bytes: 0,
            limit_bytes: None,
            blocked: false,
        });
        view.limit_bytes = Some(quota.limit_bytes);
        view.blocked = quota.blocked;
    }

    views.into_values().collect()
}

/// One persisted container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedContainer {
    pub limit_bytes: Option<u64>,
    pub bytes: u64,
    pub blocked: bool,
}

/// Restart-survivable subset of the accounting state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub containers: BTreeMap<u64, PersistedContainer>,
    #[serde(default)]
    pub identities: BTreeMap<String, u64>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            containers: BTreeMap::new(),
            identities: BTreeMap::new(),
        }
    }
}

impl PersistedState {
    /// Build from a point-in-time snapshot, dropping task entries.
    pub fn from_snapshot(snapshot: &AccountingSnapshot) -> Self {
        let containers = snapshot
            .containers
            .iter()
            .map(|c| {
                (
                    c.container_id,
                    PersistedContainer {
                        limit_bytes: c.limit_bytes,
                        bytes: c.bytes,
                        blocked: c.blocked,
                    },
                )
            })
            .collect();
        let identities = snapshot
            .identities
            .iter()
            .map(|id| (id.key.clone(), id.cgroup_id))
            .collect();

        Self {
            version: PERSISTED_STATE_VERSION,
            containers,
            identities,
        }
    }

    /// Write as JSON through a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        info!(
            path = %path.display(),
            containers = self.containers.len(),
            "Persisted accounting state"
        );
        Ok(())
    }

    /// Read persisted state; a missing file is a cold start.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No persisted state, cold start");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let state: Self = serde_json::from_str(&raw)?;
        if state.version != PERSISTED_STATE_VERSION {
            return Err(AccountingError::InvalidConfig(format!(
                "unsupported persisted state version {}",
                state.version
            )));
        }
        Ok(Some(state))
    }

    /// Identity map as a lookup table.
    pub fn identity_map(&self) -> HashMap<&str, u64> {
        self.identities
            .iter()
            .map(|(key, id)| (key.as_str(), *id))
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_includes_quota_only_containers() {
        let usage = [ContainerUsageEntry {
            container_id: 1,
            bytes: 100,
        }];
        let quotas = [
            QuotaEntry {
                container_id: 1,
                limit_bytes: 50,
                blocked: true,
            },
            QuotaEntry::new(2, 500),
        ];

        let views = merge_container_views(&usage, &quotas);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].bytes, 100);
        assert_eq!(views[0].limit_bytes, Some(50));
        assert!(views[0].blocked);
        assert_eq!(views[1].container_id, 2);
        assert_eq!(views[1].bytes, 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epc-state.json");

        let mut state = PersistedState::default();
        state.containers.insert(
            9,
            PersistedContainer {
                limit_bytes: Some(1 << 20),
                bytes: 4096,
                blocked: false,
            },
        );
        state.identities.insert("abc".into(), 9);
        state.save(&path).unwrap();

        let loaded = PersistedState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.identity_map()["abc"], 9);
        // The temporary file is gone after the rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_missing_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PersistedState::load(&dir.path().join("none.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{ "version": 7, "containers": {} }"#).unwrap();
        assert!(matches!(
            PersistedState::load(&path),
            Err(AccountingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_snapshot_helpers() {
        let snapshot = AccountingSnapshot {
            containers: vec![
                ContainerView {
                    container_id: 1,
                    bytes: 10,
                    limit_bytes: Some(5),
                    blocked: true,
                },
                ContainerView {
                    container_id: 2,
                    bytes: 20,
                    limit_bytes: None,
                    blocked: false,
                },
            ],
            tasks: vec![],
            identities: vec![],
            taken_at_ms: 0,
        };
        assert_eq!(snapshot.total_bytes(), 30);
        assert_eq!(snapshot.blocked_containers(), vec![1]);

        let persisted = PersistedState::from_snapshot(&snapshot);
        assert_eq!(persisted.containers[&2].limit_bytes, None);
    }
}
