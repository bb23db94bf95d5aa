//! Aggregator configuration.

use crate::engine::quota::BlockPolicy;
use crate::error::{AccountingError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Enclave pages are always 4 KiB.
pub const EPC_PAGE_SIZE: u64 = 4096;

/// Configuration for the accounting aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How long the consumer waits for the next event before re-checking shutdown
    pub poll_interval_ms: u64,
    /// Maximum number of live task entries
    pub max_tasks: usize,
    /// Maximum number of container entries
    pub max_containers: usize,
    /// CREATE lengths above this are discarded as implausible
    pub max_event_bytes: u64,
    /// CREATE lengths must be a multiple of this; 1 disables the check
    pub alignment_bytes: u64,
    /// What happens to `blocked` once usage drops back under the limit
    pub block_policy: BlockPolicy,
    /// Bound of the in-process event channel
    pub channel_capacity: usize,
    /// Persisted state location
    pub snapshot_path: Option<PathBuf>,
    /// How often the daemon re-reads registrations from the state file
    pub registration_sync_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_tasks: 1024,
            max_containers: 1024,
            max_event_bytes: 128 * 1024 * 1024 * 1024, // 128 GiB
            alignment_bytes: 1,
            block_policy: BlockPolicy::ClearOnDrop,
            channel_capacity: 4096,
            snapshot_path: None,
            registration_sync_ms: 1000,
        }
    }
}

impl AggregatorConfig {
    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the aggregator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AccountingError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.max_tasks == 0 || self.max_containers == 0 {
            return Err(AccountingError::InvalidConfig(
                "table capacities must be positive".into(),
            ));
        }
        if self.alignment_bytes == 0 {
            return Err(AccountingError::InvalidConfig(
                "alignment_bytes must be positive".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(AccountingError::InvalidConfig(
                "channel_capacity must be positive".into(),
            ));
        }
        if self.registration_sync_ms == 0 {
            return Err(AccountingError::InvalidConfig(
                "registration_sync_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Poll timeout as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Registration reload period as a [`Duration`].
    pub fn registration_sync_interval(&self) -> Duration {
        Duration::from_millis(self.registration_sync_ms)
    }
}
