//! Error types for the EPC accounting core.
//!
//! Only storage failures ([`AccountingError::AllocationFailed`] and a
//! poisoned table lock) are fatal to the consumer loop.  A full table
//! refuses one new key; that event is logged and skipped like a malformed
//! record.

/// Result type alias for accounting operations.
pub type Result<T> = std::result::Result<T, AccountingError>;

/// Errors produced while decoding, applying, or configuring accounting state.
#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    // =========================================================================
    // Event Errors
    // =========================================================================
    /// Raw record shorter than the fixed event layout.
    #[error("truncated event record: {len} bytes, expected {expected}")]
    TruncatedRecord { len: usize, expected: usize },

    /// Action tag outside the known CREATE/DELETE set.
    #[error("unknown action tag {tag} (container {container_id}, task {task_id})")]
    UnknownAction {
        tag: i32,
        container_id: u64,
        task_id: u64,
    },

    /// CREATE with a zero, unaligned, or implausibly large byte length.
    #[error("malformed CREATE for task {task_id} in container {container_id}: {reason}")]
    MalformedCreate {
        container_id: u64,
        task_id: u64,
        reason: String,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// A table refused a new key because it reached its configured capacity.
    #[error("{table} table is full ({capacity} entries)")]
    CapacityExhausted { table: &'static str, capacity: usize },

    /// The allocator could not grow a table.
    #[error("cannot grow {0} table: allocation failed")]
    AllocationFailed(&'static str),

    /// A table lock was poisoned by a panicking holder.
    #[error("{0} table lock poisoned")]
    LockPoisoned(&'static str),

    // =========================================================================
    // Configuration / Registration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource quantity string could not be parsed.
    #[error("invalid quantity '{input}': {reason}")]
    InvalidQuantity { input: String, reason: String },

    /// cgroupsPath not in `slice:prefix:id` form.
    #[error("invalid cgroups path '{0}'")]
    InvalidCgroupsPath(String),

    /// `SGX_EPC_SIZE*` not present in the container environment.
    #[error("{0}* environment variable is not set")]
    MissingEpcSize(&'static str),

    /// Container key already mapped to a cgroup id.
    #[error("container '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Container key not known to the identity table.
    #[error("container '{0}' is not registered")]
    NotRegistered(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Underlying event stream or filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be (de)serialized.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AccountingError {
    /// Returns `true` for errors that must stop the consumer loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed(_) | Self::LockPoisoned(_)
        )
    }

    /// Returns `true` when a table refused a new key for one event.
    pub fn is_capacity_refusal(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }

    /// Returns `true` for errors describing one discarded event.
    pub fn is_malformed_event(&self) -> bool {
        matches!(
            self,
            Self::TruncatedRecord { .. } | Self::UnknownAction { .. } | Self::MalformedCreate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let full = AccountingError::CapacityExhausted {
            table: "task",
            capacity: 4,
        };
        assert!(!full.is_fatal());
        assert!(full.is_capacity_refusal());
        assert!(!full.is_malformed_event());

        assert!(AccountingError::AllocationFailed("task").is_fatal());
        assert!(AccountingError::LockPoisoned("usage").is_fatal());

        let bad = AccountingError::UnknownAction {
            tag: 7,
            container_id: 1,
            task_id: 2,
        };
        assert!(!bad.is_fatal());
        assert!(bad.is_malformed_event());
    }

    #[test]
    fn test_display() {
        let err = AccountingError::CapacityExhausted {
            table: "container",
            capacity: 1024,
        };
        assert_eq!(err.to_string(), "container table is full (1024 entries)");
    }
}
