//! Quota State Machine
//!
//! Compares a container's aggregated EPC usage against its configured limit
//! and derives the advisory `blocked` flag consumed by an external admission
//! point.  Evaluation is pure: the caller owns the tables and applies the
//! returned [`QuotaTransition`].
//!
//! # Policy
//! - Usage strictly greater than the limit blocks the container.
//! - [`BlockPolicy::ClearOnDrop`] unblocks as soon as usage is back at or
//!   under the limit.  Flapping near the limit is possible and accepted.
//! - [`BlockPolicy::Sticky`] never unblocks on its own; only an external
//!   reset clears the flag.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// How `blocked` behaves once usage drops back under the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPolicy {
    /// Clear automatically when usage <= limit.
    #[default]
    ClearOnDrop,
    /// Stay blocked until an external reset.
    Sticky,
}

impl fmt::Display for BlockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClearOnDrop => write!(f, "clear_on_drop"),
            Self::Sticky => write!(f, "sticky"),
        }
    }
}

/// Configured limit and current policy decision for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    /// Container (cgroup) id
    pub container_id: u64,
    /// Maximum EPC bytes before the container is blocked
    pub limit_bytes: u64,
    /// Advisory flag for the admission point
    pub blocked: bool,
}

impl QuotaEntry {
    /// A fresh, unblocked entry.
    pub fn new(container_id: u64, limit_bytes: u64) -> Self {
        Self {
            container_id,
            limit_bytes,
            blocked: false,
        }
    }
}

/// Change to apply to a [`QuotaEntry`] after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTransition {
    /// Usage went over the limit.
    Blocked,
    /// Usage came back under the limit and the policy allows clearing.
    Unblocked,
    /// Nothing to do.
    Unchanged,
}

/// Answer given to an admission point asking whether a container may
/// create another enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionDecision {
    Allow,
    Deny,
}

/// Stateless evaluator for a [`BlockPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaEvaluator {
    policy: BlockPolicy,
}

impl QuotaEvaluator {
    pub fn new(policy: BlockPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BlockPolicy {
        self.policy
    }

    /// Decide what should happen to `entry` given the current usage.
    pub fn evaluate(&self, usage_bytes: u64, entry: &QuotaEntry) -> QuotaTransition {
        let over = usage_bytes > entry.limit_bytes;
        let transition = match (entry.blocked, over) {
            (false, true) => QuotaTransition::Blocked,
            (true, false) if self.policy == BlockPolicy::ClearOnDrop => QuotaTransition::Unblocked,
            _ => QuotaTransition::Unchanged,
        };
        debug!(
            container_id = entry.container_id,
            usage_bytes,
            limit_bytes = entry.limit_bytes,
            ?transition,
            "Evaluated quota"
        );
        transition
    }

    /// Evaluate and write the result into `entry`.
    pub fn apply(&self, usage_bytes: u64, entry: &mut QuotaEntry) -> QuotaTransition {
        let transition = self.evaluate(usage_bytes, entry);
        match transition {
            QuotaTransition::Blocked => entry.blocked = true,
            QuotaTransition::Unblocked => entry.blocked = false,
            QuotaTransition::Unchanged => {}
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_limit_blocks() {
        let eval = QuotaEvaluator::new(BlockPolicy::ClearOnDrop);
        let mut entry = QuotaEntry::new(1, 100);
        assert_eq!(eval.apply(150, &mut entry), QuotaTransition::Blocked);
        assert!(entry.blocked);
    }

    #[test]
    fn test_at_limit_does_not_block() {
        let eval = QuotaEvaluator::default();
        let mut entry = QuotaEntry::new(1, 100);
        assert_eq!(eval.apply(100, &mut entry), QuotaTransition::Unchanged);
        assert!(!entry.blocked);
    }

    #[test]
    fn test_clear_on_drop_unblocks() {
        let eval = QuotaEvaluator::new(BlockPolicy::ClearOnDrop);
        let mut entry = QuotaEntry::new(1, 100);
        eval.apply(150, &mut entry);
        assert_eq!(eval.apply(0, &mut entry), QuotaTransition::Unblocked);
        assert!(!entry.blocked);
    }

    #[test]
    fn test_sticky_stays_blocked() {
        let eval = QuotaEvaluator::new(BlockPolicy::Sticky);
        let mut entry = QuotaEntry::new(1, 100);
        eval.apply(150, &mut entry);
        assert_eq!(eval.apply(0, &mut entry), QuotaTransition::Unchanged);
        assert!(entry.blocked);
    }

    #[test]
    fn test_already_blocked_over_limit_unchanged() {
        let eval = QuotaEvaluator::default();
        let mut entry = QuotaEntry::new(1, 100);
        entry.blocked = true;
        assert_eq!(eval.evaluate(500, &entry), QuotaTransition::Unchanged);
    }

    #[test]
    fn test_policy_display_and_serde() {
        assert_eq!(BlockPolicy::Sticky.to_string(), "sticky");
        let parsed: BlockPolicy = serde_json::from_str("\"clear_on_drop\"").unwrap();
        assert_eq!(parsed, BlockPolicy::ClearOnDrop);
    }
}
