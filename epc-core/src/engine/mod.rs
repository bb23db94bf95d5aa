//! Engine module - Core accounting components
//!
//! This module contains the state the accounting core owns: the usage and
//! quota tables, the container identity map, the quota state machine, and
//! the aggregator that ties them to an event source.

pub mod aggregator;
pub mod identity;
pub mod quota;
pub mod tables;

pub use aggregator::{Aggregator, ApplyOutcome, RegistrationSync, RunSummary, StopReason};
pub use identity::ContainerIdentityTable;
pub use quota::{AdmissionDecision, BlockPolicy, QuotaEntry, QuotaEvaluator, QuotaTransition};
pub use tables::{ContainerUsageEntry, QuotaTable, TaskUsageEntry, UsageTables};
