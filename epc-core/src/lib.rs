//! EPC Core - SGX Enclave Page Cache Usage Accounting
//!
//! This crate tracks how much SGX EPC each task and each container holds,
//! driven by a lossy stream of enclave CREATE/DELETE events, and derives an
//! advisory `blocked` flag per container from a configured limit.
//!
//! # Architecture:
//! - [`source`]: where events come from (in-process channel, raw record stream)
//! - [`engine`]: usage/quota tables and the single-consumer [`Aggregator`]
//! - [`snapshot`]: read-only views and the persisted container state
//! - [`registration`]: container key, cgroup id, and EPC limit from an OCI bundle
//!
//! # Performance-First Design:
//! - Producers never block; a full buffer drops the event
//! - One short critical section per event covers both usage tables
//! - Readers copy under the lock and iterate the copy

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod registration;
pub mod snapshot;
pub mod source;

pub use config::AggregatorConfig;
pub use engine::{
    AdmissionDecision, Aggregator, ApplyOutcome, BlockPolicy, QuotaEntry, QuotaTransition,
    RegistrationSync, RunSummary, StopReason,
};
pub use error::{AccountingError, Result};
pub use event::{Action, EnclaveLifecycleEvent, RawEnclaveEvent, RAW_EVENT_SIZE};
pub use metrics::{AccountingMetrics, MetricsSnapshot};
pub use registration::Registration;
pub use snapshot::{AccountingSnapshot, ContainerView, PersistedState, TaskView};
pub use source::{ChannelSource, EventProducer, EventSource, RecordStreamSource};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`.  Calling it twice is harmless;
/// the second subscriber is simply not installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        info!("Initializing EPC accounting v{}", env!("CARGO_PKG_VERSION"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
