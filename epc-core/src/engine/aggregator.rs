//! EPC Usage Aggregator
//!
//! The aggregator is the single owner of the accounting tables.  It drains
//! an [`EventSource`], applies each enclave lifecycle event to the per-task
//! and per-container totals, and re-evaluates the container's quota before
//! the event is considered applied.
//!
//! # Event protocol:
//! - **CREATE(c, t, n)**: task `t` and container `c` both grow by `n`
//! - **DELETE(c, t)**: task `t`'s whole total is subtracted from `c`
//!   (clamped at zero) and the task entry is removed; an unknown task is a
//!   no-op, since its CREATE may have been dropped by the transport
//!
//! Both totals change inside one critical section, and the quota decision
//! for the affected container is taken while that section is still held.
//! Readers therefore see either the state before an event or the state
//! after it, including the `blocked` flag.
//!
//! Events for different tasks commute; events for one task are applied in
//! delivery order because there is exactly one consumer.

use crate::config::AggregatorConfig;
use crate::engine::identity::ContainerIdentityTable;
use crate::engine::quota::{AdmissionDecision, QuotaEntry, QuotaEvaluator, QuotaTransition};
use crate::engine::tables::{QuotaTable, UsageState, UsageTables};
use crate::error::{AccountingError, Result};
use crate::event::{Action, EnclaveLifecycleEvent};
use crate::metrics::{AccountingMetrics, ApplyTimer};
use crate::registration::Registration;
use crate::snapshot::{merge_container_views, AccountingSnapshot, ContainerView, PersistedState};
use crate::source::EventSource;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// CREATE applied.
    Created {
        task_total: u64,
        container_total: u64,
        /// `None` when the container has no quota configured
        quota: Option<QuotaTransition>,
    },
    /// DELETE applied to a known task.
    Deleted {
        released: u64,
        container_total: u64,
        quota: Option<QuotaTransition>,
    },
    /// DELETE for a task with no entry; nothing changed.
    OrphanDelete,
}

/// Why the consumer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested.
    Shutdown,
    /// The event source closed.
    SourceClosed,
}

/// Counts for one run of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: u64,
    pub orphan_deletes: u64,
    pub malformed: u64,
    /// Events discarded because a table was full
    pub refused: u64,
    pub stop_reason: StopReason,
}

/// Changes made by [`Aggregator::sync_registrations`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationSync {
    pub identities_added: usize,
    pub identities_removed: usize,
    pub limits_set: usize,
    pub limits_removed: usize,
}

impl RegistrationSync {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Owner of all accounting state.
///
/// Constructed once at startup and shared as `Arc<Aggregator>`; readers use
/// the query methods, the consumer loop uses [`run`](Self::run).
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    usage: UsageTables,
    quotas: QuotaTable,
    identities: ContainerIdentityTable,
    evaluator: QuotaEvaluator,
    metrics: Arc<AccountingMetrics>,
}

impl Aggregator {
    /// Create an aggregator with default configuration
    pub fn new() -> Arc<Self> {
        Self::build(AggregatorConfig::default(), AccountingMetrics::new())
    }

    /// Create an aggregator with custom configuration
    pub fn with_config(config: AggregatorConfig) -> Result<Arc<Self>> {
        Self::with_metrics(config, AccountingMetrics::new())
    }

    /// Create an aggregator sharing an existing counter set
    pub fn with_metrics(
        config: AggregatorConfig,
        metrics: Arc<AccountingMetrics>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(config, metrics))
    }

    fn build(config: AggregatorConfig, metrics: Arc<AccountingMetrics>) -> Arc<Self> {
        info!(
            max_tasks = config.max_tasks,
            max_containers = config.max_containers,
            block_policy = %config.block_policy,
            "Creating EPC aggregator"
        );
        Arc::new(Self {
            usage: UsageTables::new(config.max_tasks, config.max_containers),
            quotas: QuotaTable::new(),
            identities: ContainerIdentityTable::new(),
            evaluator: QuotaEvaluator::new(config.block_policy),
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<AccountingMetrics> {
        self.metrics.clone()
    }

    // ── event application ─────────────────────────────────────────────

    /// Apply one event.
    ///
    /// Malformed CREATEs are rejected before any table is touched.
    pub fn apply(&self, event: &EnclaveLifecycleEvent) -> Result<ApplyOutcome> {
        let _timer = ApplyTimer::new(&self.metrics);
        match event.action {
            Action::Create => self.apply_create(event),
            Action::Delete => self.apply_delete(event),
        }
    }

    fn apply_create(&self, event: &EnclaveLifecycleEvent) -> Result<ApplyOutcome> {
        if let Err(e) = self.validate_create(event) {
            self.metrics.record_malformed();
            return Err(e);
        }

        let mut usage = self.usage.lock()?;
        let totals = match usage.create(event.container_id, event.task_id, event.bytes) {
            Ok(totals) => totals,
            Err(e) => {
                drop(usage);
                if e.is_capacity_refusal() {
                    self.metrics.record_refused();
                }
                return Err(e);
            }
        };
        let quota = self.evaluate_locked(&usage, event.container_id)?;
        drop(usage);

        self.metrics.record_create(event.bytes);
        debug!(
            container_id = event.container_id,
            task_id = event.task_id,
            bytes = event.bytes,
            task_total = totals.task_total,
            container_total = totals.container_total,
            "Container created enclave"
        );

        Ok(ApplyOutcome::Created {
            task_total: totals.task_total,
            container_total: totals.container_total,
            quota,
        })
    }

    fn apply_delete(&self, event: &EnclaveLifecycleEvent) -> Result<ApplyOutcome> {
        let mut usage = self.usage.lock()?;
        let Some(totals) = usage.delete(event.container_id, event.task_id)? else {
            drop(usage);
            self.metrics.record_orphan_delete();
            debug!(
                container_id = event.container_id,
                task_id = event.task_id,
                "DELETE for unknown task, ignoring"
            );
            return Ok(ApplyOutcome::OrphanDelete);
        };
        let quota = self.evaluate_locked(&usage, event.container_id)?;
        drop(usage);

        self.metrics.record_delete(totals.released);
        debug!(
            container_id = event.container_id,
            task_id = event.task_id,
            released = totals.released,
            container_total = totals.container_total,
            "Container deleted enclave"
        );

        Ok(ApplyOutcome::Deleted {
            released: totals.released,
            container_total: totals.container_total,
            quota,
        })
    }

    fn validate_create(&self, event: &EnclaveLifecycleEvent) -> Result<()> {
        let reason = if event.bytes == 0 {
            "zero length".to_string()
        } else if event.bytes > self.config.max_event_bytes {
            format!(
                "{} bytes exceeds plausible maximum {}",
                event.bytes, self.config.max_event_bytes
            )
        } else if event.bytes % self.config.alignment_bytes != 0 {
            format!(
                "{} bytes is not a multiple of {}",
                event.bytes, self.config.alignment_bytes
            )
        } else {
            return Ok(());
        };

        Err(AccountingError::MalformedCreate {
            container_id: event.container_id,
            task_id: event.task_id,
            reason,
        })
    }

    /// Re-evaluate the quota of `container_id` while the usage lock is held.
    fn evaluate_locked(
        &self,
        usage: &UsageState,
        container_id: u64,
    ) -> Result<Option<QuotaTransition>> {
        Ok(self
            .evaluate_entry_locked(usage, container_id)?
            .map(|(transition, _)| transition))
    }

    fn evaluate_entry_locked(
        &self,
        usage: &UsageState,
        container_id: u64,
    ) -> Result<Option<(QuotaTransition, QuotaEntry)>> {
        let total = usage.container_bytes(container_id).unwrap_or(0);
        let outcome = self.quotas.update(container_id, |entry| {
            (self.evaluator.apply(total, entry), *entry)
        })?;

        let Some((transition, entry)) = outcome else {
            // No quota configured yet; accounting continues regardless.
            return Ok(None);
        };

        match transition {
            QuotaTransition::Blocked => {
                self.metrics.record_block();
                info!(
                    container_id,
                    usage_bytes = total,
                    limit_bytes = entry.limit_bytes,
                    "Container exceeded EPC limit, blocking"
                );
            }
            QuotaTransition::Unblocked => {
                self.metrics.record_unblock();
                info!(
                    container_id,
                    usage_bytes = total,
                    limit_bytes = entry.limit_bytes,
                    "Container back under EPC limit, unblocking"
                );
            }
            QuotaTransition::Unchanged => {}
        }
        Ok(Some((transition, entry)))
    }

    // ── consumer loop ─────────────────────────────────────────────────

    /// Drain `source` until it closes or `shutdown` is cancelled.
    ///
    /// Each wait for an event is bounded by the configured poll interval so
    /// cancellation is observed promptly.  An event already received is
    /// always applied completely; after cancellation nothing more is read.
    /// A full table discards only the event that needed a new key.  Only
    /// allocation failure, a poisoned table, and source I/O failures end
    /// the loop with an error.
    pub async fn run<S>(&self, source: &mut S, shutdown: CancellationToken) -> Result<RunSummary>
    where
        S: EventSource + ?Sized,
    {
        let poll_interval = self.config.poll_interval();
        let mut summary = RunSummary {
            applied: 0,
            orphan_deletes: 0,
            malformed: 0,
            refused: 0,
            stop_reason: StopReason::Shutdown,
        };

        info!(source = source.name(), ?poll_interval, "EPC aggregator running");

        loop {
            if shutdown.is_cancelled() {
                summary.stop_reason = StopReason::Shutdown;
                break;
            }

            let next = match tokio::time::timeout(poll_interval, source.next_event()).await {
                Ok(next) => next,
                // Poll timeout: go round and look at the shutdown flag.
                Err(_) => continue,
            };

            match next {
                Ok(Some(event)) => match self.apply(&event) {
                    Ok(ApplyOutcome::OrphanDelete) => summary.orphan_deletes += 1,
                    Ok(_) => summary.applied += 1,
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Accounting storage failure, stopping aggregator");
                        return Err(e);
                    }
                    Err(e) if e.is_capacity_refusal() => {
                        summary.refused += 1;
                        warn!(
                            error = %e,
                            container_id = event.container_id,
                            task_id = event.task_id,
                            "Table full, discarding event"
                        );
                    }
                    Err(e) => {
                        summary.malformed += 1;
                        warn!(error = %e, "Discarding event");
                    }
                },
                Ok(None) => {
                    summary.stop_reason = StopReason::SourceClosed;
                    break;
                }
                Err(e) if e.is_malformed_event() => {
                    self.metrics.record_malformed();
                    summary.malformed += 1;
                    warn!(error = %e, "Discarding malformed event record");
                }
                Err(e) => {
                    error!(error = %e, source = source.name(), "Event source failed");
                    return Err(e);
                }
            }
        }

        info!(
            applied = summary.applied,
            orphan_deletes = summary.orphan_deletes,
            malformed = summary.malformed,
            refused = summary.refused,
            stop_reason = ?summary.stop_reason,
            "EPC aggregator stopped"
        );
        Ok(summary)
    }

    /// Run the consumer loop on its own task.
    pub fn spawn<S>(
        self: &Arc<Self>,
        mut source: S,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<RunSummary>>
    where
        S: EventSource + 'static,
    {
        let aggregator = self.clone();
        tokio::spawn(async move { aggregator.run(&mut source, shutdown).await })
    }

    // ── queries ───────────────────────────────────────────────────────

    /// Current EPC usage of a container; `None` if never seen.
    pub fn container_usage(&self, container_id: u64) -> Result<Option<u64>> {
        self.usage.container_bytes(container_id)
    }

    /// Current EPC usage of a task; `None` if it holds nothing.
    pub fn task_usage(&self, task_id: u64) -> Result<Option<u64>> {
        self.usage.task_bytes(task_id)
    }

    /// Usage of a container addressed by its registered key.
    pub fn usage_by_key(&self, key: &str) -> Result<Option<u64>> {
        match self.identities.lookup(key)? {
            Some(container_id) => Ok(Some(
                self.container_usage(container_id)?.unwrap_or(0),
            )),
            None => Ok(None),
        }
    }

    /// Blocked flag; `false` when no quota is configured.
    pub fn is_blocked(&self, container_id: u64) -> Result<bool> {
        Ok(self.quotas.is_blocked(container_id)?.unwrap_or(false))
    }

    pub fn quota(&self, container_id: u64) -> Result<Option<QuotaEntry>> {
        self.quotas.get(container_id)
    }

    /// Read-only admission answer for a new enclave in `container_id`.
    pub fn admit(&self, container_id: u64) -> Result<AdmissionDecision> {
        if self.is_blocked(container_id)? {
            Ok(AdmissionDecision::Deny)
        } else {
            Ok(AdmissionDecision::Allow)
        }
    }

    /// Admission answer for a container addressed by its registered key.
    ///
    /// Unknown keys are allowed; they are not under EPC accounting.
    pub fn admit_by_key(&self, key: &str) -> Result<AdmissionDecision> {
        match self.identities.lookup(key)? {
            Some(container_id) => self.admit(container_id),
            None => Ok(AdmissionDecision::Allow),
        }
    }

    /// Every tracked container with usage, limit, and blocked flag.
    pub fn list_containers(&self) -> Result<Vec<ContainerView>> {
        let usage = self.usage.containers()?;
        let quotas = self.quotas.snapshot()?;
        Ok(merge_container_views(&usage, &quotas))
    }

    /// Point-in-time copy of every table.
    pub fn snapshot(&self) -> Result<AccountingSnapshot> {
        AccountingSnapshot::capture(&self.usage, &self.quotas, &self.identities)
    }

    // ── configuration (external writers) ──────────────────────────────

    /// Set a container's EPC limit and re-evaluate it against current usage.
    pub fn set_limit(&self, container_id: u64, limit_bytes: u64) -> Result<QuotaEntry> {
        let usage = self.usage.lock()?;
        let configured = self.quotas.set_limit(container_id, limit_bytes)?;
        let entry = self
            .evaluate_entry_locked(&usage, container_id)?
            .map_or(configured, |(_, entry)| entry);
        drop(usage);

        info!(
            container_id,
            limit_bytes,
            blocked = entry.blocked,
            "EPC limit configured"
        );
        Ok(entry)
    }

    /// Drop a container's limit; its usage keeps being accounted.
    pub fn remove_limit(&self, container_id: u64) -> Result<Option<QuotaEntry>> {
        self.quotas.remove(container_id)
    }

    /// Overwrite the blocked flag (external policy decision or reset).
    ///
    /// Returns `false` if the container has no quota entry.
    pub fn set_blocked(&self, container_id: u64, blocked: bool) -> Result<bool> {
        let updated = self.quotas.set_blocked(container_id, blocked)?;
        if updated {
            info!(container_id, blocked, "Blocked flag set externally");
        }
        Ok(updated)
    }

    /// Register a container key, its cgroup id, and its EPC limit.
    ///
    /// The key is reserved first; if the limit cannot be set the key is
    /// released again and nothing stays registered.
    pub fn register_container(&self, registration: &Registration) -> Result<QuotaEntry> {
        let key = registration.container_key.as_str();
        self.identities.register(key, registration.cgroup_id)?;
        let entry = match self.set_limit(registration.cgroup_id, registration.limit_bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.identities.unregister(key)?;
                warn!(key, error = %e, "Container registration rolled back");
                return Err(e);
            }
        };
        info!(
            key = %registration.container_key,
            cgroup_id = registration.cgroup_id,
            limit_bytes = registration.limit_bytes,
            "Container registered"
        );
        Ok(entry)
    }

    /// Undo [`register_container`](Self::register_container).
    ///
    /// Usage totals persist; the container may still hold enclaves.
    pub fn unregister_container(&self, key: &str) -> Result<u64> {
        let cgroup_id = self
            .identities
            .unregister(key)?
            .ok_or_else(|| AccountingError::NotRegistered(key.to_owned()))?;
        self.quotas.remove(cgroup_id)?;
        info!(key, cgroup_id, "Container unregistered");
        Ok(cgroup_id)
    }

    // ── persistence ───────────────────────────────────────────────────

    /// Container-level state for persisting.
    pub fn persisted_state(&self) -> Result<PersistedState> {
        Ok(PersistedState::from_snapshot(&self.snapshot()?))
    }

    /// Make identities and limits match `state`, which is authoritative for
    /// registrations.  Usage totals and blocked flags stay as they are;
    /// changed limits are re-evaluated against current usage.
    pub fn sync_registrations(&self, state: &PersistedState) -> Result<RegistrationSync> {
        let mut sync = RegistrationSync::default();

        let current: HashMap<String, u64> = self.identities.snapshot()?.into_iter().collect();
        for (key, cgroup_id) in &current {
            if state.identities.get(key) != Some(cgroup_id) {
                self.identities.unregister(key)?;
                sync.identities_removed += 1;
            }
        }
        for (key, cgroup_id) in &state.identities {
            if current.get(key) != Some(cgroup_id) {
                self.identities.register(key, *cgroup_id)?;
                sync.identities_added += 1;
            }
        }

        for entry in self.quotas.snapshot()? {
            let on_disk = state
                .containers
                .get(&entry.container_id)
                .and_then(|record| record.limit_bytes);
            if on_disk.is_none() {
                self.quotas.remove(entry.container_id)?;
                sync.limits_removed += 1;
            }
        }
        for (container_id, record) in &state.containers {
            let Some(limit_bytes) = record.limit_bytes else {
                continue;
            };
            if self.quotas.limit(*container_id)? != Some(limit_bytes) {
                self.set_limit(*container_id, limit_bytes)?;
                sync.limits_set += 1;
            }
        }

        if !sync.is_empty() {
            info!(?sync, "Synchronized container registrations");
        }
        Ok(sync)
    }

    /// Pick up registrations written to the state file at `path` by other
    /// processes.  A missing file changes nothing.
    pub fn reload_registrations(&self, path: &Path) -> Result<Option<RegistrationSync>> {
        match PersistedState::load(path)? {
            Some(state) => self.sync_registrations(&state).map(Some),
            None => Ok(None),
        }
    }

    /// Merge registrations from the state file at `path`, then replace the
    /// file with this aggregator's state.
    pub fn checkpoint(&self, path: &Path) -> Result<PersistedState> {
        self.reload_registrations(path)?;
        let state = self.persisted_state()?;
        state.save(path)?;
        Ok(state)
    }

    /// Seed container totals, limits, flags, and identities from persisted
    /// state.  Intended for a freshly created aggregator.
    pub fn restore(&self, state: &PersistedState) -> Result<()> {
        {
            let mut usage = self.usage.lock()?;
            for (container_id, record) in &state.containers {
                usage.restore_container(*container_id, record.bytes)?;
                if let Some(limit_bytes) = record.limit_bytes {
                    self.quotas.insert(QuotaEntry {
                        container_id: *container_id,
                        limit_bytes,
                        blocked: record.blocked,
                    })?;
                }
            }
        }
        for (key, cgroup_id) in &state.identities {
            self.identities.register(key, *cgroup_id)?;
        }
        info!(
            containers = state.containers.len(),
            identities = state.identities.len(),
            "Restored persisted accounting state"
        );
        Ok(())
    }
}
