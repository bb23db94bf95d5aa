//! Event Sources - Where Enclave Lifecycle Events Come From
//!
//! The kernel instrumentation that observes enclave ioctls, process exits,
//! and SGX page faults is a black box to the accounting core.  All the
//! aggregator needs is something implementing [`EventSource`].
//!
//! # Transport contract:
//! - **At-most-once**: an event is delivered once or not at all
//! - **Lossy**: producers never block; a full buffer drops the event
//! - **Per-task order**: events of one task arrive in emission order
//!
//! Two implementations are provided:
//! - [`ChannelSource`]: a bounded in-process channel fed by cloneable
//!   [`EventProducer`]s, one per enclave-owning process
//! - [`RecordStreamSource`]: raw 40-byte kernel records read from a byte
//!   stream such as a FIFO or a captured trace file

use crate::error::Result;
use crate::event::{EnclaveLifecycleEvent, RawEnclaveEvent, RAW_EVENT_SIZE};
use crate::metrics::AccountingMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A stream of enclave lifecycle events.
///
/// # Cancellation Contract:
/// `next_event` is awaited under a poll timeout and may be dropped at any
/// await point; implementations must not lose a partially received event
/// when that happens.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next event.
    ///
    /// - `Ok(Some(event))`: a well-formed event
    /// - `Ok(None)`: the source is closed; no more events will arrive
    /// - `Err(_)`: one malformed record was discarded; the source stays usable
    async fn next_event(&mut self) -> Result<Option<EnclaveLifecycleEvent>>;

    /// Short identifier used in logs.
    fn name(&self) -> &str;
}

/// Create a bounded, lossy event channel.
///
/// The returned [`EventProducer`] records drops in `metrics`.
pub fn channel(capacity: usize, metrics: Arc<AccountingMetrics>) -> (EventProducer, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventProducer { tx, metrics }, ChannelSource { rx })
}

/// Producer half of [`channel`].  Cloning is cheap.
#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<EnclaveLifecycleEvent>,
    metrics: Arc<AccountingMetrics>,
}

impl EventProducer {
    /// Offer an event without ever waiting.
    ///
    /// Returns `false` when the event was dropped, either because the
    /// buffer is full or because the consumer is gone.
    pub fn emit(&self, event: EnclaveLifecycleEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.record_dropped();
                debug!(
                    container_id = event.container_id,
                    task_id = event.task_id,
                    action = %event.action,
                    "Event buffer full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_dropped();
                false
            }
        }
    }
}

/// Consumer half of [`channel`].
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<EnclaveLifecycleEvent>,
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Result<Option<EnclaveLifecycleEvent>> {
        // mpsc::Receiver::recv is cancel safe.
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Reads fixed-size kernel event records from a byte stream.
pub struct RecordStreamSource<R> {
    reader: R,
    buf: [u8; RAW_EVENT_SIZE],
    filled: usize,
    eof: bool,
}

impl<R> RecordStreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: [0u8; RAW_EVENT_SIZE],
            filled: 0,
            eof: false,
        }
    }
}

#[async_trait]
impl<R> EventSource for RecordStreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_event(&mut self) -> Result<Option<EnclaveLifecycleEvent>> {
        if self.eof {
            return Ok(None);
        }

        // Partial progress lives in `self`, so dropping this future between
        // reads never loses bytes.
        while self.filled < RAW_EVENT_SIZE {
            let n = self.reader.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                self.eof = true;
                if self.filled == 0 {
                    debug!("Event stream closed");
                    return Ok(None);
                }
                let partial = self.filled;
                self.filled = 0;
                return Err(crate::error::AccountingError::TruncatedRecord {
                    len: partial,
                    expected: RAW_EVENT_SIZE,
                });
            }
            self.filled += n;
        }
        self.filled = 0;

        let raw = RawEnclaveEvent::decode(&self.buf)?;
        trace!(?raw, "Decoded raw event record");
        EnclaveLifecycleEvent::try_from(raw).map(Some)
    }

    fn name(&self) -> &str {
        "record-stream"
    }
}
