//! Batched delivery with requeue on failure.
//!
//! At most one flush is in flight per agent. The guard is an atomic flag
//! rather than a lock: an overlapping flush returns immediately instead of
//! waiting, so a timer tick racing a critical-event flush never sends the
//! same events twice or out of order.
//!
//! Delivery is at-least-once. If the endpoint stored a batch but the
//! response was lost, the batch is requeued and sent again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::buffer::EventBuffer;
use super::transport::{DeliveryMode, EventTransport};

/// What a call to [`DeliveryAgent::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// Another flush was already in flight; nothing was sent.
    InProgress,
    /// The endpoint accepted the batch.
    Delivered {
        events: usize,
    },
    /// Transmission failed and the batch went back to the retry queue.
    Requeued {
        events: usize,
        dropped: usize,
    },
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches accepted by the endpoint.
    pub batches_delivered: u64,
    /// Events accepted by the endpoint.
    pub events_delivered: u64,
    /// Failed transmissions.
    pub failures: u64,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Takes batches from an [`EventBuffer`] and hands them to a transport.
pub struct DeliveryAgent {
    buffer: Arc<EventBuffer>,
    transport: Arc<dyn EventTransport>,
    flushing: AtomicBool,
    batches_delivered: AtomicU64,
    events_delivered: AtomicU64,
    failures: AtomicU64,
}

impl DeliveryAgent {
    /// Creates an agent draining `buffer` through `transport`.
    #[must_use]
    pub fn new(buffer: Arc<EventBuffer>, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            buffer,
            transport,
            flushing: AtomicBool::new(false),
            batches_delivered: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Sends everything currently buffered as one batch.
    ///
    /// Never fails: transport errors requeue the batch and are logged.
    pub fn flush(&self, mode: DeliveryMode) -> FlushOutcome {
        if self.buffer.is_empty() {
            return FlushOutcome::Empty;
        }

        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("flush already in progress");
            return FlushOutcome::InProgress;
        }
        let _guard = FlushGuard(&self.flushing);

        let batch = self.buffer.take_batch();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let events = batch.len();

        match self.transport.send_batch(&batch, mode) {
            Ok(()) => {
                self.batches_delivered.fetch_add(1, Ordering::Relaxed);
                self.events_delivered.fetch_add(events as u64, Ordering::Relaxed);
                debug!(events, ?mode, "batch delivered");
                FlushOutcome::Delivered { events }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let dropped = self.buffer.requeue(batch);
                warn!(error = %e, events, dropped, ?mode, "batch delivery failed, requeued");
                FlushOutcome::Requeued { events, dropped }
            }
        }
    }

    /// Returns true while a flush is in flight.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// The buffer this agent drains.
    #[must_use]
    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DeliveryAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryAgent")
            .field("buffered", &self.buffer.len())
            .field("flushing", &self.is_flushing())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
