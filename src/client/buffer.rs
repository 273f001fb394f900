//! Bounded in-memory event buffer.
//!
//! Holds two queues: the primary queue fed by `track`, and the retry queue
//! holding the last batch that failed to deliver. Both are bounded together
//! by `max_queue_size`; on overflow the oldest event is dropped (retry queue
//! first, since it is always older than anything in the primary queue).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::event::TrackedEvent;

/// Ordered events taken from the buffer for one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingBatch {
    events: Vec<TrackedEvent>,
}

impl OutgoingBatch {
    /// Wraps events in send order.
    #[must_use]
    pub fn new(events: Vec<TrackedEvent>) -> Self {
        Self { events }
    }

    /// Events in send order.
    #[must_use]
    pub fn events(&self) -> &[TrackedEvent] {
        &self.events
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consumes the batch.
    #[must_use]
    pub fn into_events(self) -> Vec<TrackedEvent> {
        self.events
    }
}

/// Result of appending one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Primary queue length after the push.
    pub pending: usize,
    /// Events dropped to stay within capacity.
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct Queues {
    pending: VecDeque<TrackedEvent>,
    retry: VecDeque<TrackedEvent>,
}

impl Queues {
    fn len(&self) -> usize {
        self.pending.len() + self.retry.len()
    }

    fn evict_oldest(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.len() > capacity {
            if self.retry.pop_front().is_none() {
                self.pending.pop_front();
            }
            evicted += 1;
        }
        evicted
    }
}

/// Thread-safe bounded buffer of pending events.
#[derive(Debug)]
pub struct EventBuffer {
    queues: Mutex<Queues>,
    max_queue_size: usize,
    evicted_total: AtomicU64,
}

impl EventBuffer {
    /// Creates a buffer holding at most `max_queue_size` events.
    #[must_use]
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            max_queue_size: max_queue_size.max(1),
            evicted_total: AtomicU64::new(0),
        }
    }

    // The queues are always left consistent between statements, so a panic
    // elsewhere never leaves them half-updated.
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event to the primary queue, dropping the oldest on overflow.
    pub fn push(&self, event: TrackedEvent) -> PushOutcome {
        let mut q = self.lock();
        q.pending.push_back(event);
        let evicted = q.evict_oldest(self.max_queue_size);
        let pending = q.pending.len();
        drop(q);

        if evicted > 0 {
            self.evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        PushOutcome { pending, evicted }
    }

    /// Takes retry then primary events as one batch, leaving both empty.
    #[must_use]
    pub fn take_batch(&self) -> OutgoingBatch {
        let mut q = self.lock();
        let mut events = Vec::with_capacity(q.len());
        events.extend(q.retry.drain(..));
        events.extend(q.pending.drain(..));
        OutgoingBatch::new(events)
    }

    /// Puts a failed batch back onto the retry queue.
    ///
    /// Returns the number of events dropped to stay within capacity.
    pub fn requeue(&self, batch: OutgoingBatch) -> usize {
        let mut q = self.lock();
        // The failed batch is older than anything still buffered.
        for event in batch.into_events().into_iter().rev() {
            q.retry.push_front(event);
        }
        let evicted = q.evict_oldest(self.max_queue_size);
        drop(q);

        if evicted > 0 {
            self.evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Total buffered events (retry + primary).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Events in the primary queue.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Events waiting for retry.
    #[must_use]
    pub fn retry_len(&self) -> usize {
        self.lock().retry.len()
    }

    /// Returns true if both queues are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all buffered events in send order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackedEvent> {
        let q = self.lock();
        q.retry.iter().chain(q.pending.iter()).cloned().collect()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_queue_size
    }

    /// Events dropped under capacity pressure since creation.
    #[must_use]
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }
}
