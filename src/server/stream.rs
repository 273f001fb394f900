use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{PulseResult, StreamError};

use super::notification::ChangeNotification;
use super::registry::{ConnectionId, SubscriptionRegistry};

/// An in-process observer of broadcast changes.
///
/// Dropping the stream unregisters it. A stream the broadcaster evicted
/// (because its channel was full) drains what it already holds and then
/// reports [`StreamError::Disconnected`].
#[derive(Debug)]
pub struct ObserverStream {
    connection: ConnectionId,
    rx: Receiver<Arc<ChangeNotification>>,
    registry: Arc<SubscriptionRegistry>,
    unregistered: AtomicBool,
}

impl ObserverStream {
    pub(crate) fn new(
        connection: ConnectionId,
        rx: Receiver<Arc<ChangeNotification>>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            connection,
            rx,
            registry,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The connection id backing this stream.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Returns true while the registry still holds this observer.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registry.contains(self.connection)
    }

    /// Explicit unregistration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.registry.unregister(self.connection);
    }

    /// Receive the next change (blocking).
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Disconnected`] once the stream is unregistered
    /// and drained.
    pub fn recv(&self) -> PulseResult<Arc<ChangeNotification>> {
        self.rx.recv().map_err(|_| StreamError::Disconnected.into())
    }

    /// Receive the next change with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Timeout`] when nothing arrived in time and
    /// [`StreamError::Disconnected`] once the stream is unregistered and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> PulseResult<Arc<ChangeNotification>> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StreamError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }
            .into(),
            RecvTimeoutError::Disconnected => StreamError::Disconnected.into(),
        })
    }

    /// Non-blocking receive. `Ok(None)` means nothing is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Disconnected`] once the stream is unregistered
    /// and drained.
    pub fn try_recv(&self) -> PulseResult<Option<Arc<ChangeNotification>>> {
        match self.rx.try_recv() {
            Ok(change) => Ok(Some(change)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(StreamError::Disconnected.into()),
        }
    }
}

impl Drop for ObserverStream {
    fn drop(&mut self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            let _ = self.registry.unregister(self.connection);
        }
    }
}
