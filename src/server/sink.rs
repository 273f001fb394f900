//! Observer sinks.
//!
//! A sink is the write half of one observer connection as seen by the
//! broadcaster. `deliver` must not block: a sink that cannot accept a
//! message right now fails with [`SendFailure::NotReady`] and the observer is
//! dropped.

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};

use crate::error::SendFailure;

use super::notification::ChangeNotification;

/// One change prepared for delivery.
///
/// The JSON frame is encoded once per dispatch and shared by every sink.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The change itself.
    pub change: Arc<ChangeNotification>,
    /// `{"type":"events", ...}` frame.
    pub frame: Arc<str>,
}

/// Write half of an observer connection.
pub trait ObserverSink: Send + Sync {
    /// Hands a change to the observer without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] when the observer is closed or not ready.
    fn deliver(&self, delivery: &Delivery) -> Result<(), SendFailure>;

    /// Called once after the broadcaster removed this observer.
    fn evicted(&self) {}
}

/// Sink feeding an in-process crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Arc<ChangeNotification>>,
}

impl ChannelSink {
    /// Wraps a channel sender.
    #[must_use]
    pub fn new(tx: Sender<Arc<ChangeNotification>>) -> Self {
        Self { tx }
    }
}

impl ObserverSink for ChannelSink {
    fn deliver(&self, delivery: &Delivery) -> Result<(), SendFailure> {
        self.tx
            .try_send(Arc::clone(&delivery.change))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendFailure::NotReady,
                TrySendError::Disconnected(_) => SendFailure::Closed,
            })
    }
}

#[cfg(feature = "server")]
pub use connection::ConnectionSink;

#[cfg(feature = "server")]
mod connection {
    use std::sync::Arc;

    use tokio::sync::mpsc::error::TrySendError;
    use tokio::sync::{mpsc, Notify};

    use super::{Delivery, ObserverSink};
    use crate::error::SendFailure;

    /// Sink feeding a WebSocket connection's bounded outbound queue.
    #[derive(Debug, Clone)]
    pub struct ConnectionSink {
        tx: mpsc::Sender<Arc<str>>,
        evicted: Arc<Notify>,
    }

    impl ConnectionSink {
        /// Wraps the outbound queue and the eviction signal of a connection.
        #[must_use]
        pub fn new(tx: mpsc::Sender<Arc<str>>, evicted: Arc<Notify>) -> Self {
            Self { tx, evicted }
        }
    }

    impl ObserverSink for ConnectionSink {
        fn deliver(&self, delivery: &Delivery) -> Result<(), SendFailure> {
            self.tx
                .try_send(Arc::clone(&delivery.frame))
                .map_err(|e| match e {
                    TrySendError::Full(_) => SendFailure::NotReady,
                    TrySendError::Closed(_) => SendFailure::Closed,
                })
        }

        fn evicted(&self) {
            self.evicted.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;
    use serde_json::Map;

    use super::*;
    use crate::server::notification::ChangeAction;

    fn delivery() -> Delivery {
        Delivery {
            change: Arc::new(ChangeNotification::new("events", ChangeAction::Insert, Map::new())),
            frame: Arc::from("{}"),
        }
    }

    #[test]
    fn channel_sink_reports_full_and_closed() {
        let (tx, rx) = bounded(1);
        let sink = ChannelSink::new(tx);
        assert_eq!(sink.deliver(&delivery()), Ok(()));
        assert_eq!(sink.deliver(&delivery()), Err(SendFailure::NotReady));
        drop(rx);
        assert_eq!(sink.deliver(&delivery()), Err(SendFailure::Closed));
    }
}
