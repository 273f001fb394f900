//! Change fan-out.
//!
//! `dispatch` is best-effort and unqueued: a change is offered once to every
//! matching observer and forgotten. Observers that cannot take it are
//! dropped from the registry on the spot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use tracing::{debug, error, warn};

use crate::error::{PulseError, PulseResult};

use super::notification::ChangeNotification;
use super::protocol::ServerMessage;
use super::registry::{ConnectionId, Interest, SubscriptionRegistry};
use super::sink::{ChannelSink, Delivery};
use super::stream::ObserverStream;

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Observers whose interest matched.
    pub matched: usize,
    /// Observers that accepted the change.
    pub delivered: usize,
    /// Observers removed because delivery failed.
    pub evicted: usize,
}

/// Cumulative broadcaster counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub dispatched: u64,
    pub delivered: u64,
    pub evicted: u64,
}

/// Matches changes against the registry and forwards them.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
}

impl Broadcaster {
    /// Creates a broadcaster over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            dispatched: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// The registry this broadcaster reads.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Offers `change` to every matching observer without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the change cannot be encoded or the
    /// registry lock is poisoned. Per-observer failures are not errors.
    pub fn dispatch(&self, change: ChangeNotification) -> PulseResult<DispatchReport> {
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let targets = self.registry.matching(&change)?;
        let mut report = DispatchReport {
            matched: targets.len(),
            ..DispatchReport::default()
        };
        if targets.is_empty() {
            debug!(table = %change.table, "no interested observers");
            return Ok(report);
        }

        let frame = ServerMessage::encode_events(&change)
            .map_err(|e| PulseError::internal(format!("failed to encode change: {e}")))?;
        let delivery = Delivery {
            change: Arc::new(change),
            frame: Arc::from(frame),
        };

        for (connection, sink) in targets {
            match sink.deliver(&delivery) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    // Only the first eviction notifies; a concurrent unsubscribe or
                    // re-registration may have won.
                    match self.registry.unregister_sink(connection, &sink) {
                        Ok(true) => sink.evicted(),
                        Ok(false) => {}
                        Err(e) => error!(%connection, error = %e, "failed to unregister observer"),
                    }
                    report.evicted += 1;
                    warn!(%connection, reason = %failure, "dropping observer");
                }
            }
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
        debug!(
            table = %delivery.change.table,
            matched = report.matched,
            delivered = report.delivered,
            evicted = report.evicted,
            "dispatched change"
        );
        Ok(report)
    }

    /// Registers an in-process observer backed by a bounded channel.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn subscribe_local(&self, interest: Interest, capacity: usize) -> PulseResult<ObserverStream> {
        let (tx, rx) = bounded(capacity.max(1));
        let connection = ConnectionId::new();
        self.registry
            .register(connection, Arc::new(ChannelSink::new(tx)), interest)?;
        Ok(ObserverStream::new(connection, rx, Arc::clone(&self.registry)))
    }

    /// Snapshot of the cumulative counters.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::error::SendFailure;
    use crate::server::notification::ChangeAction;
    use crate::server::sink::ObserverSink;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        fail: Option<SendFailure>,
        evictions: AtomicU64,
    }

    impl ObserverSink for RecordingSink {
        fn deliver(&self, delivery: &Delivery) -> Result<(), SendFailure> {
            if let Some(failure) = self.fail {
                return Err(failure);
            }
            self.frames.lock().unwrap().push(delivery.frame.to_string());
            Ok(())
        }

        fn evicted(&self) {
            self.evictions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn change(table: &str, data: Value) -> ChangeNotification {
        let Value::Object(map) = data else {
            panic!("data must be an object");
        };
        ChangeNotification::new(table, ChangeAction::Insert, map)
    }

    #[test]
    fn dispatch_without_observers_is_a_noop() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionRegistry::new()));
        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report, DispatchReport::default());
        assert_eq!(broadcaster.stats().dispatched, 1);
    }

    #[test]
    fn dispatch_sends_encoded_frame_once_per_match() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let sink = Arc::new(RecordingSink::default());
        registry
            .register(ConnectionId::new(), sink.clone(), Interest::tables(["events"]))
            .unwrap();

        let report = broadcaster.dispatch(change("events", json!({"id": 1}))).unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.delivered, 1);

        let frames = sink.frames.lock().unwrap();
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["type"], json!("events"));
        assert_eq!(v["data"]["id"], json!(1));
    }

    #[test]
    fn failed_delivery_evicts_and_notifies() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let sink = Arc::new(RecordingSink {
            fail: Some(SendFailure::NotReady),
            ..RecordingSink::default()
        });
        let id = ConnectionId::new();
        registry.register(id, sink.clone(), Interest::all()).unwrap();

        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.delivered, 0);
        assert!(!registry.contains(id));
        assert_eq!(sink.evictions.load(Ordering::SeqCst), 1);

        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report.matched, 0);
        assert_eq!(broadcaster.stats().evicted, 1);
    }

    /// Runs `hook` inside `deliver`, then fails as closed.
    struct HookSink {
        hook: Box<dyn Fn() + Send + Sync>,
    }

    impl ObserverSink for HookSink {
        fn deliver(&self, _delivery: &Delivery) -> Result<(), SendFailure> {
            (self.hook)();
            Err(SendFailure::Closed)
        }
    }

    #[test]
    fn eviction_keeps_a_subscription_re_registered_mid_dispatch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let id = ConnectionId::new();
        let replacement = Arc::new(RecordingSink::default());

        let hook_registry = Arc::clone(&registry);
        let hook_replacement = Arc::clone(&replacement);
        let stale = HookSink {
            hook: Box::new(move || {
                hook_registry
                    .register(id, hook_replacement.clone(), Interest::all())
                    .unwrap();
            }),
        };
        registry.register(id, Arc::new(stale), Interest::all()).unwrap();

        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(registry.contains(id));
        assert_eq!(replacement.evictions.load(Ordering::SeqCst), 0);

        broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(replacement.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn poisoned_registry_does_not_abort_the_fan_out() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        for _ in 0..3 {
            let hook_registry = Arc::clone(&registry);
            let sink = HookSink {
                hook: Box::new(move || hook_registry.poison()),
            };
            registry.register(ConnectionId::new(), Arc::new(sink), Interest::all()).unwrap();
        }

        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report.matched, 3);
        assert_eq!(report.evicted, 3);
        assert_eq!(broadcaster.stats().evicted, 3);
    }

    #[test]
    fn local_stream_receives_and_unregisters_on_drop() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionRegistry::new()));
        let stream = broadcaster.subscribe_local(Interest::all(), 8).unwrap();
        assert!(stream.is_registered());

        broadcaster.dispatch(change("profile", json!({"name": "a"}))).unwrap();
        let got = stream.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.table, "profile");
        assert_eq!(stream.try_recv().unwrap(), None);

        drop(stream);
        assert!(broadcaster.registry().is_empty());
    }

    #[test]
    fn full_local_stream_is_evicted_then_drains() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionRegistry::new()));
        let stream = broadcaster.subscribe_local(Interest::all(), 1).unwrap();

        broadcaster.dispatch(change("events", json!({"n": 1}))).unwrap();
        let report = broadcaster.dispatch(change("events", json!({"n": 2}))).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!stream.is_registered());

        assert_eq!(stream.recv().unwrap().data["n"], json!(1));
        let err = stream.recv_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, PulseError::Stream(crate::error::StreamError::Disconnected)));
    }
}
