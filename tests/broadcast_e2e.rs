//! Registry + broadcaster behavior as seen by observers.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use eventpulse::server::{ConnectionId, Delivery, ObserverSink};
use eventpulse::{
    Broadcaster, ChangeAction, ChangeNotification, Interest, PulseError, SendFailure, StreamError,
    SubscriptionRegistry,
};

fn change(table: &str, data: Value) -> ChangeNotification {
    let Value::Object(map) = data else {
        panic!("data must be an object");
    };
    ChangeNotification::new(table, ChangeAction::Insert, map)
}

fn broadcaster() -> Broadcaster {
    Broadcaster::new(Arc::new(SubscriptionRegistry::new()))
}

const WAIT: Duration = Duration::from_millis(50);

#[test]
fn organization_filter_selects_exactly_one_observer() {
    let broadcaster = broadcaster();
    let org_42 = broadcaster
        .subscribe_local(Interest::tables(["events"]).with_filter("organizationId", "42"), 8)
        .unwrap();
    let org_99 = broadcaster
        .subscribe_local(Interest::tables(["events"]).with_filter("organizationId", "99"), 8)
        .unwrap();

    let report = broadcaster
        .dispatch(change("events", json!({"organizationId": "42"})))
        .unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.delivered, 1);

    let got = org_42.recv_timeout(WAIT).unwrap();
    assert_eq!(got.data["organizationId"], json!("42"));
    assert!(org_42.try_recv().unwrap().is_none());
    assert!(org_99.try_recv().unwrap().is_none());
}

#[test]
fn table_interest_never_sees_other_tables() {
    let broadcaster = broadcaster();
    let events_only = broadcaster.subscribe_local(Interest::tables(["events"]), 8).unwrap();

    broadcaster.dispatch(change("profile", json!({"id": 1}))).unwrap();
    broadcaster.dispatch(change("events", json!({"id": 2}))).unwrap();

    let got = events_only.recv_timeout(WAIT).unwrap();
    assert_eq!(got.table, "events");
    assert!(events_only.try_recv().unwrap().is_none());
}

#[test]
fn filter_values_compare_without_coercion() {
    let broadcaster = broadcaster();
    let stream = broadcaster
        .subscribe_local(Interest::all().with_filter("organizationId", "42"), 8)
        .unwrap();

    for data in [
        json!({"organizationId": 42}),
        json!({"organizationId": "042"}),
        json!({"organizationId": "42 "}),
        json!({"orgId": "42"}),
    ] {
        let report = broadcaster.dispatch(change("events", data)).unwrap();
        assert_eq!(report.matched, 0);
    }
    assert!(stream.try_recv().unwrap().is_none());

    broadcaster
        .dispatch(change("events", json!({"organizationId": "42"})))
        .unwrap();
    assert!(stream.recv_timeout(WAIT).is_ok());
}

#[test]
fn unregistered_observer_is_never_written_to() {
    #[derive(Default)]
    struct CountingSink(Mutex<usize>);

    impl ObserverSink for CountingSink {
        fn deliver(&self, _delivery: &Delivery) -> Result<(), SendFailure> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    let registry = Arc::new(SubscriptionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry));
    let sink = Arc::new(CountingSink::default());
    let id = ConnectionId::new();

    registry.register(id, sink.clone(), Interest::all()).unwrap();
    broadcaster.dispatch(change("events", json!({}))).unwrap();
    assert!(registry.unregister(id).unwrap());
    assert!(!registry.unregister(id).unwrap());

    for _ in 0..3 {
        let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
        assert_eq!(report.matched, 0);
    }
    assert_eq!(*sink.0.lock().unwrap(), 1);
}

#[test]
fn resubscribing_replaces_interest() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry));
    let stream = broadcaster.subscribe_local(Interest::tables(["events"]), 8).unwrap();

    let (tx, _rx) = crossbeam_channel::bounded(8);
    // Same connection, new interest: the old table list must not linger.
    registry
        .register(
            stream.connection_id(),
            Arc::new(eventpulse::server::ChannelSink::new(tx)),
            Interest::tables(["profile"]),
        )
        .unwrap();

    let report = broadcaster.dispatch(change("events", json!({}))).unwrap();
    assert_eq!(report.matched, 0);
    let report = broadcaster.dispatch(change("profile", json!({}))).unwrap();
    assert_eq!(report.matched, 1);
}

#[test]
fn closed_observer_is_evicted_and_others_still_receive() {
    let broadcaster = broadcaster();
    let healthy = broadcaster.subscribe_local(Interest::all(), 8).unwrap();

    struct ClosedSink;
    impl ObserverSink for ClosedSink {
        fn deliver(&self, _delivery: &Delivery) -> Result<(), SendFailure> {
            Err(SendFailure::Closed)
        }
    }
    let closed = ConnectionId::new();
    broadcaster
        .registry()
        .register(closed, Arc::new(ClosedSink), Interest::all())
        .unwrap();

    let report = broadcaster.dispatch(change("events", json!({"n": 1}))).unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.evicted, 1);
    assert!(!broadcaster.registry().contains(closed));
    assert!(healthy.recv_timeout(WAIT).is_ok());
}

#[test]
fn slow_local_observer_is_dropped_after_its_queue_fills() {
    let broadcaster = broadcaster();
    let slow = broadcaster.subscribe_local(Interest::all(), 2).unwrap();

    for n in 0..3 {
        broadcaster.dispatch(change("events", json!({"n": n}))).unwrap();
    }
    assert!(!slow.is_registered());
    assert_eq!(broadcaster.stats().evicted, 1);

    assert_eq!(slow.recv().unwrap().data["n"], json!(0));
    assert_eq!(slow.recv().unwrap().data["n"], json!(1));
    assert!(matches!(
        slow.recv_timeout(WAIT),
        Err(PulseError::Stream(StreamError::Disconnected))
    ));
}

#[test]
fn concurrent_subscribe_and_dispatch() {
    let broadcaster = Arc::new(broadcaster());
    let dispatcher = {
        let broadcaster = Arc::clone(&broadcaster);
        thread::spawn(move || {
            for n in 0..500 {
                broadcaster.dispatch(change("events", json!({"n": n}))).unwrap();
            }
        })
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let broadcaster = Arc::clone(&broadcaster);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let stream = broadcaster.subscribe_local(Interest::tables(["events"]), 1024).unwrap();
                let _ = stream.try_recv();
                drop(stream);
            }
        }));
    }

    dispatcher.join().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(broadcaster.registry().is_empty());
}
