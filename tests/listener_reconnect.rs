//! Change listener lifecycle against a scripted feed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use eventpulse::server::listener::{ChangeFeed, ChangeListener, FeedSession, ListenerState};
use eventpulse::{BackoffPolicy, Broadcaster, Interest, ListenerError, SubscriptionRegistry};

type PayloadTx = mpsc::Sender<Result<String, ListenerError>>;

enum Step {
    Refuse,
    Accept(FeedSession),
}

#[derive(Default)]
struct ScriptedFeed {
    steps: Mutex<VecDeque<Step>>,
    connects: AtomicUsize,
    channels: Mutex<Vec<String>>,
}

impl ScriptedFeed {
    fn refuse(&self) {
        self.steps.lock().unwrap().push_back(Step::Refuse);
    }

    fn accept(&self) -> PayloadTx {
        let (tx, session) = FeedSession::channel(32);
        self.steps.lock().unwrap().push_back(Step::Accept(session));
        tx
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn connect(&self, channel: &str) -> Result<FeedSession, ListenerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().unwrap().push(channel.to_string());
        match self.steps.lock().unwrap().pop_front() {
            Some(Step::Accept(session)) => Ok(session),
            Some(Step::Refuse) | None => Err(ListenerError::ConnectFailed {
                message: "connection refused".to_string(),
            }),
        }
    }
}

fn setup(feed: &Arc<ScriptedFeed>, backoff: BackoffPolicy) -> (ChangeListener, Arc<Broadcaster>) {
    let broadcaster = Arc::new(Broadcaster::new(Arc::new(SubscriptionRegistry::new())));
    let listener = ChangeListener::new(
        Arc::clone(feed) as Arc<dyn ChangeFeed>,
        Arc::clone(&broadcaster),
        "table_changes",
        backoff,
    );
    (listener, broadcaster)
}

async fn wait_for_state(mut rx: tokio::sync::watch::Receiver<ListenerState>, target: ListenerState) {
    timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
        .await
        .expect("timed out waiting for listener state")
        .expect("listener state channel closed");
}

const INSERT: &str = r#"{"table":"events","action":"INSERT","data":{"organizationId":"42"}}"#;

#[tokio::test]
async fn initial_connection_failure_reaches_the_caller() {
    let feed = Arc::new(ScriptedFeed::default());
    feed.refuse();
    let (listener, _) = setup(&feed, BackoffPolicy::fixed(Duration::from_millis(10)));

    let err = listener.start().await.unwrap_err();
    assert!(matches!(err, ListenerError::ConnectFailed { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(feed.connects.load(Ordering::SeqCst), 1, "no background retries after a failed start");
}

#[tokio::test]
async fn subscribes_to_the_configured_channel_and_forwards_changes() {
    let feed = Arc::new(ScriptedFeed::default());
    let tx = feed.accept();
    let (listener, broadcaster) = setup(&feed, BackoffPolicy::default());
    let stream = broadcaster
        .subscribe_local(Interest::tables(["events"]).with_filter("organizationId", "42"), 8)
        .unwrap();

    let handle = listener.start().await.unwrap();
    assert_eq!(handle.state(), ListenerState::Listening);
    assert_eq!(feed.channels.lock().unwrap().as_slice(), ["table_changes"]);

    tx.send(Ok(INSERT.to_string())).await.unwrap();
    let change = tokio::task::spawn_blocking(move || stream.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.table, "events");

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_payloads_do_not_stop_the_listener() {
    let feed = Arc::new(ScriptedFeed::default());
    let tx = feed.accept();
    let (listener, broadcaster) = setup(&feed, BackoffPolicy::default());
    let stream = broadcaster.subscribe_local(Interest::all(), 8).unwrap();
    let handle = listener.start().await.unwrap();

    for bad in ["", "null", r#"{"table":"events"}"#, r#"{"table":"events","action":"MERGE","data":{}}"#] {
        tx.send(Ok(bad.to_string())).await.unwrap();
    }
    tx.send(Ok(INSERT.to_string())).await.unwrap();

    let change = tokio::task::spawn_blocking(move || stream.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.data["organizationId"], "42");

    let stats = handle.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.malformed, 4);
    assert_eq!(handle.state(), ListenerState::Listening);
    handle.shutdown().await;
}

#[tokio::test]
async fn lost_connection_is_retried_in_a_loop() {
    let feed = Arc::new(ScriptedFeed::default());
    let first = feed.accept();
    for _ in 0..5 {
        feed.refuse();
    }
    let second = feed.accept();

    let (listener, broadcaster) = setup(
        &feed,
        BackoffPolicy::exponential(Duration::from_millis(5), Duration::from_millis(20)),
    );
    let stream = broadcaster.subscribe_local(Interest::all(), 8).unwrap();
    let handle = listener.start().await.unwrap();

    first
        .send(Err(ListenerError::ConnectionLost {
            message: "server closed the connection".to_string(),
        }))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while feed.connects.load(Ordering::SeqCst) < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    wait_for_state(handle.watch_state(), ListenerState::Listening).await;

    second.send(Ok(INSERT.to_string())).await.unwrap();
    let change = tokio::task::spawn_blocking(move || stream.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(change.is_ok());

    let stats = handle.stats();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.disconnects, 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn degraded_start_recovers_once_the_feed_is_back() {
    let feed = Arc::new(ScriptedFeed::default());
    feed.refuse();
    feed.refuse();
    let _tx = feed.accept();

    let (listener, _) = setup(&feed, BackoffPolicy::fixed(Duration::from_millis(5)));
    assert!(listener.clone().start().await.is_err());

    let handle = listener.spawn();
    wait_for_state(handle.watch_state(), ListenerState::Listening).await;
    assert_eq!(feed.connects.load(Ordering::SeqCst), 3);
    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_ends_in_disconnected() {
    let feed = Arc::new(ScriptedFeed::default());
    let _tx = feed.accept();
    let (listener, _) = setup(&feed, BackoffPolicy::default());
    let handle = listener.start().await.unwrap();
    let state = handle.watch_state();

    handle.shutdown().await;
    assert_eq!(*state.borrow(), ListenerState::Disconnected);
}
