//! Storage-layer change listener.
//!
//! The listener holds one subscription to a notification channel, parses
//! every payload into a [`ChangeNotification`] and hands it to the
//! [`Broadcaster`]. Connection loss is retried in an explicit loop with a
//! [`BackoffPolicy`] delay; only the very first connection attempt reports
//! its failure to the caller.
//!
//! ```text
//! Disconnected ──► Connecting ──► Listening
//!      ▲               │              │
//!      └── backoff ◄───┴── error/end ◄┘
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::ListenerError;

use super::broadcast::Broadcaster;
use super::notification::ChangeNotification;

/// Connection state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// No live connection; waiting out the backoff or stopped.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Subscribed to the channel and receiving payloads.
    Listening,
}

/// One live subscription to a notification channel.
///
/// Yields raw payloads. An `Err` item or the end of the stream means the
/// connection is gone. Dropping the session tears the connection down.
pub struct FeedSession {
    notifications: mpsc::Receiver<Result<String, ListenerError>>,
    pump: Option<JoinHandle<()>>,
    guard: Option<Box<dyn Any + Send>>,
}

impl FeedSession {
    /// Wraps a payload receiver.
    #[must_use]
    pub fn new(notifications: mpsc::Receiver<Result<String, ListenerError>>) -> Self {
        Self {
            notifications,
            pump: None,
            guard: None,
        }
    }

    /// A session fed through the returned sender.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<String, ListenerError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Attaches the task driving the connection; it is aborted on drop.
    #[must_use]
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Keeps `guard` alive for as long as the session.
    #[must_use]
    pub fn with_guard<G: Any + Send>(mut self, guard: G) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Next payload, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Result<String, ListenerError>> {
        self.notifications.recv().await
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSession")
            .field("has_pump", &self.pump.is_some())
            .field("has_guard", &self.guard.is_some())
            .finish()
    }
}

/// Source of change payloads.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a connection and subscribes to `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::ConnectFailed`] when the storage layer is
    /// unreachable or refuses the subscription.
    async fn connect(&self, channel: &str) -> Result<FeedSession, ListenerError>;
}

/// PostgreSQL `LISTEN`/`NOTIFY` change feed.
#[derive(Clone)]
pub struct PgChangeFeed {
    database_url: String,
    queue_capacity: usize,
}

impl PgChangeFeed {
    /// Creates a feed for the given connection string.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            queue_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for PgChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The connection string may carry a password.
        f.debug_struct("PgChangeFeed")
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

fn connect_failed(context: &str, err: impl std::fmt::Display) -> ListenerError {
    ListenerError::ConnectFailed {
        message: format!("{context}: {err}"),
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn connect(&self, channel: &str) -> Result<FeedSession, ListenerError> {
        if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(connect_failed("invalid channel", channel));
        }

        let (client, mut connection) = tokio_postgres::connect(&self.database_url, tokio_postgres::NoTls)
            .await
            .map_err(|e| connect_failed("PostgreSQL connect", e))?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let pump = tokio::spawn(async move {
            let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(tokio_postgres::AsyncMessage::Notification(n)) => {
                        if tx.send(Ok(n.payload().to_string())).await.is_err() {
                            return;
                        }
                    }
                    Ok(tokio_postgres::AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice.message(), "PostgreSQL notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(Err(ListenerError::ConnectionLost {
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                }
            }
            let _ = tx
                .send(Err(ListenerError::ConnectionLost {
                    message: "connection closed by server".to_string(),
                }))
                .await;
        });

        let session = FeedSession::new(rx).with_pump(pump);
        client
            .batch_execute(&format!("LISTEN {channel}"))
            .await
            .map_err(|e| connect_failed("LISTEN", e))?;

        // Dropping the client would close the connection.
        Ok(session.with_guard(client))
    }
}

/// Snapshot of listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Payloads received from the feed.
    pub received: u64,
    /// Payloads dropped because they did not parse.
    pub malformed: u64,
    /// Successful connections, the first one included.
    pub connections: u64,
    /// Connections lost after having been established.
    pub disconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    connections: AtomicU64,
    disconnects: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the broadcaster fed from a [`ChangeFeed`].
#[derive(Clone)]
pub struct ChangeListener {
    feed: Arc<dyn ChangeFeed>,
    broadcaster: Arc<Broadcaster>,
    channel: String,
    backoff: BackoffPolicy,
}

impl ChangeListener {
    /// Creates a listener; nothing connects until [`ChangeListener::start`].
    #[must_use]
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        broadcaster: Arc<Broadcaster>,
        channel: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            feed,
            broadcaster,
            channel: channel.into(),
            backoff,
        }
    }

    /// The subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Connects once, then keeps listening in the background.
    ///
    /// # Errors
    ///
    /// Returns the initial connection failure; nothing is spawned in that
    /// case. Later failures are retried and only logged.
    pub async fn start(self) -> Result<ListenerHandle, ListenerError> {
        let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
        let session = match self.feed.connect(&self.channel).await {
            Ok(session) => session,
            Err(e) => {
                error!(channel = %self.channel, error = %e, "initial change feed connection failed");
                return Err(e);
            }
        };
        info!(channel = %self.channel, "listening for changes");
        state_tx.send_replace(ListenerState::Listening);
        Ok(self.launch(Some(session), state_tx, state_rx))
    }

    /// Starts the background loop without requiring the first connection to
    /// succeed. Used when running degraded.
    #[must_use]
    pub fn spawn(self) -> ListenerHandle {
        let (state_tx, state_rx) = watch::channel(ListenerState::Disconnected);
        self.launch(None, state_tx, state_rx)
    }

    fn launch(
        self,
        session: Option<FeedSession>,
        state_tx: watch::Sender<ListenerState>,
        state_rx: watch::Receiver<ListenerState>,
    ) -> ListenerHandle {
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(
            self,
            session,
            state_tx,
            Arc::clone(&counters),
            shutdown_rx,
        ));
        ListenerHandle {
            state: state_rx,
            counters,
            shutdown: shutdown_tx,
            join,
        }
    }

    fn handle_payload(&self, payload: &str, counters: &Counters) {
        counters.received.fetch_add(1, Ordering::Relaxed);
        match ChangeNotification::parse(payload) {
            Ok(change) => {
                if let Err(e) = self.broadcaster.dispatch(change) {
                    error!(error = %e, "dispatch failed");
                }
            }
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed change payload");
            }
        }
    }
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListener")
            .field("channel", &self.channel)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Returns false when shutdown was requested during the wait.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn run_loop(
    listener: ChangeListener,
    mut session: Option<FeedSession>,
    state: watch::Sender<ListenerState>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let mut current = match session.take() {
            Some(live) => live,
            None => {
                state.send_replace(ListenerState::Connecting);
                let connected = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = listener.feed.connect(&listener.channel) => result,
                };
                match connected {
                    Ok(live) => {
                        info!(channel = %listener.channel, "change feed reconnected");
                        live
                    }
                    Err(e) => {
                        state.send_replace(ListenerState::Disconnected);
                        let delay = listener.backoff.next(attempt);
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "change feed connection failed");
                        if !sleep_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                }
            }
        };

        attempt = 0;
        counters.connections.fetch_add(1, Ordering::Relaxed);
        state.send_replace(ListenerState::Listening);

        let lost = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break None,
                item = current.next() => match item {
                    Some(Ok(payload)) => listener.handle_payload(&payload, &counters),
                    Some(Err(e)) => break Some(e),
                    None => break Some(ListenerError::ConnectionLost {
                        message: "change feed ended".to_string(),
                    }),
                },
            }
        };
        drop(current);
        state.send_replace(ListenerState::Disconnected);

        let Some(e) = lost else {
            break;
        };
        counters.disconnects.fetch_add(1, Ordering::Relaxed);
        let delay = listener.backoff.next(attempt);
        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "change feed lost, reconnecting");
        if !sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
        attempt = attempt.saturating_add(1);
    }

    state.send_replace(ListenerState::Disconnected);
    debug!(channel = %listener.channel, "change listener stopped");
}

/// Control handle for a running listener.
///
/// Dropping the handle stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    state: watch::Receiver<ListenerState>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "change listener task failed");
        }
    }
}
