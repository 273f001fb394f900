//! The tracker instance.
//!
//! A `Tracker` owns its configuration, identity and buffer; there is no
//! process-wide SDK state. Each tracker runs one worker thread that performs
//! all network I/O:
//!
//! - flush requests from `track` (batch full or critical event),
//! - the periodic flush timer,
//! - lifecycle signals from the host (hide/unload trigger a teardown flush),
//! - shutdown.
//!
//! `track` only takes the buffer lock and a non-blocking `try_send`, so it
//! never waits on the network or on queue capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::error::{PulseError, PulseResult, ValidationError};

use super::buffer::EventBuffer;
use super::delivery::{DeliveryAgent, DeliveryStats, FlushOutcome};
use super::env::{Environment, LifecycleSignal, MemorySessionStore, SessionStore, StaticEnvironment};
use super::event::{EventKind, Metadata, TrackedEvent};
use super::transport::{DeliveryMode, EventTransport};

/// Session storage key holding the current session id.
pub const SESSION_KEY: &str = "eventpulse.session_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Flush,
    Lifecycle(LifecycleSignal),
}

#[derive(Debug, Clone)]
struct Identity {
    session_id: String,
    user_id: Option<String>,
}

/// Builder for [`Tracker`].
pub struct TrackerBuilder {
    config: TrackerConfig,
    environment: Option<Arc<dyn Environment>>,
    sessions: Option<Arc<dyn SessionStore>>,
    transport: Option<Arc<dyn EventTransport>>,
}

impl TrackerBuilder {
    /// Starts a builder for the given config.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            environment: None,
            sessions: None,
            transport: None,
        }
    }

    /// Sets the ambient context source. Defaults to an empty environment.
    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Sets the session store. Defaults to in-memory storage.
    #[must_use]
    pub fn session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Sets the ingestion transport. Defaults to HTTP when the `http`
    /// feature is enabled.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validates the config and starts the tracker's worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Config`] for invalid settings or a missing
    /// transport, and [`PulseError::Internal`] if the worker cannot start.
    pub fn build(self) -> PulseResult<Tracker> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(t) => t,
            None => default_transport(&self.config)?,
        };
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(StaticEnvironment::default()) as Arc<dyn Environment>);
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>);

        let session_id = match sessions.get(SESSION_KEY) {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                let id = Uuid::new_v4().to_string();
                sessions.set(SESSION_KEY, &id);
                id
            }
        };

        let buffer = Arc::new(EventBuffer::new(self.config.max_queue_size));
        let agent = Arc::new(DeliveryAgent::new(Arc::clone(&buffer), transport));

        // A single pending flush request is enough; extra requests coalesce.
        let (command_tx, command_rx) = bounded::<Command>(4);
        // Shutdown has its own slot; a full command queue must not swallow it.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let interval = self.config.flush_interval();
        let worker_agent = Arc::clone(&agent);
        let join = thread::Builder::new()
            .name("eventpulse-flush".to_string())
            .spawn(move || worker_loop(&worker_agent, &command_rx, &shutdown_rx, interval))
            .map_err(|e| PulseError::internal(format!("failed to spawn flush worker: {e}")))?;

        info!(
            max_batch_size = self.config.max_batch_size,
            max_queue_size = self.config.max_queue_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "tracker started"
        );

        Ok(Tracker {
            config: self.config,
            environment,
            sessions,
            identity: RwLock::new(Identity {
                session_id,
                user_id: None,
            }),
            buffer,
            agent,
            command_tx,
            shutdown_tx,
            running: AtomicBool::new(true),
            join: Mutex::new(Some(join)),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &TrackerConfig) -> PulseResult<Arc<dyn EventTransport>> {
    let transport = super::transport::HttpTransport::new(config)?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &TrackerConfig) -> PulseResult<Arc<dyn EventTransport>> {
    Err(crate::error::ConfigError::Missing {
        name: "transport".to_string(),
    }
    .into())
}

/// Client-side event tracker.
///
/// Dropping the tracker performs the same best-effort final flush as
/// [`Tracker::shutdown`].
pub struct Tracker {
    config: TrackerConfig,
    environment: Arc<dyn Environment>,
    sessions: Arc<dyn SessionStore>,
    identity: RwLock<Identity>,
    buffer: Arc<EventBuffer>,
    agent: Arc<DeliveryAgent>,
    command_tx: Sender<Command>,
    shutdown_tx: Sender<()>,
    running: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    /// Records an event.
    ///
    /// Never fails and never blocks on the network. Invalid events and calls
    /// after shutdown are logged and dropped.
    pub fn track(&self, kind: EventKind, extra: Metadata) {
        if !self.is_running() {
            debug!(event_type = kind.event_type(), "tracker not running, event ignored");
            return;
        }
        if let Err(e) = kind.validate(&extra) {
            warn!(error = %e, event_type = kind.event_type(), "invalid event dropped");
            return;
        }

        let (session_id, user_id) = match self.identity.read() {
            Ok(id) => (id.session_id.clone(), id.user_id.clone()),
            Err(_) => {
                warn!("identity lock poisoned, event dropped");
                return;
            }
        };

        let mut metadata = extra;
        kind.write_fields(&mut metadata);
        self.environment.capture(&mut metadata);

        let event = TrackedEvent {
            event_type: kind.event_type().to_string(),
            session_id,
            user_id,
            metadata,
            timestamp: Utc::now(),
        };

        let outcome = self.buffer.push(event);
        if outcome.evicted > 0 {
            warn!(evicted = outcome.evicted, capacity = self.buffer.capacity(), "event buffer full, dropped oldest");
        }

        if kind.is_critical() || outcome.pending >= self.config.max_batch_size {
            self.request(Command::Flush);
        }
    }

    /// Records a custom event by name.
    pub fn track_custom(&self, name: &str, extra: Metadata) {
        self.track(EventKind::custom(name), extra);
    }

    /// Sets the user id attached to subsequent events.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingField`] for an empty id.
    pub fn identify(&self, user_id: &str) -> PulseResult<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "userId".to_string(),
            }
            .into());
        }
        let mut id = self
            .identity
            .write()
            .map_err(|_| PulseError::internal("identity lock poisoned"))?;
        id.user_id = Some(user_id.to_string());
        Ok(())
    }

    /// Clears the user id and starts a new session.
    ///
    /// Already buffered events keep the identity they were recorded with.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the identity lock is poisoned; the
    /// stored session is left untouched in that case.
    pub fn reset(&self) -> PulseResult<()> {
        let session_id = Uuid::new_v4().to_string();
        let mut id = self
            .identity
            .write()
            .map_err(|_| PulseError::internal("identity lock poisoned"))?;
        self.sessions.set(SESSION_KEY, &session_id);
        id.session_id = session_id;
        id.user_id = None;
        Ok(())
    }

    /// Current session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.identity
            .read()
            .map(|id| id.session_id.clone())
            .unwrap_or_default()
    }

    /// Current user id.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.identity.read().ok().and_then(|id| id.user_id.clone())
    }

    /// Flushes on the calling thread and reports what happened.
    pub fn flush(&self) -> FlushOutcome {
        self.agent.flush(DeliveryMode::Normal)
    }

    /// Reports a host lifecycle transition.
    ///
    /// `Hidden` and `Unload` trigger a teardown flush; `Unload` also stops
    /// the tracker.
    pub fn lifecycle(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::Visible => {}
            LifecycleSignal::Hidden => self.request(Command::Lifecycle(signal)),
            LifecycleSignal::Unload => self.shutdown(),
        }
    }

    /// Stops the timer and performs one final best-effort flush.
    ///
    /// Blocks until the worker has exited. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Only this call ever sends, guarded by `running`, so the slot is free.
        if self.shutdown_tx.try_send(()).is_err() {
            debug!("flush worker already gone");
        }

        let handle = self.join.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("flush worker panicked");
            }
        }
        info!(remaining = self.buffer.len(), "tracker stopped");
    }

    /// Returns true until [`Tracker::shutdown`] is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total buffered events.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// The tracker's buffer.
    #[must_use]
    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        self.agent.stats()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn request(&self, command: Command) {
        match self.command_tx.try_send(command) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!(?command, "flush worker gone, request ignored");
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("running", &self.is_running())
            .field("session_id", &self.session_id())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(
    agent: &DeliveryAgent,
    commands: &Receiver<Command>,
    shutdown: &Receiver<()>,
    interval: std::time::Duration,
) {
    let ticker = tick(interval);

    loop {
        select! {
            recv(shutdown) -> _ => {
                agent.flush(DeliveryMode::Teardown);
                break;
            }
            recv(commands) -> msg => {
                match msg {
                    Ok(Command::Flush) => {
                        agent.flush(DeliveryMode::Normal);
                    }
                    Ok(Command::Lifecycle(signal)) => {
                        debug!(?signal, "lifecycle flush");
                        agent.flush(DeliveryMode::Teardown);
                    }
                    Err(_) => {
                        agent.flush(DeliveryMode::Teardown);
                        break;
                    }
                }
            }
            recv(ticker) -> _ => {
                if !agent.buffer().is_empty() {
                    agent.flush(DeliveryMode::Normal);
                }
            }
        }
    }
}
