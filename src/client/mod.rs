//! Client SDK: buffering, batching and at-least-once delivery of tracked events.

/// Bounded primary and retry queues.
pub mod buffer;
/// Flush guard and requeue logic.
pub mod delivery;
/// Injected host capabilities.
pub mod env;
/// Tracked event model and boundary validation.
pub mod event;
/// The tracker instance and its flush worker.
pub mod tracker;
/// Ingestion transport seam.
pub mod transport;

pub use buffer::{EventBuffer, OutgoingBatch, PushOutcome};
pub use delivery::{DeliveryAgent, DeliveryStats, FlushOutcome};
pub use env::{Environment, LifecycleSignal, MemorySessionStore, SessionStore, StaticEnvironment};
pub use event::{EventKind, Metadata, TrackedEvent, CRITICAL_EVENT_TYPES};
pub use tracker::{Tracker, TrackerBuilder};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{DeliveryMode, EventTransport};
