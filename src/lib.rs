//! # EventPulse - Reliable event capture and live change fan-out
//!
//! EventPulse has two halves that meet at the ingestion endpoint:
//!
//! - **Client SDK** ([`client`]): a [`Tracker`] buffers behavioral events,
//!   batches them and delivers them at least once, retrying failed batches
//!   on the next flush.
//! - **Server** ([`server`]): a change listener subscribes to storage-layer
//!   notifications and a [`server::Broadcaster`] forwards each change to the
//!   live observers whose interest matches it.
//!
//! ## Core Concepts
//!
//! - **Flush**: take everything buffered as one batch and send it
//! - **Critical event**: `purchase`, `signup` or `error`; flushed immediately
//! - **Interest**: table inclusion list plus exact-match field filters
//! - **Observer**: a live connection receiving matching changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use eventpulse::{EventKind, Metadata, Tracker, TrackerConfig};
//!
//! let tracker = Tracker::builder(TrackerConfig::new("https://api.example.com", "key")).build()?;
//! tracker.identify("user-7")?;
//! tracker.track(EventKind::Click { target: "#buy".into(), label: None }, Metadata::new());
//! tracker.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod server;

// Re-export primary types at crate root for convenience
pub use backoff::BackoffPolicy;
pub use client::{
    DeliveryAgent, DeliveryMode, EventBuffer, EventKind, EventTransport, FlushOutcome, LifecycleSignal, Metadata,
    TrackedEvent, Tracker, TrackerBuilder,
};
pub use config::{ServerConfig, TrackerConfig};
pub use error::{
    ConfigError, DeliveryError, GatewayError, ListenerError, PayloadError, PulseError, PulseResult, SendFailure,
    StreamError, ValidationError,
};
pub use server::{Broadcaster, ChangeAction, ChangeNotification, Interest, ObserverStream, SubscriptionRegistry};
