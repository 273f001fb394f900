//! Server side: change listener, subscription registry and observer fan-out.
//!
//! The registry, broadcaster and in-process streams are synchronous and
//! always available. The change listener and the WebSocket gateway need a
//! tokio runtime and live behind the `server` feature.

/// Fan-out of changes to matching observers.
pub mod broadcast;
/// Change payload model.
pub mod notification;
/// Observer wire protocol.
pub mod protocol;
/// Live observer subscriptions and interest predicates.
pub mod registry;
/// Observer sink seam.
pub mod sink;
/// In-process observer streams.
pub mod stream;

/// WebSocket observer endpoint.
#[cfg(feature = "server")]
pub mod gateway;
/// Storage-layer change listener.
#[cfg(feature = "server")]
pub mod listener;

pub use broadcast::{BroadcastStats, Broadcaster, DispatchReport};
pub use notification::{ChangeAction, ChangeNotification};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{ConnectionId, Interest, SubscriptionRegistry};
pub use sink::{ChannelSink, Delivery, ObserverSink};
pub use stream::ObserverStream;

#[cfg(feature = "server")]
pub use gateway::{AllowAll, Authenticator, ObserverGateway, StaticTokenAuthenticator};
#[cfg(feature = "server")]
pub use listener::{
    ChangeFeed, ChangeListener, FeedSession, ListenerHandle, ListenerState, ListenerStats, PgChangeFeed,
};
#[cfg(feature = "server")]
pub use sink::ConnectionSink;
