//! WebSocket endpoint for live observers.
//!
//! Every accepted socket gets its own task, a [`ConnectionId`] and a bounded
//! outbound queue that the broadcaster fills through a [`ConnectionSink`].
//! The task registers the connection on `subscribe`, answers `ping`, and
//! unregisters on close, error, eviction or shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::GatewayError;

use super::broadcast::Broadcaster;
use super::protocol::{ClientMessage, ServerMessage};
use super::registry::{ConnectionId, SubscriptionRegistry};
use super::sink::{ConnectionSink, ObserverSink};

/// Decides whether an observer may connect, based on the upgrade request.
pub trait Authenticator: Send + Sync {
    /// Returns true if the request may be upgraded.
    fn authenticate(&self, request: &Request) -> bool;
}

/// Accepts every observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _request: &Request) -> bool {
        true
    }
}

/// Requires a shared bearer token.
///
/// The token is read from `Authorization: Bearer <token>` or, for browser
/// clients that cannot set headers, from a `token` query parameter.
#[derive(Clone)]
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    /// Creates an authenticator for `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    fn presented<'a>(request: &'a Request) -> Option<&'a str> {
        let from_header = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        from_header.or_else(|| {
            request
                .uri()
                .query()?
                .split('&')
                .find_map(|pair| pair.strip_prefix("token="))
        })
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, request: &Request) -> bool {
        Self::presented(request).is_some_and(|t| t == self.token)
    }
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator").finish_non_exhaustive()
    }
}

struct Shared {
    registry: Arc<SubscriptionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    outbound_capacity: usize,
    active: AtomicUsize,
}

/// Decrements the active connection count when a handler exits.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// WebSocket server bound to a local address.
pub struct ObserverGateway {
    listener: TcpListener,
    shared: Arc<Shared>,
    max_connections: usize,
}

impl ObserverGateway {
    /// Binds the listening socket.
    ///
    /// Observers must present `config.observer_token` when one is set.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] if the address cannot be bound.
    pub async fn bind(config: &ServerConfig, broadcaster: &Broadcaster) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: config.bind_addr.to_string(),
                source,
            })?;
        let authenticator: Arc<dyn Authenticator> = match &config.observer_token {
            Some(token) => Arc::new(StaticTokenAuthenticator::new(token.clone())),
            None => Arc::new(AllowAll),
        };
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry: Arc::clone(broadcaster.registry()),
                authenticator,
                outbound_capacity: config.outbound_capacity.max(1),
                active: AtomicUsize::new(0),
            }),
            max_connections: config.max_connections,
        })
    }

    /// Replaces the authenticator.
    #[must_use]
    pub fn with_authenticator(self, authenticator: Arc<dyn Authenticator>) -> Self {
        let shared = Arc::new(Shared {
            registry: Arc::clone(&self.shared.registry),
            authenticator,
            outbound_capacity: self.shared.outbound_capacity,
            active: AtomicUsize::new(0),
        });
        Self { shared, ..self }
    }

    /// The bound address; useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Accepts connections until `shutdown` flips to true or its sender is dropped.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and skipped; this currently always returns `Ok`.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        info!(
            addr = %self.listener.local_addr()?,
            max_connections = self.max_connections,
            "observer gateway listening"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    };

                    let current = self.shared.active.load(Ordering::Acquire);
                    if current >= self.max_connections {
                        warn!(addr = %addr, current, max = self.max_connections, "rejecting observer: max_connections reached");
                        drop(stream);
                        continue;
                    }

                    let _ = stream.set_nodelay(true);
                    self.shared.active.fetch_add(1, Ordering::AcqRel);
                    let guard = ActiveGuard(Arc::clone(&self.shared));
                    let connection_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, guard, connection_shutdown).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("observer gateway shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObserverGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGateway")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("max_connections", &self.max_connections)
            .field("active", &self.active_connections())
            .finish_non_exhaustive()
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    guard: ActiveGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    let shared = Arc::clone(&guard.0);
    let authenticator = Arc::clone(&shared.authenticator);
    let check = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if authenticator.authenticate(request) {
            Ok(response)
        } else {
            Err(unauthorized())
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(addr = %addr, error = %e, "observer handshake failed");
            return;
        }
    };

    let connection = ConnectionId::new();
    let (tx, mut outbound) = mpsc::channel::<Arc<str>>(shared.outbound_capacity);
    let evicted = Arc::new(Notify::new());
    let sink: Arc<dyn ObserverSink> = Arc::new(ConnectionSink::new(tx, Arc::clone(&evicted)));
    let (mut write, mut read) = ws_stream.split();
    debug!(addr = %addr, %connection, "observer connected");

    loop {
        tokio::select! {
            Some(frame) = outbound.recv() => {
                if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            () = evicted.notified() => {
                debug!(%connection, "observer evicted, closing");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = read.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(text.as_str(), connection, &sink, &shared.registry)
                    }
                    Some(Ok(Message::Binary(_))) => Some(ServerMessage::Error {
                        message: "binary frames are not supported".to_string(),
                    }),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        debug!(%connection, error = %e, "observer read error");
                        break;
                    }
                };
                if let Some(reply) = reply {
                    match reply.encode() {
                        Ok(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode reply"),
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let _ = shared.registry.unregister(connection);
    debug!(addr = %addr, %connection, "observer disconnected");
}

fn handle_client_text(
    text: &str,
    connection: ConnectionId,
    sink: &Arc<dyn ObserverSink>,
    registry: &SubscriptionRegistry,
) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(ServerMessage::Error {
                message: format!("invalid message: {e}"),
            })
        }
    };

    match message {
        ClientMessage::Subscribe { .. } => {
            let interest = message.interest().unwrap_or_default();
            let ack = ServerMessage::subscribed(&interest);
            match registry.register(connection, Arc::clone(sink), interest) {
                Ok(replaced) => {
                    debug!(%connection, replaced, "observer subscribed");
                    Some(ack)
                }
                Err(e) => Some(ServerMessage::Error { message: e.to_string() }),
            }
        }
        ClientMessage::Unsubscribe => {
            let _ = registry.unregister(connection);
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
