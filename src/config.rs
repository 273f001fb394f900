//! Configuration for the client SDK and the fan-out server.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// Client SDK configuration.
///
/// Field names follow the camelCase keys used by host applications, so a
/// config object can be deserialized straight from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    /// Base URL of the ingestion endpoint, without the `/events/batch` suffix.
    pub api_url: String,
    /// Key sent as `X-API-Key`.
    pub api_key: String,
    /// Primary buffer length that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Upper bound on buffered events (primary + retry).
    pub max_queue_size: usize,
    /// Periodic flush interval.
    pub flush_interval_ms: u64,
    /// Request timeout for normal flushes.
    pub request_timeout_ms: u64,
    /// Request timeout for teardown flushes.
    pub teardown_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            max_batch_size: 10,
            max_queue_size: 1000,
            flush_interval_ms: 5000,
            request_timeout_ms: 10_000,
            teardown_timeout_ms: 1000,
        }
    }
}

impl TrackerConfig {
    /// Config with the given endpoint and key, defaults elsewhere.
    #[must_use]
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Periodic flush interval as a `Duration`.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Checks that the config can drive a tracker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                name: "apiUrl".to_string(),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing {
                name: "apiKey".to_string(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(invalid("maxBatchSize", "must be at least 1"));
        }
        if self.max_queue_size < self.max_batch_size {
            return Err(invalid("maxQueueSize", "must be at least maxBatchSize"));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("flushIntervalMs", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Fan-out server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the observer gateway binds to.
    pub bind_addr: SocketAddr,
    /// Connection string for the change feed.
    pub database_url: String,
    /// Notification channel the listener subscribes to.
    pub channel: String,
    /// Per-observer outbound queue capacity.
    pub outbound_capacity: usize,
    /// Maximum concurrent observer connections.
    pub max_connections: usize,
    /// Listener reconnect delay policy.
    pub reconnect: BackoffPolicy,
    /// Refuse to start when the change feed is unreachable at startup.
    pub require_realtime: bool,
    /// Bearer token observers must present; `None` accepts everyone.
    pub observer_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            database_url: String::new(),
            channel: "table_changes".to_string(),
            outbound_capacity: 256,
            max_connections: 10_000,
            reconnect: BackoffPolicy::default(),
            require_realtime: false,
            observer_token: None,
        }
    }
}

impl ServerConfig {
    /// Builds a config from `EVENTPULSE_*` variables and `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable is present but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable is present but unparsable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("EVENTPULSE_BIND") {
            cfg.bind_addr = v
                .parse()
                .map_err(|e| invalid("EVENTPULSE_BIND", &format!("{e}")))?;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = lookup("EVENTPULSE_CHANNEL") {
            cfg.channel = v;
        }
        if let Some(v) = lookup("EVENTPULSE_OUTBOUND_CAPACITY") {
            cfg.outbound_capacity = parse_number("EVENTPULSE_OUTBOUND_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("EVENTPULSE_MAX_CONNECTIONS") {
            cfg.max_connections = parse_number("EVENTPULSE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("EVENTPULSE_RECONNECT_MS") {
            let ms: u64 = parse_number("EVENTPULSE_RECONNECT_MS", &v)?;
            cfg.reconnect = BackoffPolicy::fixed(Duration::from_millis(ms));
        }
        if let Some(v) = lookup("EVENTPULSE_RECONNECT_MAX_MS") {
            let ms: u64 = parse_number("EVENTPULSE_RECONNECT_MAX_MS", &v)?;
            cfg.reconnect = BackoffPolicy::exponential(cfg.reconnect.first, Duration::from_millis(ms));
        }
        if let Some(v) = lookup("EVENTPULSE_REQUIRE_REALTIME") {
            cfg.require_realtime = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("EVENTPULSE_OBSERVER_TOKEN") {
            if !v.is_empty() {
                cfg.observer_token = Some(v);
            }
        }

        Ok(cfg)
    }

    /// Checks that the config can drive a server.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                name: "DATABASE_URL".to_string(),
            });
        }
        let channel_ok = !self.channel.is_empty()
            && self
                .channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !channel_ok {
            return Err(invalid("channel", "must be a non-empty [A-Za-z0-9_] identifier"));
        }
        if self.outbound_capacity == 0 {
            return Err(invalid("outbound_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, &e.to_string()))
}
