//! Host environment capabilities.
//!
//! The tracker never reaches for process globals. Everything it needs from
//! the host (where the user is, what agent they run, where the session id
//! lives) is injected through these traits.

use std::collections::HashMap;
use std::sync::RwLock;

use super::event::Metadata;

/// Ambient context captured at `track` time.
pub trait Environment: Send + Sync {
    /// Current page or screen URL.
    fn page_url(&self) -> Option<String>;

    /// URL that led to the current page.
    fn referrer(&self) -> Option<String>;

    /// Client user agent string.
    fn user_agent(&self) -> Option<String>;

    /// Writes the available ambient values into `metadata`.
    fn capture(&self, metadata: &mut Metadata) {
        let pairs = [
            ("url", self.page_url()),
            ("referrer", self.referrer()),
            ("userAgent", self.user_agent()),
        ];
        for (key, value) in pairs {
            if let Some(v) = value {
                metadata.insert(key.to_string(), serde_json::Value::String(v));
            }
        }
    }
}

/// Session-scoped key/value storage.
pub trait SessionStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a value, replacing any previous one.
    fn set(&self, key: &str, value: &str);

    /// Removes a value. Missing keys are ignored.
    fn remove(&self, key: &str);
}

/// Page lifecycle transitions reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The page or app moved to the background.
    Hidden,
    /// The page or app became visible again.
    Visible,
    /// The page or process is going away.
    Unload,
}

/// Environment with fixed values, for servers, CLIs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticEnvironment {
    /// Reported page URL.
    pub page_url: Option<String>,
    /// Reported referrer.
    pub referrer: Option<String>,
    /// Reported user agent.
    pub user_agent: Option<String>,
}

impl StaticEnvironment {
    /// Environment that reports only a user agent.
    #[must_use]
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: Some(user_agent.into()),
            ..Self::default()
        }
    }
}

impl Environment for StaticEnvironment {
    fn page_url(&self) -> Option<String> {
        self.page_url.clone()
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.clone()
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.clone()
    }
}

/// In-process session storage.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.values.write() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.values.write() {
            guard.remove(key);
        }
    }
}
