//! Live observer subscriptions.
//!
//! The registry is shared between per-connection handlers (which register and
//! unregister) and the broadcaster (which reads). Reads take a snapshot of the
//! matching sinks under a short read lock; delivery happens after the lock is
//! released, so a slow sink never holds up registration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PulseError, PulseResult};

use super::notification::ChangeNotification;
use super::sink::ObserverSink;

fn lock_err(context: &'static str) -> PulseError {
    PulseError::internal(format!("poisoned lock: {context}"))
}

/// Unique identifier for an observer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Interest predicate: table inclusion list plus field equality filters.
///
/// - `tables: None` accepts every table; `Some(set)` accepts only listed
///   tables, so an empty set accepts nothing.
/// - `filters` is a conjunction of exact JSON equalities against top-level
///   keys of the notification's `data`. `"42"`, `42` and `"042"` are all
///   different values; a missing key never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    /// Accepted tables.
    pub tables: Option<HashSet<String>>,
    /// Required top-level field values.
    pub filters: Option<Map<String, Value>>,
}

impl Interest {
    /// Interest in every change.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Interest restricted to the given tables.
    #[must_use]
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: Some(tables.into_iter().map(Into::into).collect()),
            filters: None,
        }
    }

    /// Adds a field equality filter.
    #[must_use]
    pub fn with_filter(mut self, key: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.filters
            .get_or_insert_with(Map::new)
            .insert(key.into(), expected.into());
        self
    }

    /// Evaluates the predicate against a change.
    #[must_use]
    pub fn matches(&self, change: &ChangeNotification) -> bool {
        if let Some(tables) = &self.tables {
            if !tables.contains(&change.table) {
                return false;
            }
        }
        if let Some(filters) = &self.filters {
            return filters
                .iter()
                .all(|(key, expected)| change.data.get(key) == Some(expected));
        }
        true
    }
}

struct Subscription {
    interest: Interest,
    sink: Arc<dyn ObserverSink>,
}

/// Concurrency-safe map of observer connections to their interest.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<ConnectionId, Subscription>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the subscription for `connection`.
    ///
    /// A replaced subscription's interest is discarded, never merged.
    /// Returns true if a previous subscription existed.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn register(
        &self,
        connection: ConnectionId,
        sink: Arc<dyn ObserverSink>,
        interest: Interest,
    ) -> PulseResult<bool> {
        let mut guard = self.entries.write().map_err(|_| lock_err("registry"))?;
        let replaced = guard
            .insert(connection, Subscription { interest, sink })
            .is_some();
        Ok(replaced)
    }

    /// Removes the subscription for `connection`. Unknown ids are a no-op.
    ///
    /// Returns true if a subscription was removed.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn unregister(&self, connection: ConnectionId) -> PulseResult<bool> {
        let mut guard = self.entries.write().map_err(|_| lock_err("registry"))?;
        Ok(guard.remove(&connection).is_some())
    }

    /// Removes the subscription for `connection` only while it still uses
    /// `sink`. A subscription re-registered with another sink is kept.
    ///
    /// Returns true if a subscription was removed.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn unregister_sink(&self, connection: ConnectionId, sink: &Arc<dyn ObserverSink>) -> PulseResult<bool> {
        let mut guard = self.entries.write().map_err(|_| lock_err("registry"))?;
        match guard.get(&connection) {
            Some(sub) if Arc::ptr_eq(&sub.sink, sink) => Ok(guard.remove(&connection).is_some()),
            _ => Ok(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.entries.write();
            panic!("registry poisoned");
        }));
    }

    /// Snapshot of the sinks whose interest matches `change`.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn matching(&self, change: &ChangeNotification) -> PulseResult<Vec<(ConnectionId, Arc<dyn ObserverSink>)>> {
        let guard = self.entries.read().map_err(|_| lock_err("registry"))?;
        Ok(guard
            .iter()
            .filter(|(_, sub)| sub.interest.matches(change))
            .map(|(id, sub)| (*id, Arc::clone(&sub.sink)))
            .collect())
    }

    /// Current interest of a connection.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Internal`] if the registry lock is poisoned.
    pub fn interest(&self, connection: ConnectionId) -> PulseResult<Option<Interest>> {
        let guard = self.entries.read().map_err(|_| lock_err("registry"))?;
        Ok(guard.get(&connection).map(|sub| sub.interest.clone()))
    }

    /// Returns true if the connection has a subscription.
    #[must_use]
    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.entries
            .read()
            .map(|g| g.contains_key(&connection))
            .unwrap_or(false)
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Returns true if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}
