//! Tracked event types.
//!
//! Known event types carry a typed field set (`EventKind`); anything else goes
//! through `EventKind::Custom` plus the open extension map. Both are validated
//! when `track` is called, so everything that reaches the buffer has a known
//! shape.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Open key/value map attached to every event.
pub type Metadata = serde_json::Map<String, Value>;

/// Event types that force an immediate flush.
pub const CRITICAL_EVENT_TYPES: [&str; 3] = ["purchase", "signup", "error"];

/// Metadata keys filled from the host environment.
pub const AMBIENT_KEYS: [&str; 3] = ["url", "referrer", "userAgent"];

/// Maximum number of caller-supplied metadata entries per event.
pub const MAX_CUSTOM_ENTRIES: usize = 64;

const KNOWN_EVENT_TYPES: [&str; 5] = ["page_view", "click", "purchase", "signup", "error"];

static EVENT_NAME: OnceLock<Regex> = OnceLock::new();

fn event_name_pattern() -> &'static Regex {
    EVENT_NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.:-]{0,63}$").expect("event name pattern is valid")
    })
}

/// Returns true if events of this type bypass batching.
#[must_use]
pub fn is_critical_event_type(event_type: &str) -> bool {
    CRITICAL_EVENT_TYPES.contains(&event_type)
}

/// A single behavioral event as sent to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    /// Event type name (`purchase`, `page_view`, custom names).
    pub event_type: String,
    /// Session the event was recorded in.
    pub session_id: String,
    /// Identified user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Typed fields, ambient context and custom entries.
    pub metadata: Metadata,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

impl TrackedEvent {
    /// Returns true if this event bypasses batching.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        is_critical_event_type(&self.event_type)
    }
}

/// Known event types with their typed fields.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A page or screen was shown.
    PageView {
        path: Option<String>,
        title: Option<String>,
    },
    /// An interactive element was activated.
    Click {
        target: String,
        label: Option<String>,
    },
    /// A completed purchase.
    Purchase {
        order_id: String,
        amount: f64,
        currency: String,
    },
    /// A new account was created.
    Signup {
        method: Option<String>,
    },
    /// An application error surfaced to the user.
    Error {
        message: String,
        source: Option<String>,
    },
    /// Any other event, identified by name.
    Custom {
        name: String,
    },
}

impl EventKind {
    /// Shorthand for [`EventKind::Custom`].
    #[must_use]
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom { name: name.into() }
    }

    /// Wire name of this event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::PageView { .. } => "page_view",
            Self::Click { .. } => "click",
            Self::Purchase { .. } => "purchase",
            Self::Signup { .. } => "signup",
            Self::Error { .. } => "error",
            Self::Custom { name } => name.as_str(),
        }
    }

    /// Returns true if this event forces an immediate flush.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        is_critical_event_type(self.event_type())
    }

    /// Metadata keys owned by the typed fields of this kind.
    #[must_use]
    pub const fn typed_keys(&self) -> &'static [&'static str] {
        match self {
            Self::PageView { .. } => &["path", "title"],
            Self::Click { .. } => &["target", "label"],
            Self::Purchase { .. } => &["orderId", "amount", "currency"],
            Self::Signup { .. } => &["method"],
            Self::Error { .. } => &["message", "source"],
            Self::Custom { .. } => &[],
        }
    }

    /// Validates the typed fields and the caller's extension map.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self, extra: &Metadata) -> Result<(), ValidationError> {
        match self {
            Self::Custom { name } => {
                if !event_name_pattern().is_match(name) {
                    return Err(ValidationError::InvalidEventName { name: name.clone() });
                }
                if KNOWN_EVENT_TYPES.contains(&name.as_str()) {
                    return Err(ValidationError::ReservedEventName { name: name.clone() });
                }
            }
            Self::Click { target, .. } => require_non_empty("target", target)?,
            Self::Purchase {
                order_id,
                amount,
                currency,
            } => {
                require_non_empty("orderId", order_id)?;
                if !amount.is_finite() || *amount < 0.0 {
                    return Err(ValidationError::InvalidField {
                        field: "amount".to_string(),
                        reason: "must be a finite, non-negative number".to_string(),
                    });
                }
                if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(ValidationError::InvalidField {
                        field: "currency".to_string(),
                        reason: "must be a three-letter code".to_string(),
                    });
                }
            }
            Self::Error { message, .. } => require_non_empty("message", message)?,
            Self::PageView { .. } | Self::Signup { .. } => {}
        }

        if extra.len() > MAX_CUSTOM_ENTRIES {
            return Err(ValidationError::TooManyMetadataEntries {
                actual: extra.len(),
                max: MAX_CUSTOM_ENTRIES,
            });
        }
        let typed = self.typed_keys();
        if let Some(key) = extra
            .keys()
            .find(|k| AMBIENT_KEYS.contains(&k.as_str()) || typed.contains(&k.as_str()))
        {
            return Err(ValidationError::ReservedMetadataKey { key: key.clone() });
        }
        Ok(())
    }

    /// Writes the typed fields into `metadata`, skipping absent optionals.
    pub fn write_fields(&self, metadata: &mut Metadata) {
        match self {
            Self::PageView { path, title } => {
                put_opt(metadata, "path", path.as_deref());
                put_opt(metadata, "title", title.as_deref());
            }
            Self::Click { target, label } => {
                put_str(metadata, "target", target);
                put_opt(metadata, "label", label.as_deref());
            }
            Self::Purchase {
                order_id,
                amount,
                currency,
            } => {
                put_str(metadata, "orderId", order_id);
                let amount = serde_json::Number::from_f64(*amount).map_or(Value::Null, Value::Number);
                metadata.insert("amount".to_string(), amount);
                put_str(metadata, "currency", &currency.to_ascii_uppercase());
            }
            Self::Signup { method } => put_opt(metadata, "method", method.as_deref()),
            Self::Error { message, source } => {
                put_str(metadata, "message", message);
                put_opt(metadata, "source", source.as_deref());
            }
            Self::Custom { .. } => {}
        }
    }
}

fn put_str(metadata: &mut Metadata, key: &str, value: &str) {
    metadata.insert(key.to_string(), Value::String(value.to_string()));
}

fn put_opt(metadata: &mut Metadata, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        put_str(metadata, key, v);
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}
