//! Error types for EventPulse.
//!
//! All errors in EventPulse are strongly typed using thiserror.
//! Client-side errors are absorbed by the SDK and only surface in logs and
//! flush outcomes; server-side only the initial listener connection is
//! reported to the caller.

use thiserror::Error;

/// Validation errors that occur at the SDK and protocol boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Event name '{name}' is not a valid identifier")]
    InvalidEventName {
        name: String,
    },

    #[error("Event name '{name}' is reserved for a typed event")]
    ReservedEventName {
        name: String,
    },

    #[error("Metadata key '{key}' is reserved")]
    ReservedMetadataKey {
        key: String,
    },

    #[error("Metadata has {actual} custom entries, maximum is {max}")]
    TooManyMetadataEntries {
        actual: usize,
        max: usize,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },
}

/// Failures transmitting a batch to the ingestion endpoint.
///
/// Every variant is handled the same way by the delivery agent: the batch is
/// requeued and retried on the next flush.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Network error: {message}")]
    Network {
        message: String,
    },

    #[error("Ingestion endpoint rejected batch with status {status}")]
    Rejected {
        status: u16,
    },

    #[error("Failed to encode batch: {message}")]
    Encode {
        message: String,
    },
}

/// A change payload that could not be turned into a notification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed change payload: {message}")]
    Malformed {
        message: String,
    },
}

/// Errors from the storage-layer change listener.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Failed to connect change feed: {message}")]
    ConnectFailed {
        message: String,
    },

    #[error("Change feed connection lost: {message}")]
    ConnectionLost {
        message: String,
    },
}

/// Delivery to a single observer failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    #[error("observer connection is closed")]
    Closed,

    #[error("observer connection is not ready")]
    NotReady,
}

/// Errors from an in-process observer stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Observer stream disconnected")]
    Disconnected,

    #[error("Timed out after {duration_ms}ms waiting for a change")]
    Timeout {
        duration_ms: u64,
    },
}

/// Errors from the observer gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Required setting '{name}' is missing")]
    Missing {
        name: String,
    },

    #[error("Setting '{name}' is invalid: {reason}")]
    Invalid {
        name: String,
        reason: String,
    },
}

/// Top-level error type for EventPulse.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl PulseError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery(DeliveryError::Encode { .. }) => false,
            Self::Delivery(_) => true,
            Self::Listener(_) => true,
            Self::Stream(StreamError::Timeout { .. }) => true,
            Self::Gateway(GatewayError::Io(_)) => true,
            Self::Validation(_)
            | Self::Payload(_)
            | Self::Stream(_)
            | Self::Gateway(_)
            | Self::Config(_)
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for EventPulse operations.
pub type PulseResult<T> = Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_event_name() {
        let err = ValidationError::InvalidEventName {
            name: "9lives".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("9lives"));
        assert!(msg.contains("not a valid identifier"));
    }

    #[test]
    fn test_delivery_error_rejected() {
        let err = DeliveryError::Rejected { status: 503 };
        let msg = format!("{err}");
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_listener_error() {
        let err = ListenerError::ConnectFailed {
            message: "refused".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Failed to connect"));
        assert!(msg.contains("refused"));
    }

    #[test]
    fn test_pulse_error_from_validation() {
        let err: PulseError = ValidationError::MissingField {
            field: "apiKey".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pulse_error_from_delivery() {
        let err: PulseError = DeliveryError::Network {
            message: "timeout".to_string(),
        }
        .into();
        assert!(err.is_delivery());
        assert!(err.is_retryable());

        let err: PulseError = DeliveryError::Encode {
            message: "bad float".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pulse_error_internal() {
        let err = PulseError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }

    #[test]
    fn test_listener_errors_are_retryable() {
        let err: PulseError = ListenerError::ConnectionLost {
            message: "eof".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: PulseError = PayloadError::Malformed {
            message: "expected object".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }
}
