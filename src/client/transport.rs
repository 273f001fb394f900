//! Ingestion transport.
//!
//! `EventTransport` is the seam between the delivery agent and the network.
//! The HTTP implementation posts `{"events": [...]}` to
//! `{api_url}/events/batch`; any 2xx is a full-batch success and everything
//! else is a retryable failure.

use serde::Serialize;

use crate::error::DeliveryError;

use super::buffer::OutgoingBatch;
use super::event::TrackedEvent;

/// How a batch is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Regular flush from the timer or a trigger.
    Normal,
    /// Final flush while the host is hiding or unloading; must finish quickly.
    Teardown,
}

/// Sends batches to the ingestion endpoint.
pub trait EventTransport: Send + Sync {
    /// Transmits a batch. `Ok` means the endpoint accepted the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] on network failure or a non-2xx response.
    fn send_batch(&self, batch: &OutgoingBatch, mode: DeliveryMode) -> Result<(), DeliveryError>;
}

/// Request body for `POST /events/batch`.
#[derive(Debug, Serialize)]
pub struct BatchBody<'a> {
    /// Events in send order.
    pub events: &'a [TrackedEvent],
}

impl<'a> BatchBody<'a> {
    /// Borrows the events of a batch.
    #[must_use]
    pub fn new(batch: &'a OutgoingBatch) -> Self {
        Self {
            events: batch.events(),
        }
    }
}

/// Maps an HTTP status code to a delivery result.
///
/// # Errors
///
/// Returns [`DeliveryError::Rejected`] for anything outside 200..=299.
pub fn check_status(status: u16) -> Result<(), DeliveryError> {
    if status >= 200 && status < 300 {
        Ok(())
    } else {
        Err(DeliveryError::Rejected { status })
    }
}

/// Joins the base URL and the batch path without doubling slashes.
#[must_use]
pub fn batch_endpoint(api_url: &str) -> String {
    format!("{}/events/batch", api_url.trim_end_matches('/'))
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use reqwest::blocking::Client;

    use super::{batch_endpoint, check_status, BatchBody, DeliveryMode, EventTransport};
    use crate::client::buffer::OutgoingBatch;
    use crate::config::TrackerConfig;
    use crate::error::DeliveryError;

    /// Blocking HTTP transport backed by `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: Client,
        endpoint: String,
        api_key: String,
        request_timeout: Duration,
        teardown_timeout: Duration,
    }

    impl HttpTransport {
        /// Builds a transport for the configured endpoint.
        ///
        /// # Errors
        ///
        /// Returns [`DeliveryError::Network`] if the HTTP client cannot be built.
        pub fn new(config: &TrackerConfig) -> Result<Self, DeliveryError> {
            let client = Client::builder()
                .build()
                .map_err(|e| DeliveryError::Network {
                    message: format!("failed to build HTTP client: {e}"),
                })?;
            Ok(Self {
                client,
                endpoint: batch_endpoint(&config.api_url),
                api_key: config.api_key.clone(),
                request_timeout: Duration::from_millis(config.request_timeout_ms),
                teardown_timeout: Duration::from_millis(config.teardown_timeout_ms),
            })
        }

        /// Full URL batches are posted to.
        #[must_use]
        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl EventTransport for HttpTransport {
        fn send_batch(&self, batch: &OutgoingBatch, mode: DeliveryMode) -> Result<(), DeliveryError> {
            let timeout = match mode {
                DeliveryMode::Normal => self.request_timeout,
                DeliveryMode::Teardown => self.teardown_timeout,
            };

            let body = serde_json::to_vec(&BatchBody::new(batch)).map_err(|e| DeliveryError::Encode {
                message: e.to_string(),
            })?;

            let response = self
                .client
                .post(&self.endpoint)
                .timeout(timeout)
                .header("X-API-Key", &self.api_key)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .map_err(|e| DeliveryError::Network {
                    message: e.to_string(),
                })?;

            check_status(response.status().as_u16())
        }
    }
}
