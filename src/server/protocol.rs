//! Observer wire protocol.
//!
//! Client → server:
//! - `{"type":"subscribe","tables":["events"],"filters":{"organizationId":"42"}}`
//! - `{"type":"unsubscribe"}`
//! - `{"type":"ping"}`
//!
//! Server → client:
//! - `{"type":"subscribed","tables":["events"]}`
//! - `{"type":"events","table":...,"action":...,"data":{...},"old_data":{...}}`
//! - `{"type":"error","message":"..."}`
//! - `{"type":"pong"}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::notification::ChangeNotification;
use super::registry::Interest;

/// Messages sent by observers.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tables: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<Map<String, Value>>,
    },
    Unsubscribe,
    Ping,
}

impl ClientMessage {
    /// Interest described by a subscribe message.
    #[must_use]
    pub fn interest(&self) -> Option<Interest> {
        match self {
            Self::Subscribe { tables, filters } => Some(Interest {
                tables: tables.as_ref().map(|t| t.iter().cloned().collect()),
                filters: filters.clone(),
            }),
            Self::Unsubscribe | Self::Ping => None,
        }
    }
}

/// Messages sent to observers.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        tables: Vec<String>,
    },
    Events {
        #[serde(flatten)]
        change: ChangeNotification,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Acknowledgement echoing the requested tables (empty when unrestricted).
    #[must_use]
    pub fn subscribed(interest: &Interest) -> Self {
        let mut tables: Vec<String> = interest
            .tables
            .as_ref()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        Self::Subscribed { tables }
    }

    /// Encodes the message as JSON text.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; only possible for non-finite floats
    /// smuggled into a `Value`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encodes an `events` frame without taking ownership of the change.
    ///
    /// # Errors
    ///
    /// Same as [`ServerMessage::encode`].
    pub fn encode_events(change: &ChangeNotification) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct EventsFrame<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            #[serde(flatten)]
            change: &'a ChangeNotification,
        }

        serde_json::to_string(&EventsFrame {
            kind: "events",
            change,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::server::notification::ChangeAction;

    #[test]
    fn decodes_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","tables":["events"],"filters":{"organizationId":"42"}}"#,
        )
        .unwrap();
        let interest = msg.interest().unwrap();
        assert!(interest.tables.unwrap().contains("events"));
        assert_eq!(interest.filters.unwrap()["organizationId"], json!("42"));
    }

    #[test]
    fn decodes_bare_subscribe_as_unrestricted() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        let interest = msg.interest().unwrap();
        assert!(interest.tables.is_none());
        assert!(interest.filters.is_none());
    }

    #[test]
    fn encodes_events_flat_with_type_tag() {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(7));
        let msg = ServerMessage::Events {
            change: ChangeNotification::new("events", ChangeAction::Insert, data),
        };
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["type"], json!("events"));
        assert_eq!(v["table"], json!("events"));
        assert_eq!(v["action"], json!("INSERT"));
        assert_eq!(v["data"]["id"], json!(7));
    }

    #[test]
    fn borrowed_events_frame_matches_owned_encoding() {
        let mut data = Map::new();
        data.insert("organizationId".to_string(), json!("42"));
        let change = ChangeNotification::new("profile", ChangeAction::Update, data);
        let borrowed: Value = serde_json::from_str(&ServerMessage::encode_events(&change).unwrap()).unwrap();
        let owned: Value =
            serde_json::from_str(&ServerMessage::Events { change }.encode().unwrap()).unwrap();
        assert_eq!(borrowed, owned);
    }

    #[test]
    fn encodes_ack_with_sorted_tables() {
        let interest = Interest::tables(["profile", "events"]);
        let v = serde_json::to_value(ServerMessage::subscribed(&interest)).unwrap();
        assert_eq!(v, json!({"type": "subscribed", "tables": ["events", "profile"]}));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"publish"}"#).is_err());
    }
}
