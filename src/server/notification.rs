//! Change notifications produced by the storage layer.
//!
//! Payload shape on the notification channel:
//!
//! ```json
//! {"table": "events", "action": "INSERT", "data": {...}, "old_data": {...}}
//! ```
//!
//! `old_data` is optional (and usually only present for updates).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PayloadError;

/// Row-level mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// One storage mutation, ready for fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Table the row belongs to.
    pub table: String,
    /// Mutation kind.
    pub action: ChangeAction,
    /// Row after the change (the deleted row for deletes).
    pub data: Map<String, Value>,
    /// Row before the change, when the producer includes it.
    #[serde(rename = "old_data", default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Map<String, Value>>,
}

impl ChangeNotification {
    /// Parses a raw channel payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Malformed`] for invalid JSON, a missing or empty
    /// table, an unknown action, or a non-object `data`.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let change: Self = serde_json::from_str(payload).map_err(|e| PayloadError::Malformed {
            message: e.to_string(),
        })?;
        if change.table.trim().is_empty() {
            return Err(PayloadError::Malformed {
                message: "table must not be empty".to_string(),
            });
        }
        Ok(change)
    }

    /// Convenience constructor.
    #[must_use]
    pub fn new(table: impl Into<String>, action: ChangeAction, data: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            action,
            data,
            previous_data: None,
        }
    }

    /// Top-level field of the new row.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_insert_payload() {
        let change = ChangeNotification::parse(
            r#"{"table":"events","action":"INSERT","data":{"id":1,"organizationId":"42"}}"#,
        )
        .unwrap();
        assert_eq!(change.table, "events");
        assert_eq!(change.action, ChangeAction::Insert);
        assert_eq!(change.field("organizationId"), Some(&json!("42")));
        assert!(change.previous_data.is_none());
    }

    #[test]
    fn parses_old_data_and_null_old_data() {
        let change = ChangeNotification::parse(
            r#"{"table":"profile","action":"UPDATE","data":{"v":2},"old_data":{"v":1}}"#,
        )
        .unwrap();
        assert_eq!(change.previous_data.unwrap()["v"], json!(1));

        let change =
            ChangeNotification::parse(r#"{"table":"profile","action":"DELETE","data":{},"old_data":null}"#)
                .unwrap();
        assert_eq!(change.action, ChangeAction::Delete);
        assert!(change.previous_data.is_none());
    }

    #[test]
    fn rejects_malformed_payloads() {
        for payload in [
            "not json",
            r#"{"table":"events","action":"UPSERT","data":{}}"#,
            r#"{"table":"events","action":"INSERT","data":[1,2]}"#,
            r#"{"action":"INSERT","data":{}}"#,
            r#"{"table":" ","action":"INSERT","data":{}}"#,
        ] {
            assert!(
                matches!(ChangeNotification::parse(payload), Err(PayloadError::Malformed { .. })),
                "payload should be rejected: {payload}"
            );
        }
    }

    #[test]
    fn serializes_with_wire_names() {
        let mut change = ChangeNotification::new("events", ChangeAction::Update, Map::new());
        change.previous_data = Some(Map::new());
        let v = serde_json::to_value(&change).unwrap();
        assert_eq!(v["action"], json!("UPDATE"));
        assert!(v.get("old_data").is_some());
    }
}
