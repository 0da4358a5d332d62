//! Realtime Message Types
//!
//! Phoenix channel frames exchanged with the realtime endpoint, and the
//! decoding of `postgres_changes` payloads into [`ChangeEvent`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ChangeEvent, FeedFilter};
use crate::model::Bookmark;

/// One Phoenix channel message (protocol vsn 1.0.0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Join a channel listening for inserts and deletes on `table`
    ///
    /// Only the insert entry carries the owner filter. A delete's old
    /// record holds just the primary key unless the table ships full old
    /// rows, so the server cannot match a filter against it and would drop
    /// every delete. Deletes are checked against the owner client-side.
    pub fn join(
        topic: &str,
        schema: &str,
        table: &str,
        filter: &FeedFilter,
        access_token: &str,
        reference: &str,
    ) -> Self {
        let inserts = serde_json::json!({
            "event": "INSERT",
            "schema": schema,
            "table": table,
            "filter": filter.expression(),
        });
        let deletes = serde_json::json!({
            "event": "DELETE",
            "schema": schema,
            "table": table,
        });

        Self {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: serde_json::json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [inserts, deletes],
                    "private": false
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Hand a refreshed token to an already-joined channel
    pub fn access_token(topic: &str, token: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "access_token".to_string(),
            payload: serde_json::json!({ "access_token": token }),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// For `phx_reply`: whether the referenced push succeeded
    pub fn reply_ok(&self) -> Option<bool> {
        if self.event != "phx_reply" {
            return None;
        }
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "ok")
    }

    /// Decode a `postgres_changes` frame; `None` for every other event
    pub fn change(&self) -> Option<Result<ChangeEvent, String>> {
        if self.event != "postgres_changes" {
            return None;
        }
        let data = self.payload.get("data")?.clone();
        Some(
            serde_json::from_value::<ChangePayload>(data)
                .map_err(|e| e.to_string())
                .and_then(ChangePayload::into_event),
        )
    }
}

/// The `data` object of a `postgres_changes` frame
#[derive(Debug, Clone, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

impl ChangePayload {
    pub fn into_event(self) -> Result<ChangeEvent, String> {
        match self.kind.as_str() {
            "INSERT" => serde_json::from_value::<Bookmark>(self.record)
                .map(ChangeEvent::Insert)
                .map_err(|e| format!("bad inserted row: {}", e)),
            "DELETE" => {
                let id = match self.old_record.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => return Err("delete without old_record.id".to_string()),
                };
                // Only present when the table ships full old rows
                let owner = self
                    .old_record
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ChangeEvent::Delete { id, owner })
            }
            other => Err(format!("unexpected change type {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_shape() {
        let frame = Frame::join(
            "realtime:bookmarks-realtime",
            "public",
            "bookmarks",
            &FeedFilter::owner("u1"),
            "jwt",
            "1",
        );
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["event"], "phx_join");
        assert_eq!(json["ref"], "1");
        assert_eq!(json["join_ref"], "1");
        assert_eq!(json["payload"]["access_token"], "jwt");
        let changes = json["payload"]["config"]["postgres_changes"]
            .as_array()
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["event"], "INSERT");
        assert_eq!(changes[1]["event"], "DELETE");
        assert_eq!(changes[0]["filter"], "user_id=eq.u1");
        assert!(changes[1].get("filter").is_none());
        assert!(changes.iter().all(|c| c["table"] == "bookmarks"));
    }

    #[test]
    fn test_heartbeat_serialization() {
        let json = serde_json::to_string(&Frame::heartbeat("7")).unwrap();
        assert!(json.contains("\"topic\":\"phoenix\""));
        assert!(json.contains("\"event\":\"heartbeat\""));
        assert!(json.contains("\"ref\":\"7\""));
        assert!(!json.contains("join_ref"));
    }

    #[test]
    fn test_reply_status() {
        let frame: Frame = serde_json::from_str(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#,
        )
        .unwrap();
        assert_eq!(frame.reply_ok(), Some(true));
        assert_eq!(frame.reference.as_deref(), Some("2"));

        let frame: Frame = serde_json::from_str(
            r#"{"topic":"x","event":"phx_reply","payload":{"status":"error","response":{"reason":"denied"}},"ref":"1"}"#,
        )
        .unwrap();
        assert_eq!(frame.reply_ok(), Some(false));
    }

    #[test]
    fn test_decode_insert() {
        let frame: Frame = serde_json::from_str(
            r#"{"topic":"realtime:bookmarks-realtime","event":"postgres_changes","ref":null,
                "payload":{"ids":[1],"data":{"type":"INSERT","schema":"public","table":"bookmarks",
                "commit_timestamp":"2024-01-01T00:00:00Z","errors":null,
                "record":{"id":"b1","url":"https://example.com","title":"Example",
                          "created_at":"2024-01-01T00:00:00Z","user_id":"u1"}}}}"#,
        )
        .unwrap();

        match frame.change().unwrap().unwrap() {
            ChangeEvent::Insert(b) => {
                assert_eq!(b.id, "b1");
                assert_eq!(b.user_id, "u1");
            }
            other => panic!("Expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete_with_and_without_owner() {
        let payload = ChangePayload {
            kind: "DELETE".into(),
            table: "bookmarks".into(),
            record: Value::Null,
            old_record: serde_json::json!({"id": "b1"}),
        };
        assert_eq!(
            payload.into_event().unwrap(),
            ChangeEvent::Delete {
                id: "b1".into(),
                owner: None
            }
        );

        let payload = ChangePayload {
            kind: "DELETE".into(),
            table: "bookmarks".into(),
            record: Value::Null,
            old_record: serde_json::json!({"id": 9, "user_id": "u2"}),
        };
        assert_eq!(
            payload.into_event().unwrap(),
            ChangeEvent::Delete {
                id: "9".into(),
                owner: Some("u2".into())
            }
        );
    }

    #[test]
    fn test_non_change_frames_ignored() {
        let frame = Frame::heartbeat("1");
        assert!(frame.change().is_none());
        assert!(frame.reply_ok().is_none());
    }
}
