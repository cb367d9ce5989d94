//! Typed events from the worker's streaming output protocol.
//!
//! The worker emits newline-delimited JSON records, each carrying a `type`
//! discriminator. Known types map to [`WorkerEventKind`] variants; anything
//! else is preserved as `Unknown` so new protocol versions degrade gracefully
//! instead of being dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The event type vocabulary of the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    TurnStarted,
    TurnCompleted,
    TurnFailed,
    ItemStarted,
    ItemCompleted,
    ItemUpdated,
    /// Forward-compatibility: an event with a type tag we don't know yet.
    Unknown(String),
}

impl WorkerEventKind {
    /// Map a wire `type` tag to an event kind.
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "turn.started" => Self::TurnStarted,
            "turn.completed" => Self::TurnCompleted,
            "turn.failed" => Self::TurnFailed,
            "item.started" => Self::ItemStarted,
            "item.completed" => Self::ItemCompleted,
            "item.updated" => Self::ItemUpdated,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The wire `type` tag for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TurnStarted => "turn.started",
            Self::TurnCompleted => "turn.completed",
            Self::TurnFailed => "turn.failed",
            Self::ItemStarted => "item.started",
            Self::ItemCompleted => "item.completed",
            Self::ItemUpdated => "item.updated",
            Self::Unknown(tag) => tag,
        }
    }

    /// Whether this is one of the three `turn.*` events.
    pub fn is_turn(&self) -> bool {
        matches!(
            self,
            Self::TurnStarted | Self::TurnCompleted | Self::TurnFailed
        )
    }

    /// Whether this is one of the three `item.*` events.
    pub fn is_item(&self) -> bool {
        matches!(
            self,
            Self::ItemStarted | Self::ItemCompleted | Self::ItemUpdated
        )
    }
}

/// One raw protocol record as it appears on the wire.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "turnId", alias = "turn_id")]
    turn_id: Option<String>,
    #[serde(rename = "itemId", alias = "item_id")]
    item_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// A single typed event from the worker stream.
///
/// Immutable once parsed; consumed append-only by the progress tracker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEvent {
    #[serde(rename = "type", serialize_with = "serialize_kind")]
    pub kind: WorkerEventKind,
    #[serde(rename = "turnId", skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(rename = "itemId", skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub data: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

fn serialize_kind<S: serde::Serializer>(
    kind: &WorkerEventKind,
    ser: S,
) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(kind.as_str())
}

impl WorkerEvent {
    /// Parse one line of worker output into an event.
    ///
    /// Returns `None` when the line is not a JSON object with a string
    /// `type` field — the caller treats such lines as diagnostic noise.
    pub fn parse_line(line: &str) -> Option<Self> {
        let raw: RawRecord = serde_json::from_str(line).ok()?;
        Some(Self {
            kind: WorkerEventKind::from_type_tag(&raw.kind),
            turn_id: raw.turn_id,
            item_id: raw.item_id,
            data: raw.data,
            received_at: Utc::now(),
        })
    }

    /// Decode the item payload, if this event carries one.
    pub fn item_payload(&self) -> Option<ItemPayload> {
        if !self.kind.is_item() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Extract an error message from a `turn.failed` payload.
    pub fn error_message(&self) -> Option<String> {
        let data = &self.data;
        data.get("error")
            .and_then(|e| {
                e.as_str()
                    .map(String::from)
                    .or_else(|| e.get("message").and_then(|m| m.as_str()).map(String::from))
            })
            .or_else(|| {
                data.get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
    }
}

/// The kind of work an item represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    FileChange,
    CommandExecution,
    AgentMessage,
    Other(String),
}

impl ItemKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "file_change" => Self::FileChange,
            "command_execution" => Self::CommandExecution,
            "agent_message" => Self::AgentMessage,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this item kind counts as observable work.
    pub fn is_observable_work(&self) -> bool {
        matches!(
            self,
            Self::FileChange | Self::CommandExecution | Self::AgentMessage
        )
    }
}

/// Loosely-typed item payload. Fields are optional because the worker only
/// populates the ones relevant to the item kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemPayload {
    #[serde(alias = "type")]
    pub kind: Option<String>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub text: Option<String>,
    pub description: Option<String>,
}

impl ItemPayload {
    /// The typed item kind, if the payload declared one.
    pub fn item_kind(&self) -> Option<ItemKind> {
        self.kind.as_deref().map(ItemKind::from_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_event() {
        let ev = WorkerEvent::parse_line(r#"{"type":"turn.started","turnId":"t1"}"#).unwrap();
        assert_eq!(ev.kind, WorkerEventKind::TurnStarted);
        assert_eq!(ev.turn_id.as_deref(), Some("t1"));
        assert!(ev.item_id.is_none());
    }

    #[test]
    fn parse_unknown_tag_is_preserved() {
        let ev = WorkerEvent::parse_line(r#"{"type":"session.configured","data":{}}"#).unwrap();
        assert_eq!(
            ev.kind,
            WorkerEventKind::Unknown("session.configured".to_string())
        );
        assert_eq!(ev.kind.as_str(), "session.configured");
    }

    #[test]
    fn parse_non_json_is_none() {
        assert!(WorkerEvent::parse_line("reading config...").is_none());
        assert!(WorkerEvent::parse_line("{broken json").is_none());
    }

    #[test]
    fn item_payload_kinds() {
        let ev = WorkerEvent::parse_line(
            r#"{"type":"item.completed","itemId":"i1","data":{"kind":"file_change","path":"src/main.rs"}}"#,
        )
        .unwrap();
        let payload = ev.item_payload().unwrap();
        assert_eq!(payload.item_kind(), Some(ItemKind::FileChange));
        assert_eq!(payload.path.as_deref(), Some("src/main.rs"));
        assert!(ItemKind::FileChange.is_observable_work());
        assert!(!ItemKind::Other("reasoning".into()).is_observable_work());
    }

    #[test]
    fn item_payload_accepts_type_alias() {
        let ev = WorkerEvent::parse_line(
            r#"{"type":"item.started","itemId":"i2","data":{"type":"command_execution","command":"cargo test"}}"#,
        )
        .unwrap();
        let payload = ev.item_payload().unwrap();
        assert_eq!(payload.item_kind(), Some(ItemKind::CommandExecution));
    }

    #[test]
    fn error_message_shapes() {
        let flat = WorkerEvent::parse_line(
            r#"{"type":"turn.failed","turnId":"t1","data":{"error":"model overloaded"}}"#,
        )
        .unwrap();
        assert_eq!(flat.error_message().as_deref(), Some("model overloaded"));

        let nested = WorkerEvent::parse_line(
            r#"{"type":"turn.failed","turnId":"t1","data":{"error":{"message":"bad request"}}}"#,
        )
        .unwrap();
        assert_eq!(nested.error_message().as_deref(), Some("bad request"));
    }
}
