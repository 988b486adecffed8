//! The `turn.v1` event protocol.
//!
//! Every turn streams an ordered sequence of [`TurnEvent`]s to its consumer
//! (UI, logger). The wire envelope is
//! `{protocol, seq, turn_id, type, ts, payload}`; `seq` starts at 1 and is
//! monotonic per turn.
//!
//! Events are classed as *essential* (lifecycle, tool trace, commit
//! records — never dropped) or *non-essential* (token deltas, log lines —
//! droppable under subscriber backpressure).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ToolError;
use crate::world::WorldDiff;

/// Protocol identifier carried by every event.
pub const PROTOCOL: &str = "turn.v1";

/// Structured log level for `log` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Terminal failure reason for `turn_end_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorReason {
    Cancelled,
    Deadline,
    Transport,
    Internal,
}

/// Summary payload of `turn_end_ok`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    /// Stage IDs in visit order.
    pub nodes_visited: Vec<String>,
    /// Wall-clock duration of the turn.
    pub duration_ms: u64,
}

/// Typed event body. Serializes adjacently tagged so the wire shape is
/// `"type": "...", "payload": {...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    TurnStart {
        user_text: String,
        now_iso: String,
        timezone: String,
    },
    TurnEndOk {
        summary: TurnSummary,
    },
    TurnEndError {
        reason: TurnErrorReason,
        message: String,
    },
    NodeStart {
        stage_id: String,
        role_key: String,
    },
    NodeEnd {
        stage_id: String,
        ok: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        issues: Vec<String>,
    },
    AssistantStreamStart {},
    AssistantDelta {
        text: String,
    },
    AssistantStreamEnd {
        text_total: String,
    },
    DeltaThinking {
        text: String,
    },
    Log {
        level: LogLevel,
        source: String,
        message: String,
    },
    ToolCall {
        stage_id: String,
        name: String,
        id: String,
        args_digest: String,
    },
    ToolResult {
        stage_id: String,
        name: String,
        id: String,
        ok: bool,
        duration_ms: u64,
        bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolError>,
    },
    WorldCommit {
        diff: WorldDiff,
    },
    Overflow {
        dropped: u64,
    },
}

impl EventBody {
    /// Wire type string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::TurnEndOk { .. } => "turn_end_ok",
            Self::TurnEndError { .. } => "turn_end_error",
            Self::NodeStart { .. } => "node_start",
            Self::NodeEnd { .. } => "node_end",
            Self::AssistantStreamStart {} => "assistant_stream_start",
            Self::AssistantDelta { .. } => "assistant_delta",
            Self::AssistantStreamEnd { .. } => "assistant_stream_end",
            Self::DeltaThinking { .. } => "delta_thinking",
            Self::Log { .. } => "log",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::WorldCommit { .. } => "world_commit",
            Self::Overflow { .. } => "overflow",
        }
    }

    /// Whether this event may be dropped under subscriber backpressure.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::AssistantDelta { .. } | Self::DeltaThinking { .. } | Self::Log { .. }
        )
    }

    /// Whether this event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnEndOk { .. } | Self::TurnEndError { .. })
    }
}

/// One event on the turn stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    /// Always [`PROTOCOL`].
    pub protocol: String,
    /// Monotonic per-turn sequence number, starting at 1.
    pub seq: u64,
    /// Turn this event belongs to.
    pub turn_id: String,
    /// ISO-8601 emission timestamp.
    pub ts: String,
    #[serde(flatten)]
    pub body: EventBody,
}

impl TurnEvent {
    /// Build an event stamped with the current UTC time.
    #[must_use]
    pub fn now(seq: u64, turn_id: impl Into<String>, body: EventBody) -> Self {
        Self {
            protocol: PROTOCOL.to_owned(),
            seq,
            turn_id: turn_id.into(),
            ts: chrono::Utc::now().to_rfc3339(),
            body,
        }
    }

    /// Wire type string of the body.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Payload as a JSON value (for consumers that want the raw object).
    #[must_use]
    pub fn payload(&self) -> Value {
        serde_json::to_value(&self.body)
            .ok()
            .and_then(|v| v.get("payload").cloned())
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;

    #[test]
    fn wire_shape_has_type_and_payload() {
        let ev = TurnEvent::now(
            1,
            "turn_1",
            EventBody::TurnStart {
                user_text: "hi".into(),
                now_iso: "2026-01-01T00:00:00Z".into(),
                timezone: "UTC".into(),
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["protocol"], "turn.v1");
        assert_eq!(v["seq"], 1);
        assert_eq!(v["turn_id"], "turn_1");
        assert_eq!(v["type"], "turn_start");
        assert_eq!(v["payload"]["user_text"], "hi");
    }

    #[test]
    fn round_trip_preserves_body() {
        let ev = TurnEvent::now(
            7,
            "turn_1",
            EventBody::ToolResult {
                stage_id: "context_builder".into(),
                name: "memory_query".into(),
                id: "tc_1".into(),
                ok: false,
                duration_ms: 12,
                bytes: 64,
                error: Some(ToolError::new(ToolErrorKind::Timeout, "deadline")),
            },
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: TurnEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn kind_strings_match_taxonomy() {
        assert_eq!(EventBody::AssistantStreamStart {}.kind(), "assistant_stream_start");
        assert_eq!(EventBody::Overflow { dropped: 3 }.kind(), "overflow");
        assert_eq!(
            EventBody::TurnEndError {
                reason: TurnErrorReason::Cancelled,
                message: String::new(),
            }
            .kind(),
            "turn_end_error"
        );
    }

    #[test]
    fn droppable_classification() {
        assert!(EventBody::DeltaThinking { text: "x".into() }.is_droppable());
        assert!(EventBody::AssistantDelta { text: "x".into() }.is_droppable());
        assert!(EventBody::Log {
            level: LogLevel::Info,
            source: "graph".into(),
            message: "m".into(),
        }
        .is_droppable());
        assert!(!EventBody::AssistantStreamStart {}.is_droppable());
        assert!(!EventBody::Overflow { dropped: 1 }.is_droppable());
        assert!(!EventBody::WorldCommit {
            diff: WorldDiff::default()
        }
        .is_droppable());
    }

    #[test]
    fn terminal_classification() {
        assert!(EventBody::TurnEndOk {
            summary: TurnSummary::default()
        }
        .is_terminal());
        assert!(!EventBody::NodeStart {
            stage_id: "router".into(),
            role_key: "router".into(),
        }
        .is_terminal());
    }

    #[test]
    fn error_reason_serializes_snake_case() {
        let v = serde_json::to_value(TurnErrorReason::Deadline).unwrap();
        assert_eq!(v, "deadline");
    }

    #[test]
    fn payload_accessor_returns_object() {
        let ev = TurnEvent::now(2, "turn_1", EventBody::Overflow { dropped: 9 });
        assert_eq!(ev.payload()["dropped"], 9);
    }

    #[test]
    fn node_end_omits_empty_issues() {
        let ev = TurnEvent::now(
            3,
            "turn_1",
            EventBody::NodeEnd {
                stage_id: "answer".into(),
                ok: true,
                duration_ms: 5,
                issues: vec![],
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v["payload"].get("issues").is_none());
    }
}
