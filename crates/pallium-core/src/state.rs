//! Per-turn state threaded through the stage graph.
//!
//! [`TurnState`] is exclusively owned by the executor for the duration of a
//! turn. Stages receive a mutable reference, mutate their declared output
//! fields, and return; nothing retains it afterwards. The emitter is *not*
//! part of the state — it is a per-turn capability passed to stages
//! explicitly — so the whole record stays serializable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::world::WorldState;

/// Routing decision produced by the router stage.
pub mod route {
    pub const CONTEXT: &str = "context";
    pub const WORLD: &str = "world";
    pub const ANSWER: &str = "answer";
}

/// The user's request and how it was routed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Immutable after turn creation.
    pub user_text: String,
    /// Assigned by the router; defaults to `"en"`.
    pub language: String,
    /// Assigned by the router; one of [`route`]'s constants.
    pub route: String,
}

/// Canonical container of tool-retrieved evidence in `context.sources`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidencePacket {
    /// Source kind, e.g. `"chat_turns"`, `"memories"`, `"doc"`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Retrieved records.
    pub items: Vec<Value>,
    pub meta: EvidenceMeta,
}

/// Provenance of an evidence packet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMeta {
    /// Tool that produced the packet.
    pub tool: String,
    /// ISO-8601 retrieval timestamp.
    pub ts: String,
    /// Digest of the canonical argument JSON.
    pub args_digest: String,
}

/// Evidence accumulator. One canonical shape — there is no nested
/// `context.context` alias anywhere in this codebase.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    /// Append-only within a turn.
    pub sources: Vec<EvidencePacket>,
    /// Set by the context builder when it considers context sufficient.
    pub complete: bool,
    /// Human-readable notes accumulated by any stage.
    pub issues: Vec<String>,
    /// Next hop requested by the context builder
    /// (`"memory_retriever"` or `"answer"`).
    pub next: String,
    /// Optional request handed to the memory retriever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<Value>,
}

/// Final output of the turn, written only by the answer stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalState {
    pub answer: String,
}

/// Per-turn runtime metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMeta {
    pub turn_id: String,
    pub now_iso: String,
    pub timezone: String,
    /// Free-form status line set by stages.
    pub status: String,
    /// Turn-level issues (bounded loops, stage errors, ...).
    pub issues: Vec<String>,
    /// Grows strictly by append: `"<stage>:entered"` / `"<stage>:committed"`.
    pub node_trace: Vec<String>,
}

impl RuntimeMeta {
    /// Record that a stage was entered.
    pub fn trace_entered(&mut self, stage_id: &str) {
        self.node_trace.push(format!("{stage_id}:entered"));
    }

    /// Record that a stage committed.
    pub fn trace_committed(&mut self, stage_id: &str) {
        self.node_trace.push(format!("{stage_id}:committed"));
    }
}

/// The per-turn record passed by reference through all stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub task: TaskState,
    pub context: ContextState,
    #[serde(rename = "final")]
    pub final_: FinalState,
    /// Snapshot of the durable world loaded at turn start; mutated only via
    /// world-tool results; committed by the controller at turn end.
    pub world: WorldState,
    pub runtime: RuntimeMeta,
}

impl TurnState {
    /// Build the state for a new turn.
    #[must_use]
    pub fn new(
        user_text: impl Into<String>,
        turn_id: impl Into<String>,
        now_iso: impl Into<String>,
        timezone: impl Into<String>,
        world: WorldState,
    ) -> Self {
        Self {
            task: TaskState {
                user_text: user_text.into(),
                language: "en".into(),
                route: String::new(),
            },
            context: ContextState::default(),
            final_: FinalState::default(),
            world,
            runtime: RuntimeMeta {
                turn_id: turn_id.into(),
                now_iso: now_iso.into(),
                timezone: timezone.into(),
                ..RuntimeMeta::default()
            },
        }
    }

    /// Append a turn-level issue.
    pub fn push_issue(&mut self, issue: impl Into<String>) {
        self.runtime.issues.push(issue.into());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat history
// ─────────────────────────────────────────────────────────────────────────────

/// Speaker of a chat turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Human,
    Assistant,
}

impl ChatRole {
    /// Wire string for this role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Assistant => "assistant",
        }
    }
}

/// One line in the append-only chat history log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// ISO-8601 UTC timestamp.
    pub ts: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}
