//! Shared error kinds for tool execution.
//!
//! Tool failures are never fatal to a turn: the tool loop converts every
//! failure into a result-shaped JSON object (`{"ok": false, "error": ...}`)
//! that is injected back into the model context as a tool message. The kinds
//! here are the closed set of failure classes that object may carry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Failure class of a tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments were not a JSON object after decoding.
    BadArgs,
    /// Tool name is not in the stage's toolset.
    Forbidden,
    /// Handler exceeded its deadline.
    Timeout,
    /// Handler returned an error.
    Handler,
    /// Result failed the tool's validator.
    InvalidResult,
    /// A world mutation targeted a path outside the whitelist.
    ForbiddenPath,
}

impl ToolErrorKind {
    /// Wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadArgs => "bad_args",
            Self::Forbidden => "forbidden",
            Self::Timeout => "timeout",
            Self::Handler => "handler",
            Self::InvalidResult => "invalid_result",
            Self::ForbiddenPath => "forbidden_path",
        }
    }
}

/// A tool failure as carried in tool messages and `tool_result` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    /// Failure class.
    pub kind: ToolErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ToolError {
    /// Build an error of the given kind.
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The result-shaped JSON object injected as a tool message.
    #[must_use]
    pub fn to_result_value(&self) -> Value {
        json!({
            "ok": false,
            "error": { "kind": self.kind.as_str(), "message": self.message },
        })
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ToolError {}
