//! Construction-time configuration.
//!
//! The core never loads configuration files; the embedding application
//! resolves its layout and hands a fully populated [`RuntimeConfig`] to
//! [`crate::Controller::new`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pallium_llm::provider::ChatParams;
use pallium_tools::skills::default_enabled_skills;

use crate::errors::RuntimeError;

/// Model role keys. Every stage runs under one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKey {
    Router,
    Planner,
    Reflect,
    Answer,
}

impl RoleKey {
    /// Wire/config string for this role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Planner => "planner",
            Self::Reflect => "reflect",
            Self::Answer => "answer",
        }
    }
}

/// Model binding for one role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleModel {
    /// Model name as the provider knows it.
    pub model: String,
    /// Sampling parameters for this role.
    #[serde(default)]
    pub params: ChatParams,
}

/// Bounds on loops, deadlines and buffering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Context-builder ↔ memory-retriever round trips per turn.
    pub context_rounds: u32,
    /// Tool-loop rounds per stage invocation.
    pub tool_rounds: u32,
    /// Turn-wide deadline.
    pub turn_deadline_ms: u64,
    /// Default per-tool deadline.
    pub tool_deadline_ms: u64,
    /// Per-subscriber event buffer.
    pub emitter_buffer: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            context_rounds: 3,
            tool_rounds: 8,
            turn_deadline_ms: 120_000,
            tool_deadline_ms: 15_000,
            emitter_buffer: 4_096,
        }
    }
}

/// Everything the core needs, injected at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path of `world_state.json`.
    pub world_state_path: PathBuf,
    /// Path of `chat_history.jsonl`.
    pub chat_history_path: PathBuf,
    /// Optional on-disk cap for the chat log, enforced by copy-compaction.
    #[serde(default)]
    pub chat_history_max_turns: Option<usize>,
    /// Memory tenant. Always explicit configuration, never derived from a
    /// credential.
    pub user_namespace: String,
    /// Model bindings per role; must cover all four [`RoleKey`]s.
    pub role_models: BTreeMap<RoleKey, RoleModel>,
    /// Enabled skill names.
    #[serde(default = "default_enabled_skills")]
    pub enabled_skills: BTreeSet<String>,
    /// Directory of `<stage>.txt` prompt templates.
    pub prompt_dir: PathBuf,
    #[serde(default)]
    pub limits: Limits,
    /// URL of the model server.
    pub provider_endpoint: String,
    /// URL of the memory store; absent makes memory tools no-ops.
    #[serde(default)]
    pub memory_endpoint: Option<String>,
    /// IANA timezone name reported on turns.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

impl RuntimeConfig {
    /// Look up the model for a role.
    pub fn role(&self, key: RoleKey) -> Result<&RoleModel, RuntimeError> {
        self.role_models
            .get(&key)
            .ok_or_else(|| RuntimeError::MissingRole(key.as_str().to_owned()))
    }
}
