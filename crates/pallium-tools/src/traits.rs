//! The tool trait and the resources bundle handlers execute against.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use pallium_core::errors::ToolError;
use pallium_core::messages::ToolSchema;
use pallium_core::world::WorldState;
use pallium_store::chat_log::ChatLog;
use pallium_store::memory::MemoryClient;

/// Concrete resources tool handlers close over.
///
/// Runtime-only and never serialized. The world cell is this turn's working
/// copy: `world_apply_ops` mutates it, and the world-modifier stage copies
/// it back into the turn state when the stage commits. Durable storage is
/// untouched until the controller commits at turn end.
#[derive(Clone)]
pub struct ToolResources {
    /// Read-only view of the chat history log.
    pub chat_log: Arc<ChatLog>,
    /// Remote memory client (may be disabled).
    pub memory: MemoryClient,
    /// Working copy of this turn's world.
    pub world: Arc<Mutex<WorldState>>,
    /// Turn timestamp, ISO-8601.
    pub now_iso: String,
    /// Turn timezone name.
    pub tz: String,
}

impl ToolResources {
    /// Snapshot the working-copy world.
    #[must_use]
    pub fn world_snapshot(&self) -> WorldState {
        self.world.lock().clone()
    }
}

/// A named capability with a JSON-shaped argument schema and a deterministic
/// host-side handler.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name — the exact string sent to and received from the model.
    fn name(&self) -> &str;

    /// Schema sent to the provider.
    fn definition(&self) -> ToolSchema;

    /// Per-tool deadline override in milliseconds. `None` uses the
    /// configured default.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Execute with parsed arguments. `args` is always a JSON object by the
    /// time it reaches a handler; the tool loop enforces that.
    async fn execute(&self, args: &Value, resources: &ToolResources) -> Result<Value, ToolError>;

    /// Validate a successful result before it is injected into the model
    /// context. The default accepts everything.
    fn validate(&self, result: &Value) -> Result<(), String> {
        let _ = result;
        Ok(())
    }
}
