//! Stage implementations.
//!
//! Each stage wraps one LLM call (plus optional mechanical prefill) with
//! stage-specific state mutation. Stages receive the turn state and a
//! [`StageContext`]; they read their declared inputs, write their declared
//! outputs, and leave everything else alone. The executor owns sequencing
//! and node spans.

pub mod answer;
pub mod context_builder;
pub mod memory_retriever;
pub mod memory_writer;
pub mod reflect_topics;
pub mod router;
pub mod world_modifier;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::events::{EventBody, LogLevel};
use pallium_core::json::{args_digest, canonical_json};
use pallium_core::state::{EvidencePacket, TurnState};
use pallium_llm::provider::ChatProvider;
use pallium_llm::retry::RetryPolicy;
use pallium_tools::skills::Toolkit;
use pallium_tools::traits::ToolResources;

use crate::config::{RoleKey, RoleModel, RuntimeConfig};
use crate::emitter::TurnEmitter;
use crate::errors::RuntimeError;
use crate::prompt::PromptRenderer;
use crate::tool_loop::ToolLoop;

/// Stage IDs, which double as prompt template names.
pub mod ids {
    pub const ROUTER: &str = "router";
    pub const CONTEXT_BUILDER: &str = "context_builder";
    pub const MEMORY_RETRIEVER: &str = "memory_retriever";
    pub const WORLD_MODIFIER: &str = "world_modifier";
    pub const ANSWER: &str = "answer";
    pub const REFLECT_TOPICS: &str = "reflect_topics";
    pub const MEMORY_WRITER: &str = "memory_writer";
}

/// Per-turn capabilities handed to every stage. The emitter lives here, not
/// in the turn state, so the state stays serializable.
pub struct StageContext {
    pub provider: Arc<dyn ChatProvider>,
    pub toolkit: Arc<Toolkit>,
    pub resources: ToolResources,
    pub prompts: PromptRenderer,
    pub emitter: Arc<TurnEmitter>,
    pub config: Arc<RuntimeConfig>,
    pub cancel: CancellationToken,
}

impl StageContext {
    /// The tool loop engine for this turn.
    #[must_use]
    pub fn tool_loop(&self) -> ToolLoop<'_> {
        ToolLoop {
            provider: Arc::clone(&self.provider),
            emitter: &self.emitter,
            resources: &self.resources,
            cancel: &self.cancel,
            tool_rounds: self.config.limits.tool_rounds,
            tool_deadline_ms: self.config.limits.tool_deadline_ms,
            retry: RetryPolicy::default(),
        }
    }

    /// Model binding for a role.
    pub fn role(&self, key: RoleKey) -> Result<RoleModel, RuntimeError> {
        self.config.role(key).cloned()
    }
}

/// One step in the fixed graph.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage ID (also the prompt template name).
    fn id(&self) -> &'static str;

    /// Role key selecting the model binding.
    fn role_key(&self) -> RoleKey;

    /// Run the stage against the turn state.
    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError>;
}

/// All stages, keyed by ID.
#[must_use]
pub fn stage_registry() -> HashMap<&'static str, Arc<dyn Stage>> {
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(router::Router),
        Arc::new(context_builder::ContextBuilder),
        Arc::new(memory_retriever::MemoryRetriever),
        Arc::new(world_modifier::WorldModifier),
        Arc::new(answer::Answer),
        Arc::new(reflect_topics::ReflectTopics),
        Arc::new(memory_writer::MemoryWriter),
    ];
    stages.into_iter().map(|s| (s.id(), s)).collect()
}

/// Execute a deterministic set of tool calls before a stage's LLM call,
/// without any model involvement. Failures are logged and skipped; prefill
/// never fails the stage.
pub(crate) async fn run_mechanical_calls(
    ctx: &StageContext,
    stage_id: &str,
    calls: &[(&str, Value)],
) -> Vec<EvidencePacket> {
    let toolset = ctx.toolkit.toolset_for_stage(stage_id);
    let mut packets = Vec::new();

    for (index, (name, args)) in calls.iter().enumerate() {
        let call_id = format!("prefill_{}", index + 1);
        ctx.emitter.emit(EventBody::ToolCall {
            stage_id: stage_id.to_owned(),
            name: (*name).to_owned(),
            id: call_id.clone(),
            args_digest: args_digest(args),
        });

        let start = Instant::now();
        let result: Result<Value, ToolError> = match toolset.get(name) {
            None => Err(ToolError::new(
                ToolErrorKind::Forbidden,
                format!("tool '{name}' is not available to this stage"),
            )),
            Some(tool) => {
                let deadline = tool.timeout_ms().unwrap_or(ctx.config.limits.tool_deadline_ms);
                match tokio::time::timeout(
                    Duration::from_millis(deadline),
                    tool.execute(args, &ctx.resources),
                )
                .await
                {
                    Err(_) => Err(ToolError::new(
                        ToolErrorKind::Timeout,
                        format!("tool exceeded {deadline}ms deadline"),
                    )),
                    Ok(inner) => inner,
                }
            }
        };

        let elapsed = start.elapsed().as_millis() as u64;
        match &result {
            Ok(value) => {
                let content = canonical_json(value);
                ctx.emitter.emit(EventBody::ToolResult {
                    stage_id: stage_id.to_owned(),
                    name: (*name).to_owned(),
                    id: call_id,
                    ok: true,
                    duration_ms: elapsed,
                    bytes: content.len() as u64,
                    error: None,
                });
                if let Some(packet) = crate::tool_loop::evidence_from_result(
                    name,
                    args,
                    value,
                    &ctx.resources.now_iso,
                ) {
                    packets.push(packet);
                }
            }
            Err(err) => {
                ctx.emitter.emit(EventBody::ToolResult {
                    stage_id: stage_id.to_owned(),
                    name: (*name).to_owned(),
                    id: call_id,
                    ok: false,
                    duration_ms: elapsed,
                    bytes: 0,
                    error: Some(err.clone()),
                });
                ctx.emitter.log(
                    LogLevel::Warning,
                    stage_id,
                    format!("prefill {name} failed: {err}"),
                );
                debug!(stage_id, tool = name, error = %err, "prefill call failed");
            }
        }
    }
    packets
}

/// Canonical JSON of any serializable value, for prompt tokens.
pub(crate) fn token_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .map(|v| canonical_json(&v))
        .unwrap_or_else(|_| "null".to_owned())
}
