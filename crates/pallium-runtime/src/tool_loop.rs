//! Deterministic streaming tool loop.
//!
//! Wraps one stage's LLM interaction: stream a round, collect the tool calls
//! the model emitted, execute them sequentially in received order under the
//! stage's toolset (the capability firewall), inject each result back as a
//! tool message, and call again — until a round produces no tool calls or
//! the round bound forces a final, tool-free formatting pass.
//!
//! Tool failures of any kind become `{"ok": false, "error": ...}` tool
//! messages; they are never fatal to the stage or the turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::events::EventBody;
use pallium_core::json::{args_digest, canonical_json};
use pallium_core::messages::{Message, TokenUsage, ToolCall};
use pallium_core::state::{EvidenceMeta, EvidencePacket};
use pallium_llm::provider::{ChatProvider, ChatRequest, ResponseFormat, StreamItem};
use pallium_llm::retry::{with_retry, RetryPolicy};
use pallium_tools::skills::ToolSet;
use pallium_tools::traits::ToolResources;

use crate::config::RoleModel;
use crate::emitter::TurnEmitter;
use crate::errors::RuntimeError;

/// Where a stage wants response text deltas forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaMode {
    /// Diagnostic stream (`delta_thinking`).
    Thinking,
    /// The user-visible answer stream (`assistant_delta`).
    Assistant,
}

/// One stage's loop invocation.
pub struct LoopRequest {
    pub stage_id: String,
    pub role: RoleModel,
    pub messages: Vec<Message>,
    pub toolset: Arc<ToolSet>,
    pub response_format: ResponseFormat,
    /// System directive appended for the final formatting pass.
    pub format_directive: Option<String>,
    pub delta_mode: DeltaMode,
}

/// What a loop invocation produced.
#[derive(Debug, Default)]
pub struct LoopOutcome {
    /// Final text (the formatting pass output when one ran).
    pub text: String,
    /// Last reported token usage, if any.
    pub usage: Option<TokenUsage>,
    /// Issues accumulated (forbidden tools, bounded rounds).
    pub issues: Vec<String>,
    /// Evidence packets from successful evidence-producing tool calls,
    /// in execution order.
    pub packets: Vec<EvidencePacket>,
    /// The cancel signal fired mid-stream; `text` holds what was streamed.
    pub cancelled: bool,
}

struct RoundResult {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
    cancelled: bool,
}

/// The loop engine. One per stage invocation.
pub struct ToolLoop<'a> {
    pub provider: Arc<dyn ChatProvider>,
    pub emitter: &'a TurnEmitter,
    pub resources: &'a ToolResources,
    pub cancel: &'a CancellationToken,
    /// Round bound per stage invocation.
    pub tool_rounds: u32,
    /// Default per-tool deadline.
    pub tool_deadline_ms: u64,
    pub retry: RetryPolicy,
}

impl ToolLoop<'_> {
    /// Drive the loop to completion.
    pub async fn run(&self, request: LoopRequest) -> Result<LoopOutcome, RuntimeError> {
        let mut outcome = LoopOutcome::default();

        // No tools: a single pass-through streaming call.
        if request.toolset.is_empty() {
            let round = self
                .stream_round(&request, &request.messages, false, request.response_format.clone())
                .await?;
            outcome.text = round.text;
            outcome.usage = round.usage;
            outcome.cancelled = round.cancelled;
            return Ok(outcome);
        }

        let mut messages = request.messages.clone();
        let mut ran_with_tools = false;

        for round_no in 1..=self.tool_rounds {
            let round = self
                .stream_round(&request, &messages, true, ResponseFormat::None)
                .await?;
            ran_with_tools = true;
            outcome.text.push_str(&round.text);
            if round.usage.is_some() {
                outcome.usage = round.usage;
            }
            if round.cancelled {
                outcome.cancelled = true;
                return Ok(outcome);
            }

            if round.tool_calls.is_empty() {
                if request.response_format.is_some() && ran_with_tools {
                    return self.formatting_pass(&request, messages, outcome).await;
                }
                return Ok(outcome);
            }

            debug!(
                stage_id = %request.stage_id,
                round = round_no,
                calls = round.tool_calls.len(),
                "executing tool calls"
            );
            for call in &round.tool_calls {
                if self.cancel.is_cancelled() {
                    outcome.cancelled = true;
                    return Ok(outcome);
                }
                let message = self
                    .execute_tool(&request.stage_id, &request.toolset, call, &mut outcome)
                    .await;
                messages.push(message);
            }
        }

        // Round bound exceeded: force a formatting pass with tools disabled.
        warn!(stage_id = %request.stage_id, rounds = self.tool_rounds, "tool round bound hit");
        outcome.issues.push("tool_rounds_bounded".to_owned());
        self.formatting_pass(&request, messages, outcome).await
    }

    /// One tool-free call over the accumulated messages; its output replaces
    /// any earlier text.
    async fn formatting_pass(
        &self,
        request: &LoopRequest,
        mut messages: Vec<Message>,
        mut outcome: LoopOutcome,
    ) -> Result<LoopOutcome, RuntimeError> {
        if let Some(directive) = &request.format_directive {
            messages.push(Message::system(directive.clone()));
        }
        let round = self
            .stream_round(request, &messages, false, request.response_format.clone())
            .await?;
        outcome.text = round.text;
        if round.usage.is_some() {
            outcome.usage = round.usage;
        }
        outcome.cancelled = round.cancelled;
        Ok(outcome)
    }

    async fn stream_round(
        &self,
        request: &LoopRequest,
        messages: &[Message],
        tools_enabled: bool,
        response_format: ResponseFormat,
    ) -> Result<RoundResult, RuntimeError> {
        let chat_request = ChatRequest {
            model: request.role.model.clone(),
            messages: messages.to_vec(),
            tools: if tools_enabled && !request.toolset.is_empty() {
                Some(request.toolset.schemas().to_vec())
            } else {
                None
            },
            response_format,
            params: request.role.params.clone(),
        };

        let mut stream = with_retry(&self.retry, || self.provider.stream(&chat_request)).await?;

        let mut result = RoundResult {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            cancelled: false,
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Drop the stream: closes the provider connection.
                    result.cancelled = true;
                    return Ok(result);
                }
                item = stream.next() => match item {
                    None => break,
                    Some(Ok(StreamItem::TextDelta(text))) => {
                        result.text.push_str(&text);
                        match request.delta_mode {
                            DeltaMode::Assistant => {
                                self.emitter.emit(EventBody::AssistantDelta { text });
                            }
                            DeltaMode::Thinking => {
                                self.emitter.emit(EventBody::DeltaThinking { text });
                            }
                        }
                    }
                    Some(Ok(StreamItem::ThinkingDelta(text))) => {
                        self.emitter.emit(EventBody::DeltaThinking { text });
                    }
                    Some(Ok(StreamItem::ToolCall(call))) => {
                        result.tool_calls.push(call);
                    }
                    Some(Ok(StreamItem::Finish { usage, .. })) => {
                        if usage.is_none() {
                            debug!(stage_id = %request.stage_id, "provider reported no usage");
                        }
                        result.usage = usage;
                        break;
                    }
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
        Ok(result)
    }

    /// Execute one tool call and build its tool message. Failures are
    /// converted to error results; nothing here aborts the turn.
    async fn execute_tool(
        &self,
        stage_id: &str,
        toolset: &ToolSet,
        call: &ToolCall,
        outcome: &mut LoopOutcome,
    ) -> Message {
        let start = Instant::now();
        let args = parse_tool_args(&call.arguments_json);
        let digest = match &args {
            Ok(value) => args_digest(value),
            Err(_) => args_digest(&Value::Null),
        };

        self.emitter.emit(EventBody::ToolCall {
            stage_id: stage_id.to_owned(),
            name: call.name.clone(),
            id: call.id.clone(),
            args_digest: digest,
        });

        let result = match &args {
            Err(err) => Err(err.clone()),
            Ok(parsed) => match toolset.get(&call.name) {
                None => {
                    outcome
                        .issues
                        .push(format!("tool_forbidden:{}", call.name));
                    Err(ToolError::new(
                        ToolErrorKind::Forbidden,
                        format!("tool '{}' is not available to this stage", call.name),
                    ))
                }
                Some(tool) => {
                    let deadline = tool.timeout_ms().unwrap_or(self.tool_deadline_ms);
                    tokio::select! {
                        () = self.cancel.cancelled() => Err(ToolError::new(
                            ToolErrorKind::Handler,
                            "cancelled",
                        )),
                        executed = tokio::time::timeout(
                            Duration::from_millis(deadline),
                            tool.execute(parsed, self.resources),
                        ) => match executed {
                            Err(_) => Err(ToolError::new(
                                ToolErrorKind::Timeout,
                                format!("tool exceeded {deadline}ms deadline"),
                            )),
                            Ok(Err(err)) => Err(err),
                            Ok(Ok(value)) => match tool.validate(&value) {
                                Ok(()) => Ok(value),
                                Err(message) => {
                                    Err(ToolError::new(ToolErrorKind::InvalidResult, message))
                                }
                            },
                        },
                    }
                }
            },
        };

        let duration_ms = duration_ms(start.elapsed());
        counter!("tool_calls_total", "tool" => call.name.clone()).increment(1);
        histogram!("tool_call_duration_seconds", "tool" => call.name.clone())
            .record(start.elapsed().as_secs_f64());

        let (ok, content, error) = match &result {
            Ok(value) => {
                if let Ok(parsed_args) = &args {
                    if let Some(packet) =
                        evidence_from_result(&call.name, parsed_args, value, &self.resources.now_iso)
                    {
                        outcome.packets.push(packet);
                    }
                }
                (true, normalize_result(value), None)
            }
            Err(err) => (
                false,
                canonical_json(&err.to_result_value()),
                Some(err.clone()),
            ),
        };

        self.emitter.emit(EventBody::ToolResult {
            stage_id: stage_id.to_owned(),
            name: call.name.clone(),
            id: call.id.clone(),
            ok,
            duration_ms,
            bytes: content.len() as u64,
            error,
        });
        info!(
            stage_id,
            tool = %call.name,
            ok,
            duration_ms,
            "tool executed"
        );

        Message::tool(call.name.clone(), call.id.clone(), content)
    }
}

/// Parse model-emitted argument JSON, guarding against double encoding.
fn parse_tool_args(raw: &str) -> Result<Value, ToolError> {
    let bad = |message: String| ToolError::new(ToolErrorKind::BadArgs, message);

    let text = if raw.trim().is_empty() { "{}" } else { raw };
    let first: Value =
        serde_json::from_str(text).map_err(|e| bad(format!("arguments not valid JSON: {e}")))?;

    // Some providers double-encode: the argument payload arrives as a JSON
    // string containing JSON. Unwrap exactly one level.
    let value = match first {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| bad(format!("double-encoded arguments invalid: {e}")))?,
        other => other,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(bad("arguments must decode to an object".into()))
    }
}

/// Normalise a tool result to the string injected as a tool message.
fn normalize_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

/// Build the canonical evidence packet for evidence-producing tools.
pub fn evidence_from_result(
    tool: &str,
    args: &Value,
    result: &Value,
    now_iso: &str,
) -> Option<EvidencePacket> {
    let (kind, title, items_key) = match tool {
        "chat_history_tail" => ("chat_turns", "Recent chat turns", "turns"),
        "memory_query" => ("memories", "Memory candidates", "items"),
        _ => return None,
    };
    let items = result.get(items_key)?.as_array()?.clone();
    Some(EvidencePacket {
        kind: kind.to_owned(),
        title: Some(title.to_owned()),
        items,
        meta: EvidenceMeta {
            tool: tool.to_owned(),
            ts: now_iso.to_owned(),
            args_digest: args_digest(args),
        },
    })
}

fn duration_ms(elapsed: Duration) -> u64 {
    // Report at least 1ms for any non-zero duration.
    let micros = elapsed.as_micros();
    if micros == 0 {
        0
    } else {
        ((micros + 999) / 1000) as u64
    }
}
