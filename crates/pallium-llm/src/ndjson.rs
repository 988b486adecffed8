//! NDJSON-over-HTTP provider transport.
//!
//! Speaks the newline-delimited JSON chat protocol of a local model server
//! (Ollama-compatible `/api/chat`). Each response line carries a message
//! fragment; the final line has `"done": true` with a stop reason and token
//! counts.

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use async_trait::async_trait;

use pallium_core::messages::{Role, TokenUsage, ToolCall};

use crate::provider::{
    ChatProvider, ChatRequest, ChatStream, FinishReason, ProviderError, ProviderResult,
    ResponseFormat, StreamItem,
};

/// Provider for an NDJSON chat endpoint.
pub struct NdjsonProvider {
    client: reqwest::Client,
    base_url: String,
}

impl NdjsonProvider {
    /// Create a provider for the server at `base_url`
    /// (e.g. `http://127.0.0.1:11434`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl ChatProvider for NdjsonProvider {
    fn name(&self) -> &str {
        "ndjson"
    }

    async fn stream(&self, request: &ChatRequest) -> ProviderResult<ChatStream> {
        let body = build_request_body(request);
        debug!(model = %request.model, url = %self.chat_url(), "opening chat stream");

        let response = self.client.post(self.chat_url()).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let byte_stream = Box::pin(response.bytes_stream());
        let state = LineDecoder::default();

        let stream = futures::stream::unfold(
            (byte_stream, state),
            |(mut bytes, mut decoder)| async move {
                loop {
                    if let Some(item) = decoder.pending.pop() {
                        return Some((Ok(item), (bytes, decoder)));
                    }
                    if decoder.finished {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            decoder.buffer.push_str(&String::from_utf8_lossy(&chunk));
                            if let Err(err) = decoder.drain_lines() {
                                decoder.finished = true;
                                return Some((Err(err), (bytes, decoder)));
                            }
                        }
                        Some(Err(err)) => {
                            decoder.finished = true;
                            return Some((Err(ProviderError::Http(err)), (bytes, decoder)));
                        }
                        None => {
                            decoder.finished = true;
                            // Server closed the connection without a done line.
                            return Some((
                                Err(ProviderError::ConnectionReset {
                                    message: "stream ended before done marker".into(),
                                }),
                                (bytes, decoder),
                            ));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Build the NDJSON request body from a [`ChatRequest`].
fn build_request_body(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let mut obj = Map::new();
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let _ = obj.insert("role".into(), json!(role));
            let _ = obj.insert("content".into(), json!(m.content));
            if let Some(name) = &m.name {
                let _ = obj.insert("tool_name".into(), json!(name));
            }
            Value::Object(obj)
        })
        .collect();

    let mut body = Map::new();
    let _ = body.insert("model".into(), json!(request.model));
    let _ = body.insert("messages".into(), Value::Array(messages));
    let _ = body.insert("stream".into(), json!(true));

    if let Some(tools) = &request.tools {
        let tool_values: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
        let _ = body.insert("tools".into(), Value::Array(tool_values));
    }

    match &request.response_format {
        ResponseFormat::None => {}
        ResponseFormat::JsonObject => {
            let _ = body.insert("format".into(), json!("json"));
        }
        ResponseFormat::Schema(schema) => {
            let _ = body.insert("format".into(), schema.clone());
        }
    }

    let mut options = Map::new();
    let p = &request.params;
    if let Some(v) = p.temperature {
        let _ = options.insert("temperature".into(), json!(v));
    }
    if let Some(v) = p.top_p {
        let _ = options.insert("top_p".into(), json!(v));
    }
    if let Some(v) = p.top_k {
        let _ = options.insert("top_k".into(), json!(v));
    }
    if let Some(v) = p.seed {
        let _ = options.insert("seed".into(), json!(v));
    }
    if let Some(v) = p.num_ctx {
        let _ = options.insert("num_ctx".into(), json!(v));
    }
    if let Some(v) = p.max_tokens {
        let _ = options.insert("num_predict".into(), json!(v));
    }
    if let Some(v) = &p.stop {
        let _ = options.insert("stop".into(), json!(v));
    }
    if !options.is_empty() {
        let _ = body.insert("options".into(), Value::Object(options));
    }

    Value::Object(body)
}

/// Incremental NDJSON line decoder.
#[derive(Default)]
struct LineDecoder {
    buffer: String,
    /// Items decoded but not yet yielded, in reverse yield order.
    pending: Vec<StreamItem>,
    saw_tool_calls: bool,
    next_call_index: u32,
    finished: bool,
}

impl LineDecoder {
    /// Decode every complete line currently in the buffer.
    fn drain_lines(&mut self) -> ProviderResult<()> {
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut items = decode_line(line, &mut self.saw_tool_calls, &mut self.next_call_index)?;
            if items
                .iter()
                .any(|i| matches!(i, StreamItem::Finish { .. }))
            {
                self.finished = true;
            }
            // `pending` pops from the back, so store reversed.
            items.reverse();
            let mut tail = std::mem::take(&mut self.pending);
            self.pending = items;
            self.pending.append(&mut tail);
        }
        Ok(())
    }
}

/// Decode one NDJSON line into stream items.
fn decode_line(
    line: &str,
    saw_tool_calls: &mut bool,
    next_call_index: &mut u32,
) -> ProviderResult<Vec<StreamItem>> {
    let value: Value = serde_json::from_str(line)?;

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ProviderError::Api {
            status: 200,
            message: error.to_owned(),
        });
    }

    let mut items = Vec::new();

    if let Some(message) = value.get("message") {
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                items.push(StreamItem::ThinkingDelta(thinking.to_owned()));
            }
        }
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                items.push(StreamItem::TextDelta(content.to_owned()));
            }
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let function = call.get("function").unwrap_or(&Value::Null);
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let arguments = function.get("arguments").cloned().unwrap_or(json!({}));
                let arguments_json = match arguments {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                *next_call_index += 1;
                *saw_tool_calls = true;
                items.push(StreamItem::ToolCall(ToolCall {
                    id: format!("call_{next_call_index}"),
                    name,
                    arguments_json,
                }));
            }
        }
    }

    if value.get("done").and_then(Value::as_bool) == Some(true) {
        let reason = if *saw_tool_calls {
            FinishReason::ToolCalls
        } else {
            match value.get("done_reason").and_then(Value::as_str) {
                Some("length") => FinishReason::Length,
                Some("error") => FinishReason::Error,
                _ => FinishReason::Stop,
            }
        };
        let input = value.get("prompt_eval_count").and_then(Value::as_u64);
        let output = value.get("eval_count").and_then(Value::as_u64);
        let usage = if input.is_some() || output.is_some() {
            Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: match (input, output) {
                    (Some(i), Some(o)) => Some(i + o),
                    _ => None,
                },
            })
        } else {
            None
        };
        items.push(StreamItem::Finish { reason, usage });
    }

    Ok(items)
}
