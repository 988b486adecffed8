//! The chat provider contract.
//!
//! A provider turns one [`ChatRequest`] into an ordered stream of
//! [`StreamItem`]s. The stream may interleave text deltas, thinking deltas
//! and tool calls, and ends with a [`StreamItem::Finish`] carrying a reason
//! and (when the backend reports it) token usage.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use pallium_core::messages::{Message, TokenUsage, ToolCall, ToolSchema};

/// Result alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Boxed stream returned by [`ChatProvider::stream`].
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamItem, ProviderError>> + Send>>;

/// Why a stream finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of output.
    Stop,
    /// The model stopped to issue tool calls.
    ToolCalls,
    /// Token limit reached.
    Length,
    /// Backend-reported error.
    Error,
}

/// One item on a provider stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamItem {
    /// Incremental response text.
    TextDelta(String),
    /// Incremental thinking text (diagnostic; never part of the answer).
    ThinkingDelta(String),
    /// A fully constructed tool call.
    ToolCall(ToolCall),
    /// End of stream.
    Finish {
        reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}

/// Requested output format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ResponseFormat {
    /// Free text.
    #[default]
    None,
    /// Any syntactically valid JSON object.
    JsonObject,
    /// A named JSON schema the output must match.
    Schema(serde_json::Value),
}

impl ResponseFormat {
    /// Whether a format constraint is set.
    #[must_use]
    pub fn is_some(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Sampling and decoding parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// A streaming chat request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Tool schemas offered to the model; `None` disables tools entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub params: ChatParams,
}

/// Errors raised by provider transports.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response line was not valid JSON.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Backend returned an API-level error.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Connection dropped mid-stream.
    #[error("connection reset: {message}")]
    ConnectionReset { message: String },

    /// The request or stream read timed out.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Stream was cancelled.
    #[error("stream cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the tool loop may retry this error (once, bounded backoff).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            Self::ConnectionReset { .. } | Self::Timeout { .. } => true,
            Self::Decode(_) | Self::Cancelled => false,
        }
    }

    /// Error class string for events and logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http(_) => "network",
            Self::Decode(_) => "decode",
            Self::Api { .. } => "api",
            Self::ConnectionReset { .. } => "connection_reset",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Core provider trait. Implementors must be `Send + Sync` so streams can be
/// driven from any task.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier for logs (e.g. `"ndjson"`, `"mock"`).
    fn name(&self) -> &str;

    /// Open a streaming chat call.
    ///
    /// The stream ends with [`StreamItem::Finish`]; consumers must stop
    /// reading after it.
    async fn stream(&self, request: &ChatRequest) -> ProviderResult<ChatStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_wire_strings() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            "\"tool_calls\""
        );
        assert_eq!(serde_json::to_string(&FinishReason::Stop).unwrap(), "\"stop\"");
    }

    #[test]
    fn response_format_is_some() {
        assert!(!ResponseFormat::None.is_some());
        assert!(ResponseFormat::JsonObject.is_some());
        assert!(ResponseFormat::Schema(serde_json::json!({"type": "object"})).is_some());
    }

    #[test]
    fn api_error_5xx_is_retryable() {
        let err = ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), "api");
    }

    #[test]
    fn api_error_4xx_is_not_retryable() {
        let err = ProviderError::Api {
            status: 400,
            message: "bad request".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_classes_are_retryable() {
        assert!(ProviderError::Timeout {
            message: "read".into()
        }
        .is_retryable());
        assert!(ProviderError::ConnectionReset {
            message: "eof".into()
        }
        .is_retryable());
    }

    #[test]
    fn cancelled_is_terminal() {
        let err = ProviderError::Cancelled;
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "cancelled");
    }

    #[test]
    fn request_default_has_no_tools() {
        let req = ChatRequest::default();
        assert!(req.tools.is_none());
        assert_eq!(req.response_format, ResponseFormat::None);
    }

    #[test]
    fn provider_trait_is_object_safe() {
        fn assert_object_safe(_: &dyn ChatProvider) {}
        let _ = assert_object_safe;
    }
}
