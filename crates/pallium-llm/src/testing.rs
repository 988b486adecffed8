//! Scripted provider for tests.
//!
//! [`MockProvider`] replays a queue of scripted calls: each `stream()`
//! invocation pops the next script and records the request it was given, so
//! tests can assert on message injection and toolset wiring.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use pallium_core::messages::TokenUsage;

use crate::provider::{
    ChatProvider, ChatRequest, ChatStream, FinishReason, ProviderError, ProviderResult, StreamItem,
};

/// One scripted provider call.
pub enum ScriptedCall {
    /// Yield these items, then end the stream.
    Stream(Vec<StreamItem>),
    /// Yield these items, then stay pending forever (for cancellation tests).
    StreamThenHang(Vec<StreamItem>),
    /// Fail to open the stream.
    ConnectFail {
        /// Whether the error should be a retryable class.
        retryable: bool,
    },
}

/// Provider that replays scripted calls in order.
///
/// When the script queue is exhausted it streams an empty completion
/// (`Finish { reason: Stop }`).
#[derive(Default)]
pub struct MockProvider {
    scripts: Mutex<VecDeque<ScriptedCall>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    /// Empty provider; every call returns an empty completion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted call.
    pub fn push(&self, call: ScriptedCall) {
        self.scripts.lock().push_back(call);
    }

    /// Queue a call that streams `text` as one delta and finishes.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(ScriptedCall::Stream(vec![
            StreamItem::TextDelta(text.into()),
            finish_stop(),
        ]));
    }

    /// Queue a call from raw items, appending a finish marker if absent.
    pub fn push_items(&self, mut items: Vec<StreamItem>) {
        if !items.iter().any(|i| matches!(i, StreamItem::Finish { .. })) {
            items.push(finish_stop());
        }
        self.push(ScriptedCall::Stream(items));
    }

    /// Requests recorded so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

/// A `Finish { reason: Stop }` with token usage, the shape most tests want.
#[must_use]
pub fn finish_stop() -> StreamItem {
    StreamItem::Finish {
        reason: FinishReason::Stop,
        usage: Some(TokenUsage {
            input_tokens: Some(1),
            output_tokens: Some(1),
            total_tokens: Some(2),
        }),
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &ChatRequest) -> ProviderResult<ChatStream> {
        self.requests.lock().push(request.clone());

        let script = self.scripts.lock().pop_front();
        match script {
            None => {
                let items = vec![Ok(finish_stop())];
                Ok(futures::stream::iter(items).boxed())
            }
            Some(ScriptedCall::Stream(items)) => {
                Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
            }
            Some(ScriptedCall::StreamThenHang(items)) => {
                let stream = futures::stream::unfold(
                    (items.into_iter().collect::<VecDeque<_>>(), false),
                    |(mut items, hung)| async move {
                        if let Some(item) = items.pop_front() {
                            return Some((Ok(item), (items, hung)));
                        }
                        // Never resolves; the caller must cancel.
                        futures::future::pending::<()>().await;
                        None
                    },
                );
                Ok(stream.boxed())
            }
            Some(ScriptedCall::ConnectFail { retryable }) => {
                if retryable {
                    Err(ProviderError::Timeout {
                        message: "scripted timeout".into(),
                    })
                } else {
                    Err(ProviderError::Api {
                        status: 400,
                        message: "scripted failure".into(),
                    })
                }
            }
        }
    }
}
