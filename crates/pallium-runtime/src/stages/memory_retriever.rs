//! Memory-retriever stage: translate the context builder's request into
//! memory queries.
//!
//! Runs the tool loop with the read-only memory toolset; retrieved packets
//! append to `context.sources` and control returns to the context builder.

use async_trait::async_trait;
use serde_json::Value;

use pallium_core::json::extract_first_object;
use pallium_core::messages::Message;
use pallium_core::state::TurnState;
use pallium_llm::provider::ResponseFormat;

use crate::config::RoleKey;
use crate::errors::RuntimeError;
use crate::prompt::TokenMap;
use crate::stages::{ids, token_json, Stage, StageContext};
use crate::tool_loop::{DeltaMode, LoopRequest};

pub struct MemoryRetriever;

#[async_trait]
impl Stage for MemoryRetriever {
    fn id(&self) -> &'static str {
        ids::MEMORY_RETRIEVER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Reflect
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let memory_request = state
            .context
            .memory_request
            .clone()
            .unwrap_or(Value::Null);

        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let _ = tokens.insert("CONTEXT_JSON", token_json(&state.context));
        let _ = tokens.insert("MEMORY_REQUEST_JSON", token_json(&memory_request));
        let _ = tokens.insert("NOW_ISO", state.runtime.now_iso.clone());
        let _ = tokens.insert("TIMEZONE", state.runtime.timezone.clone());
        let prompt = ctx.prompts.render(ids::MEMORY_RETRIEVER, &tokens)?;

        let outcome = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::MEMORY_RETRIEVER.to_owned(),
                role: ctx.role(RoleKey::Reflect)?,
                messages: vec![Message::user(prompt)],
                toolset: ctx.toolkit.toolset_for_stage(ids::MEMORY_RETRIEVER),
                response_format: ResponseFormat::JsonObject,
                format_directive: Some(
                    "Respond with only a JSON object: \
                     {\"did_query\": bool, \"query_text\": string}."
                        .to_owned(),
                ),
                delta_mode: DeltaMode::Thinking,
            })
            .await?;

        let retrieved = outcome.packets.len();
        state.context.sources.extend(outcome.packets);
        for issue in outcome.issues {
            state.push_issue(issue);
        }
        if outcome.cancelled {
            return Err(RuntimeError::Cancelled);
        }

        // Status note for downstream visibility; parse is best-effort.
        match extract_first_object(&outcome.text) {
            Some(report) => {
                let did_query = report
                    .get("did_query")
                    .and_then(Value::as_bool)
                    .unwrap_or(retrieved > 0);
                let query_text = report
                    .get("query_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                state.context.issues.push(format!(
                    "memory_retriever: did_query={did_query} query={query_text:?} packets={retrieved}"
                ));
            }
            None => {
                state
                    .context
                    .issues
                    .push(format!("memory_retriever: packets={retrieved}"));
            }
        }

        // The request is satisfied; hand control back to the builder.
        state.context.memory_request = None;
        state.context.next = ids::CONTEXT_BUILDER.to_owned();
        Ok(())
    }
}
