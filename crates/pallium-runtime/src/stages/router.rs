//! Router stage: classify the user message into a route and language.
//!
//! Prefill runs two mechanical tool calls (chat tail, memory query from a
//! topic digest) so the routing prompt sees recent context without spending
//! a tool round. The LLM call itself runs with tools disabled and a JSON
//! response format; unknown routes fall back to the default.

use async_trait::async_trait;
use serde_json::{json, Value};

use pallium_core::json::extract_first_object;
use pallium_core::state::{route, TurnState};
use pallium_llm::provider::ResponseFormat;

use crate::config::RoleKey;
use crate::errors::RuntimeError;
use crate::prompt::TokenMap;
use crate::stages::{ids, run_mechanical_calls, token_json, Stage, StageContext};
use crate::tool_loop::{DeltaMode, LoopRequest};

/// Chat turns pulled into the routing prompt.
const CHAT_TAIL_LIMIT: u64 = 10;
/// Memory snippets pulled into the routing prompt.
const MEMORY_PREFILL_K: u64 = 5;

pub struct Router;

/// Mechanical query digest derived from the world's topics and project.
fn topic_digest(state: &TurnState) -> String {
    let mut parts: Vec<&str> = state
        .world
        .topics
        .iter()
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .collect();
    if !state.world.project.is_empty() {
        parts.push(state.world.project.as_str());
    }
    parts.join(", ")
}

#[async_trait]
impl Stage for Router {
    fn id(&self) -> &'static str {
        ids::ROUTER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Router
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        // Mechanical prefill.
        let mut calls: Vec<(&str, Value)> =
            vec![("chat_history_tail", json!({"limit": CHAT_TAIL_LIMIT}))];
        let digest = topic_digest(state);
        if !digest.is_empty() && ctx.resources.memory.is_enabled() {
            calls.push((
                "memory_query",
                json!({"query": digest, "k": MEMORY_PREFILL_K}),
            ));
        }
        let packets = run_mechanical_calls(ctx, ids::ROUTER, &calls).await;

        let chat_tail = packets
            .iter()
            .find(|p| p.kind == "chat_turns")
            .map_or_else(|| "[]".to_owned(), |p| token_json(&p.items));
        let memories = packets
            .iter()
            .find(|p| p.kind == "memories")
            .map_or_else(|| "[]".to_owned(), |p| token_json(&p.items));
        state.context.sources.extend(packets);

        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("NOW_ISO", state.runtime.now_iso.clone());
        let _ = tokens.insert("TIMEZONE", state.runtime.timezone.clone());
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let _ = tokens.insert("CHAT_TAIL_JSON", chat_tail);
        let _ = tokens.insert("MEMORY_SNIPPETS_JSON", memories);
        let prompt = ctx.prompts.render(ids::ROUTER, &tokens)?;

        // Prefill is the only tool access the router gets; the LLM call
        // itself runs with tools disabled.
        let outcome = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::ROUTER.to_owned(),
                role: ctx.role(RoleKey::Router)?,
                messages: vec![pallium_core::messages::Message::user(prompt)],
                toolset: std::sync::Arc::new(pallium_tools::skills::ToolSet::default()),
                response_format: ResponseFormat::JsonObject,
                format_directive: None,
                delta_mode: DeltaMode::Thinking,
            })
            .await?;
        if outcome.cancelled {
            return Err(RuntimeError::Cancelled);
        }

        match extract_first_object(&outcome.text) {
            Some(decision) => apply_decision(state, &decision),
            None => {
                // Declared fallback: default route, note the parse failure.
                state.task.route = route::ANSWER.to_owned();
                state.push_issue("router:parse_failed");
            }
        }
        Ok(())
    }
}

fn apply_decision(state: &mut TurnState, decision: &Value) {
    let requested = decision
        .get("route")
        .and_then(Value::as_str)
        .unwrap_or(route::ANSWER)
        .trim()
        .to_lowercase();
    state.task.route = match requested.as_str() {
        route::CONTEXT => route::CONTEXT.to_owned(),
        route::WORLD => route::WORLD.to_owned(),
        _ => route::ANSWER.to_owned(),
    };

    let language = decision
        .get("language")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or("en");
    state.task.language = language.to_owned();

    if let Some(status) = decision.get("status").and_then(Value::as_str) {
        if !status.trim().is_empty() {
            state.runtime.status = status.trim().to_owned();
        }
    }
}
