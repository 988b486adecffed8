//! Context-builder stage: multi-round evidence assembly.
//!
//! Each round re-renders the template with the current `context` summary so
//! the model sees what it has already gathered, runs the full tool loop, and
//! parses a JSON handoff (`complete`, `next`, optional `memory_request`).
//! Tool results land in `context.sources` as evidence packets.

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

/// Rounds per stage invocation. The graph-level context loop (builder ↔
/// retriever round trips) is bounded separately by `limits.context_rounds`.
const ROUND_BUDGET: u32 = 3;

/// Valid handoff targets.
const NEXT_MEMORY_RETRIEVER: &str = "memory_retriever";
const NEXT_ANSWER: &str = "answer";

pub struct ContextBuilder;

#[async_trait]
impl Stage for ContextBuilder {
    fn id(&self) -> &'static str {
        ids::CONTEXT_BUILDER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Planner
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let toolset = ctx.toolkit.toolset_for_stage(ids::CONTEXT_BUILDER);

        for round in 1..=ROUND_BUDGET {
            let mut tokens = TokenMap::new();
            let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
            let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
            let _ = tokens.insert("CONTEXT_JSON", token_json(&state.context));
            let _ = tokens.insert("NOW_ISO", state.runtime.now_iso.clone());
            let _ = tokens.insert("TIMEZONE", state.runtime.timezone.clone());
            let _ = tokens.insert("ROUND", round.to_string());
            let prompt = ctx.prompts.render(ids::CONTEXT_BUILDER, &tokens)?;

            let outcome = ctx
                .tool_loop()
                .run(LoopRequest {
                    stage_id: ids::CONTEXT_BUILDER.to_owned(),
                    role: ctx.role(RoleKey::Planner)?,
                    messages: vec![Message::user(prompt)],
                    toolset: toolset.clone(),
                    response_format: ResponseFormat::JsonObject,
                    format_directive: Some(
                        "Respond with only the JSON handoff object: \
                         {\"complete\": bool, \"next\": \"memory_retriever\"|\"answer\", \
                         \"issues\"?: [string], \"memory_request\"?: {\"query\": string, \"k\"?: int}}."
                            .to_owned(),
                    ),
                    delta_mode: DeltaMode::Thinking,
                })
                .await?;

            // Evidence packets append in execution order.
            state.context.sources.extend(outcome.packets);
            for issue in outcome.issues {
                state.push_issue(issue);
            }
            if outcome.cancelled {
                return Err(RuntimeError::Cancelled);
            }

            match extract_first_object(&outcome.text) {
                Some(handoff) => {
                    if apply_handoff(state, &handoff) {
                        break;
                    }
                }
                None => {
                    state.context.issues.push("context_builder:parse_failed".into());
                    state.context.next = NEXT_ANSWER.to_owned();
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Apply the model's handoff object. Returns true when the stage should
/// stop iterating.
fn apply_handoff(state: &mut TurnState, handoff: &Value) -> bool {
    let complete = handoff
        .get("complete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    state.context.complete = complete;

    let next = handoff
        .get("next")
        .and_then(Value::as_str)
        .map(str::trim)
        .map(str::to_lowercase)
        .unwrap_or_default();
    state.context.next = if next == NEXT_MEMORY_RETRIEVER {
        NEXT_MEMORY_RETRIEVER.to_owned()
    } else {
        NEXT_ANSWER.to_owned()
    };

    if let Some(issues) = handoff.get("issues").and_then(Value::as_array) {
        state
            .context
            .issues
            .extend(issues.iter().filter_map(Value::as_str).map(str::to_owned));
    }

    state.context.memory_request = handoff
        .get("memory_request")
        .and_then(|request| normalize_memory_request(request));

    // Stop once a direction is set; an unrecognized `next` has already been
    // normalized to `answer`, which is a direction too.
    complete
        || state.context.next == NEXT_MEMORY_RETRIEVER
        || state.context.next == NEXT_ANSWER
}

fn normalize_memory_request(request: &Value) -> Option<Value> {
    let query = request
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())?;
    let mut out = serde_json::Map::new();
    let _ = out.insert("query".into(), Value::String(query.to_owned()));
    if let Some(k) = request.get("k").and_then(Value::as_u64) {
        if (1..=16).contains(&k) {
            let _ = out.insert("k".into(), Value::from(k));
        }
    }
    Some(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pallium_core::world::WorldState;
    use serde_json::json;

    fn state() -> TurnState {
        TurnState::new("q", "turn_1", "now", "UTC", WorldState::default())
    }

    #[test]
    fn handoff_sets_complete_and_next() {
        let mut s = state();
        let stop = apply_handoff(&mut s, &json!({"complete": true, "next": "answer"}));
        assert!(stop);
        assert!(s.context.complete);
        assert_eq!(s.context.next, "answer");
    }

    #[test]
    fn handoff_requests_memory_retriever() {
        let mut s = state();
        let stop = apply_handoff(
            &mut s,
            &json!({
                "complete": false,
                "next": "memory_retriever",
                "memory_request": {"query": "the trip", "k": 4}
            }),
        );
        assert!(stop);
        assert_eq!(s.context.next, "memory_retriever");
        let request = s.context.memory_request.unwrap();
        assert_eq!(request["query"], "the trip");
        assert_eq!(request["k"], 4);
    }

    #[test]
    fn invalid_next_falls_back_to_answer() {
        let mut s = state();
        let stop = apply_handoff(&mut s, &json!({"next": "planner_self"}));
        assert_eq!(s.context.next, "answer");
        assert!(stop, "a defaulted direction still ends the round loop");
    }

    #[test]
    fn missing_next_still_stops() {
        let mut s = state();
        let stop = apply_handoff(&mut s, &json!({"complete": false}));
        assert_eq!(s.context.next, "answer");
        assert!(stop);
    }

    #[test]
    fn out_of_range_k_is_dropped() {
        let mut s = state();
        let _ = apply_handoff(
            &mut s,
            &json!({"next": "memory_retriever", "memory_request": {"query": "x", "k": 99}}),
        );
        let request = s.context.memory_request.unwrap();
        assert!(request.get("k").is_none());
    }

    #[test]
    fn empty_query_clears_memory_request() {
        let mut s = state();
        let _ = apply_handoff(
            &mut s,
            &json!({"next": "answer", "memory_request": {"query": "  "}}),
        );
        assert!(s.context.memory_request.is_none());
    }

    #[test]
    fn handoff_issues_accumulate() {
        let mut s = state();
        let _ = apply_handoff(&mut s, &json!({"next": "answer", "issues": ["thin context"]}));
        assert_eq!(s.context.issues, vec!["thin context"]);
    }
}
