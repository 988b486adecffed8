//! Reflect-topics stage: refresh the world's active topic list.
//!
//! The model sees the exchange and the previous topics and returns a JSON
//! array of strings, parsed with the tolerant extractor. The array replaces
//! `world.topics` wholesale (so removals are possible); on parse failure the
//! prior topics are kept and an issue is recorded.

use async_trait::async_trait;
use serde_json::Value;

use pallium_core::json::extract_first_json;
use pallium_core::messages::Message;
use pallium_core::state::TurnState;
use pallium_llm::provider::ResponseFormat;

use crate::config::RoleKey;
use crate::errors::RuntimeError;
use crate::prompt::TokenMap;
use crate::stages::{ids, token_json, Stage, StageContext};
use crate::tool_loop::{DeltaMode, LoopRequest};

pub struct ReflectTopics;

#[async_trait]
impl Stage for ReflectTopics {
    fn id(&self) -> &'static str {
        ids::REFLECT_TOPICS
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Reflect
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("ASSISTANT_MESSAGE", state.final_.answer.clone());
        let _ = tokens.insert("PREV_TOPICS_JSON", token_json(&state.world.topics));
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let prompt = ctx.prompts.render(ids::REFLECT_TOPICS, &tokens)?;

        let outcome = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::REFLECT_TOPICS.to_owned(),
                role: ctx.role(RoleKey::Reflect)?,
                messages: vec![Message::user(prompt)],
                toolset: ctx.toolkit.toolset_for_stage(ids::REFLECT_TOPICS), // empty by policy
                response_format: ResponseFormat::None,
                format_directive: None,
                delta_mode: DeltaMode::Thinking,
            })
            .await?;
        if outcome.cancelled {
            return Err(RuntimeError::Cancelled);
        }

        match parse_topics(&outcome.text) {
            Some(topics) => state.world.topics = topics,
            None => state.push_issue("reflect_topics:parse_failed"),
        }
        Ok(())
    }
}

/// Extract a topic list from model output. Accepts a bare array of strings
/// or an object carrying a `topics` array.
fn parse_topics(text: &str) -> Option<Vec<String>> {
    let value = extract_first_json(text)?;
    let array = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("topics")?.as_array()?,
        _ => return None,
    };
    Some(
        array
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}
