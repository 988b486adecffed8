//! World-modifier stage: apply user-requested world edits via tools.
//!
//! The model issues `world_apply_ops` calls against the turn's working copy;
//! when the stage commits, the working copy becomes the turn state's world.
//! Durable storage is still only written by the controller at turn end.

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

pub struct WorldModifier;

#[async_trait]
impl Stage for WorldModifier {
    fn id(&self) -> &'static str {
        ids::WORLD_MODIFIER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Planner
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let _ = tokens.insert("NOW_ISO", state.runtime.now_iso.clone());
        let _ = tokens.insert("TIMEZONE", state.runtime.timezone.clone());
        let prompt = ctx.prompts.render(ids::WORLD_MODIFIER, &tokens)?;

        let outcome = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::WORLD_MODIFIER.to_owned(),
                role: ctx.role(RoleKey::Planner)?,
                messages: vec![Message::user(prompt)],
                toolset: ctx.toolkit.toolset_for_stage(ids::WORLD_MODIFIER),
                response_format: ResponseFormat::JsonObject,
                format_directive: Some(
                    "Respond with only a JSON object: {\"summary\": string}.".to_owned(),
                ),
                delta_mode: DeltaMode::Thinking,
            })
            .await?;

        for issue in outcome.issues {
            state.push_issue(issue);
        }
        if outcome.cancelled {
            return Err(RuntimeError::Cancelled);
        }

        // Tool results mutated the working copy; adopt it.
        state.world = ctx.resources.world_snapshot();

        match extract_first_object(&outcome.text) {
            Some(report) => {
                if let Some(summary) = report.get("summary").and_then(Value::as_str) {
                    if !summary.trim().is_empty() {
                        state.runtime.status = summary.trim().to_owned();
                    }
                }
            }
            None => state.push_issue("world_modifier:parse_failed"),
        }
        Ok(())
    }
}
