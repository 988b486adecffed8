//! Memory-writer stage: decide what, if anything, to persist.
//!
//! The model reviews the exchange and issues zero or more `memory_store`
//! calls through the tool loop. No turn-state outputs; all effects are
//! external writes through the memory tool.

use async_trait::async_trait;

use pallium_core::messages::Message;
use pallium_core::state::TurnState;
use pallium_llm::provider::ResponseFormat;

use crate::config::RoleKey;
use crate::errors::RuntimeError;
use crate::prompt::TokenMap;
use crate::stages::{ids, token_json, Stage, StageContext};
use crate::tool_loop::{DeltaMode, LoopRequest};

pub struct MemoryWriter;

#[async_trait]
impl Stage for MemoryWriter {
    fn id(&self) -> &'static str {
        ids::MEMORY_WRITER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Reflect
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("ASSISTANT_MESSAGE", state.final_.answer.clone());
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let _ = tokens.insert("CONTEXT_JSON", token_json(&state.context));
        let prompt = ctx.prompts.render(ids::MEMORY_WRITER, &tokens)?;

        let outcome = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::MEMORY_WRITER.to_owned(),
                role: ctx.role(RoleKey::Reflect)?,
                messages: vec![Message::user(prompt)],
                toolset: ctx.toolkit.toolset_for_stage(ids::MEMORY_WRITER),
                response_format: ResponseFormat::None,
                format_directive: None,
                delta_mode: DeltaMode::Thinking,
            })
            .await?;

        for issue in outcome.issues {
            state.push_issue(issue);
        }
        if outcome.cancelled {
            return Err(RuntimeError::Cancelled);
        }
        Ok(())
    }
}
