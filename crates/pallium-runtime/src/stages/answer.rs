//! Answer stage: stream the user-visible reply.
//!
//! Tools are disabled; the model output streams 1:1 as `assistant_delta`
//! events between one `assistant_stream_start`/`assistant_stream_end` pair.
//! The concatenated text becomes `final.answer` — the only writer of that
//! field. On cancellation the stream end still carries whatever was
//! streamed, and the turn ends without a commit.

use async_trait::async_trait;

use pallium_core::events::EventBody;
use pallium_core::messages::Message;
use pallium_core::state::TurnState;
use pallium_llm::provider::ResponseFormat;

use crate::config::RoleKey;
use crate::errors::RuntimeError;
use crate::prompt::TokenMap;
use crate::stages::{ids, token_json, Stage, StageContext};
use crate::tool_loop::{DeltaMode, LoopRequest};

pub struct Answer;

#[async_trait]
impl Stage for Answer {
    fn id(&self) -> &'static str {
        ids::ANSWER
    }

    fn role_key(&self) -> RoleKey {
        RoleKey::Answer
    }

    async fn run(&self, state: &mut TurnState, ctx: &StageContext) -> Result<(), RuntimeError> {
        let mut tokens = TokenMap::new();
        let _ = tokens.insert("USER_MESSAGE", state.task.user_text.clone());
        let _ = tokens.insert("LANGUAGE", state.task.language.clone());
        let _ = tokens.insert("STATUS", state.runtime.status.clone());
        let _ = tokens.insert("WORLD_JSON", token_json(&state.world));
        let _ = tokens.insert("CONTEXT_JSON", token_json(&state.context));
        let _ = tokens.insert("ISSUES_JSON", token_json(&state.runtime.issues));
        let prompt = ctx.prompts.render(ids::ANSWER, &tokens)?;

        ctx.emitter.emit(EventBody::AssistantStreamStart {});

        let result = ctx
            .tool_loop()
            .run(LoopRequest {
                stage_id: ids::ANSWER.to_owned(),
                role: ctx.role(RoleKey::Answer)?,
                messages: vec![Message::user(prompt)],
                toolset: ctx.toolkit.toolset_for_stage(ids::ANSWER), // empty by policy
                response_format: ResponseFormat::None,
                format_directive: None,
                delta_mode: DeltaMode::Assistant,
            })
            .await;

        match result {
            Ok(outcome) => {
                // The stream end always carries what was streamed, partial
                // or complete.
                ctx.emitter.emit(EventBody::AssistantStreamEnd {
                    text_total: outcome.text.clone(),
                });
                state.final_.answer = outcome.text;
                if outcome.cancelled {
                    return Err(RuntimeError::Cancelled);
                }
                Ok(())
            }
            Err(err) => {
                ctx.emitter.emit(EventBody::AssistantStreamEnd {
                    text_total: String::new(),
                });
                Err(err)
            }
        }
    }
}
