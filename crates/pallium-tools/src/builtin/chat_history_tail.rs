//! `chat_history_tail` — read the most recent chat turns.
//!
//! Side-effect free; observes the log the controller owns but never writes.

use async_trait::async_trait;
use serde_json::{json, Value};

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::messages::ToolSchema;
use pallium_core::state::ChatRole;

use crate::traits::{Tool, ToolResources};

/// Hard cap on the number of turns one call may return.
const MAX_LIMIT: u64 = 200;

pub struct ChatHistoryTail;

#[async_trait]
impl Tool for ChatHistoryTail {
    fn name(&self) -> &str {
        "chat_history_tail"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "chat_history_tail".into(),
            description: "Return the most recent chat turns as {turns: [{ts, role, content}]}. \
                          Use for grounding answers in the recent conversation."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "minimum": 0,
                        "maximum": MAX_LIMIT,
                        "description": "Maximum number of recent turns to return."
                    },
                    "roles": {
                        "type": "array",
                        "items": {"type": "string", "enum": ["human", "assistant"]},
                        "description": "Optional role filter."
                    }
                },
                "required": ["limit"]
            }),
        }
    }

    async fn execute(&self, args: &Value, resources: &ToolResources) -> Result<Value, ToolError> {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "limit must be an integer"))?
            .min(MAX_LIMIT);

        let roles: Option<Vec<ChatRole>> = match args.get("roles") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed: Vec<ChatRole> = value
                    .as_array()
                    .ok_or_else(|| {
                        ToolError::new(ToolErrorKind::BadArgs, "roles must be an array")
                    })?
                    .iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect();
                Some(parsed)
            }
        };

        let turns = resources
            .chat_log
            .tail(limit as usize, roles.as_deref())
            .map_err(|e| ToolError::new(ToolErrorKind::Handler, e.to_string()))?;

        let items: Vec<Value> = turns
            .iter()
            .map(|t| json!({"ts": t.ts, "role": t.role.as_str(), "content": t.content}))
            .collect();
        Ok(json!({ "turns": items }))
    }

    fn validate(&self, result: &Value) -> Result<(), String> {
        if result.get("turns").map_or(false, Value::is_array) {
            Ok(())
        } else {
            Err("result must carry a 'turns' array".into())
        }
    }
}
