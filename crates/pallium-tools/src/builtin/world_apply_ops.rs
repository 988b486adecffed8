//! `world_apply_ops` — mutate the turn's working copy of the world.
//!
//! Applies `set` / `append` / `remove` operations to whitelisted paths of a
//! working copy and returns the resulting world. Durable storage is never
//! touched here; the controller commits at turn end.

use async_trait::async_trait;
use serde_json::{json, Value};

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::messages::ToolSchema;
use pallium_core::world::WorldState;

use crate::traits::{Tool, ToolResources};

/// Paths a mutation may target.
const ALLOWED_PATHS: &[&str] = &[
    "project",
    "topics",
    "goals",
    "rules",
    "identity.user_name",
    "identity.session_user_name",
    "identity.agent_name",
    "identity.user_location",
];

pub struct WorldApplyOps;

#[async_trait]
impl Tool for WorldApplyOps {
    fn name(&self) -> &str {
        "world_apply_ops"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "world_apply_ops".into(),
            description: "Apply validated modifications to the world state. Supports set, \
                          append and remove on the allowlisted paths project, topics, goals, \
                          rules and identity.*. Returns {ok, world}."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ops": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "op": {"type": "string", "enum": ["set", "append", "remove"]},
                                "path": {"type": "string", "description": "e.g. project, topics, identity.user_name"},
                                "value": {}
                            },
                            "required": ["op", "path"]
                        }
                    }
                },
                "required": ["ops"]
            }),
        }
    }

    async fn execute(&self, args: &Value, resources: &ToolResources) -> Result<Value, ToolError> {
        let ops = args
            .get("ops")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "ops must be an array"))?;

        let mut world = resources.world.lock();
        // Validate against a scratch copy first so a bad op mid-list leaves
        // the working copy untouched.
        let mut scratch = world.clone();
        for op in ops {
            apply_op(&mut scratch, op)?;
        }
        scratch.updated_at = resources.now_iso.clone();
        *world = scratch;

        Ok(json!({
            "ok": true,
            "world": serde_json::to_value(&*world).unwrap_or(Value::Null),
        }))
    }
}

fn apply_op(world: &mut WorldState, op: &Value) -> Result<(), ToolError> {
    let operation = op
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "op must be a string"))?;
    let path = op
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "path must be a string"))?;
    let value = op.get("value").cloned().unwrap_or(Value::Null);

    if !ALLOWED_PATHS.contains(&path) {
        return Err(ToolError::new(
            ToolErrorKind::ForbiddenPath,
            format!("modification not allowed for path: {path}"),
        ));
    }

    match operation {
        "set" => set_path(world, path, value),
        "append" => append_path(world, path, value),
        "remove" => remove_path(world, path, &value),
        other => Err(ToolError::new(
            ToolErrorKind::BadArgs,
            format!("unknown op: {other}"),
        )),
    }
}

fn as_string(value: Value, path: &str) -> Result<String, ToolError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ToolError::new(
            ToolErrorKind::BadArgs,
            format!("{path} requires a string value, got {other}"),
        )),
    }
}

fn as_string_list(value: Value, path: &str) -> Result<Vec<String>, ToolError> {
    let Value::Array(items) = value else {
        return Err(ToolError::new(
            ToolErrorKind::BadArgs,
            format!("{path} requires an array value"),
        ));
    };
    items
        .into_iter()
        .map(|item| as_string(item, path))
        .collect()
}

fn set_path(world: &mut WorldState, path: &str, value: Value) -> Result<(), ToolError> {
    match path {
        "project" => world.project = as_string(value, path)?,
        "topics" => world.topics = as_string_list(value, path)?,
        "goals" => {
            world.goals = value
                .as_array()
                .cloned()
                .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "goals requires an array"))?;
        }
        "rules" => {
            world.rules = value
                .as_array()
                .cloned()
                .ok_or_else(|| ToolError::new(ToolErrorKind::BadArgs, "rules requires an array"))?;
        }
        "identity.user_name" => world.identity.user_name = as_string(value, path)?,
        "identity.session_user_name" => world.identity.session_user_name = as_string(value, path)?,
        "identity.agent_name" => world.identity.agent_name = as_string(value, path)?,
        "identity.user_location" => world.identity.user_location = as_string(value, path)?,
        _ => unreachable!("path checked against whitelist"),
    }
    Ok(())
}

fn append_path(world: &mut WorldState, path: &str, value: Value) -> Result<(), ToolError> {
    match path {
        "topics" => {
            let topic = as_string(value, path)?;
            if !world.topics.contains(&topic) {
                world.topics.push(topic);
            }
        }
        "goals" => {
            if !world.goals.contains(&value) {
                world.goals.push(value);
            }
        }
        "rules" => {
            if !world.rules.contains(&value) {
                world.rules.push(value);
            }
        }
        other => {
            return Err(ToolError::new(
                ToolErrorKind::BadArgs,
                format!("append requires a list path, got: {other}"),
            ));
        }
    }
    Ok(())
}

fn remove_path(world: &mut WorldState, path: &str, value: &Value) -> Result<(), ToolError> {
    match path {
        "topics" => {
            if let Some(topic) = value.as_str() {
                world.topics.retain(|t| t != topic);
            }
        }
        "goals" => world.goals.retain(|g| g != value),
        "rules" => world.rules.retain(|r| r != value),
        other => {
            return Err(ToolError::new(
                ToolErrorKind::BadArgs,
                format!("remove requires a list path, got: {other}"),
            ));
        }
    }
    Ok(())
}
