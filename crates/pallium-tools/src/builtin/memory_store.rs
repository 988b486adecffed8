//! `memory_store` — write to the external memory store.

use async_trait::async_trait;
use serde_json::{json, Value};

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::messages::ToolSchema;
use pallium_store::memory::MemoryWrite;

use crate::traits::{Tool, ToolResources};

pub struct MemoryStoreTool;

#[async_trait]
impl Tool for MemoryStoreTool {
    fn name(&self) -> &str {
        "memory_store"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "memory_store".into(),
            description: "Store one durable memory. Use only for high-signal information \
                          worth recalling in later sessions. Returns {id}."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Memory text to store."
                    },
                    "tags": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional tags."
                    },
                    "meta": {
                        "type": "object",
                        "description": "Optional metadata blob."
                    }
                },
                "required": ["text"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, args: &Value, resources: &ToolResources) -> Result<Value, ToolError> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ToolError::new(ToolErrorKind::BadArgs, "text must be a non-empty string")
            })?;

        let tags: Vec<String> = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let write = MemoryWrite {
            text: text.to_owned(),
            tags,
            meta: args.get("meta").filter(|m| m.is_object()).cloned(),
        };

        let id = resources
            .memory
            .store(&write)
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Handler, e.to_string()))?;
        Ok(json!({ "id": id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pallium_core::world::WorldState;
    use pallium_store::chat_log::ChatLog;
    use pallium_store::memory::{MemoryBackend, MemoryClient, MemoryQuery};
    use pallium_store::StoreError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct RecordingBackend {
        writes: Mutex<Vec<MemoryWrite>>,
    }

    #[async_trait]
    impl MemoryBackend for RecordingBackend {
        async fn query(&self, _: &str, _: &MemoryQuery) -> Result<Vec<Value>, StoreError> {
            unreachable!("memory_store never queries")
        }

        async fn store(&self, _: &str, write: &MemoryWrite) -> Result<String, StoreError> {
            self.writes.lock().push(write.clone());
            Ok("mem_42".into())
        }
    }

    fn resources(dir: &TempDir, memory: MemoryClient) -> ToolResources {
        ToolResources {
            chat_log: Arc::new(ChatLog::new(dir.path().join("chat.jsonl"), None)),
            memory,
            world: Arc::new(Mutex::new(WorldState::default())),
            now_iso: "2026-01-01T00:00:00Z".into(),
            tz: "UTC".into(),
        }
    }

    #[tokio::test]
    async fn stores_and_returns_id() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend {
            writes: Mutex::new(Vec::new()),
        });
        let memory = MemoryClient::with_backend(backend.clone(), "kim");
        let result = MemoryStoreTool
            .execute(
                &json!({"text": "prefers window seats", "tags": ["travel"]}),
                &resources(&dir, memory),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"id": "mem_42"}));
        let writes = backend.writes.lock();
        assert_eq!(writes[0].text, "prefers window seats");
        assert_eq!(writes[0].tags, vec!["travel".to_owned()]);
    }

    #[tokio::test]
    async fn disabled_memory_returns_empty_id() {
        let dir = TempDir::new().unwrap();
        let result = MemoryStoreTool
            .execute(
                &json!({"text": "something"}),
                &resources(&dir, MemoryClient::disabled("kim")),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"id": ""}));
    }

    #[tokio::test]
    async fn empty_text_is_bad_args() {
        let dir = TempDir::new().unwrap();
        let err = MemoryStoreTool
            .execute(
                &json!({"text": ""}),
                &resources(&dir, MemoryClient::disabled("kim")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BadArgs);
    }
}
