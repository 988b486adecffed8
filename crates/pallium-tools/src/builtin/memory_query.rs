//! `memory_query` — read the external memory store.

use async_trait::async_trait;
use serde_json::{json, Value};

use pallium_core::errors::{ToolError, ToolErrorKind};
use pallium_core::messages::ToolSchema;
use pallium_store::memory::MemoryQuery;

use crate::traits::{Tool, ToolResources};

/// Hard cap on requested result count.
const MAX_K: u64 = 16;

pub struct MemoryQueryTool;

#[async_trait]
impl Tool for MemoryQueryTool {
    fn name(&self) -> &str {
        "memory_query"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "memory_query".into(),
            description: "Query durable long-term memories. Use for background context, \
                          preferences, or facts from earlier sessions. Returns {items: \
                          [{id, text, score, meta}]}."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Free-form search text."
                    },
                    "k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_K,
                        "default": 5,
                        "description": "Maximum number of results."
                    },
                    "filters": {
                        "type": "object",
                        "description": "Optional backend-specific filters."
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, args: &Value, resources: &ToolResources) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| {
                ToolError::new(ToolErrorKind::BadArgs, "query must be a non-empty string")
            })?;

        let k = args
            .get("k")
            .and_then(Value::as_u64)
            .map(|k| k.clamp(1, MAX_K) as u32);

        let request = MemoryQuery {
            query: query.to_owned(),
            k,
            filters: args.get("filters").filter(|f| f.is_object()).cloned(),
        };

        let items = resources
            .memory
            .query(&request)
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Handler, e.to_string()))?;
        Ok(json!({ "items": items }))
    }

    fn validate(&self, result: &Value) -> Result<(), String> {
        if result.get("items").map_or(false, Value::is_array) {
            Ok(())
        } else {
            Err("result must carry an 'items' array".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pallium_core::world::WorldState;
    use pallium_store::chat_log::ChatLog;
    use pallium_store::memory::{MemoryBackend, MemoryClient, MemoryWrite};
    use pallium_store::StoreError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FixedBackend;

    #[async_trait]
    impl MemoryBackend for FixedBackend {
        async fn query(
            &self,
            _namespace: &str,
            query: &MemoryQuery,
        ) -> Result<Vec<Value>, StoreError> {
            assert_eq!(query.k, Some(3));
            Ok(vec![json!({"id": "m1", "text": "trip to Oslo", "score": 0.8})])
        }

        async fn store(&self, _: &str, _: &MemoryWrite) -> Result<String, StoreError> {
            unreachable!("memory_query never stores")
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
    async fn queries_backend() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryClient::with_backend(Arc::new(FixedBackend), "kim");
        let result = MemoryQueryTool
            .execute(&json!({"query": "trip", "k": 3}), &resources(&dir, memory))
            .await
            .unwrap();
        assert_eq!(result["items"][0]["id"], "m1");
    }

    #[tokio::test]
    async fn disabled_memory_returns_empty_items() {
        let dir = TempDir::new().unwrap();
        let result = MemoryQueryTool
            .execute(
                &json!({"query": "trip"}),
                &resources(&dir, MemoryClient::disabled("kim")),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"items": []}));
    }

    #[tokio::test]
    async fn empty_query_is_bad_args() {
        let dir = TempDir::new().unwrap();
        let err = MemoryQueryTool
            .execute(
                &json!({"query": "  "}),
                &resources(&dir, MemoryClient::disabled("kim")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BadArgs);
    }

    #[test]
    fn validator_requires_items() {
        assert!(MemoryQueryTool.validate(&json!({"items": []})).is_ok());
        assert!(MemoryQueryTool.validate(&json!({"turns": []})).is_err());
    }
}
