//! Shared test harness for runtime tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pallium_core::state::TurnState;
use pallium_core::world::WorldState;
use pallium_llm::provider::ChatParams;
use pallium_llm::testing::MockProvider;
use pallium_store::chat_log::ChatLog;
use pallium_store::memory::MemoryClient;
use pallium_store::StoreError;
use pallium_tools::builtin_toolkit;
use pallium_tools::skills::Toolkit;
use pallium_tools::traits::ToolResources;

use crate::config::{Limits, RoleKey, RoleModel, RuntimeConfig};
use crate::emitter::TurnEmitter;
use crate::graph::WorldCommitter;
use crate::prompt::PromptRenderer;
use crate::stages::StageContext;

/// Write a minimal template for every stage.
pub(crate) fn write_prompts(dir: &Path) {
    let templates = [
        ("router", "Route this message: <<USER_MESSAGE>>\nWorld: <<WORLD_JSON>>\nRecent: <<CHAT_TAIL_JSON>>"),
        ("context_builder", "Gather context for: <<USER_MESSAGE>>\nHave: <<CONTEXT_JSON>>\nRound <<ROUND>>"),
        ("memory_retriever", "Retrieve for: <<USER_MESSAGE>>\nRequest: <<MEMORY_REQUEST_JSON>>"),
        ("world_modifier", "Edit world per: <<USER_MESSAGE>>\nWorld: <<WORLD_JSON>>"),
        ("answer", "Answer <<USER_MESSAGE>> in <<LANGUAGE>>\nContext: <<CONTEXT_JSON>>"),
        ("reflect_topics", "Update topics after: <<ASSISTANT_MESSAGE>>\nWas: <<PREV_TOPICS_JSON>>"),
        ("memory_writer", "Store memories from: <<USER_MESSAGE>> / <<ASSISTANT_MESSAGE>>"),
    ];
    for (name, body) in templates {
        std::fs::write(dir.join(format!("{name}.txt")), body).unwrap();
    }
}

pub(crate) fn test_config(dir: &Path) -> RuntimeConfig {
    let mut role_models = BTreeMap::new();
    for key in [RoleKey::Router, RoleKey::Planner, RoleKey::Reflect, RoleKey::Answer] {
        let _ = role_models.insert(
            key,
            RoleModel {
                model: format!("{}-model", key.as_str()),
                params: ChatParams::default(),
            },
        );
    }
    RuntimeConfig {
        world_state_path: dir.join("world_state.json"),
        chat_history_path: dir.join("chat_history.jsonl"),
        chat_history_max_turns: None,
        user_namespace: "test".into(),
        role_models,
        enabled_skills: pallium_tools::skills::default_enabled_skills(),
        prompt_dir: dir.join("prompts"),
        limits: Limits::default(),
        provider_endpoint: "http://127.0.0.1:11434".into(),
        memory_endpoint: None,
        timezone: "UTC".into(),
    }
}

/// Everything a graph or stage test needs, wired against a mock provider.
pub(crate) struct TestHarness {
    pub dir: TempDir,
    pub provider: Arc<MockProvider>,
    pub config: Arc<RuntimeConfig>,
    pub toolkit: Arc<Toolkit>,
    pub emitter: Arc<TurnEmitter>,
    pub chat_log: Arc<ChatLog>,
    pub cancel: CancellationToken,
    pub commits: Arc<Mutex<Vec<WorldState>>>,
    world: WorldState,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_world(WorldState::default())
    }

    pub fn with_world(world: WorldState) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        write_prompts(&dir.path().join("prompts"));
        let config = Arc::new(test_config(dir.path()));
        let chat_log = Arc::new(ChatLog::new(&config.chat_history_path, None));
        Self {
            provider: Arc::new(MockProvider::new()),
            toolkit: Arc::new(builtin_toolkit().unwrap()),
            emitter: Arc::new(TurnEmitter::new("turn_test", config.limits.emitter_buffer)),
            chat_log,
            cancel: CancellationToken::new(),
            commits: Arc::new(Mutex::new(Vec::new())),
            config,
            world,
            dir,
        }
    }

    pub fn state(&self, user_text: &str) -> TurnState {
        TurnState::new(
            user_text,
            "turn_test",
            "2026-01-01T12:00:00Z",
            "UTC",
            self.world.clone(),
        )
    }

    pub fn stage_context(&self) -> StageContext {
        StageContext {
            provider: self.provider.clone(),
            toolkit: Arc::clone(&self.toolkit),
            resources: ToolResources {
                chat_log: Arc::clone(&self.chat_log),
                memory: MemoryClient::disabled(&self.config.user_namespace),
                world: Arc::new(Mutex::new(self.world.clone())),
                now_iso: "2026-01-01T12:00:00Z".into(),
                tz: "UTC".into(),
            },
            prompts: PromptRenderer::new(&self.config.prompt_dir),
            emitter: Arc::clone(&self.emitter),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        }
    }

    /// Committer that records committed worlds.
    pub fn committer(&self) -> WorldCommitter {
        let commits = Arc::clone(&self.commits);
        Arc::new(move |world: &WorldState| -> Result<(), StoreError> {
            commits.lock().push(world.clone());
            Ok(())
        })
    }
}
