//! The turn controller.
//!
//! Owns the durable stores and the single invocation surface:
//! [`Controller::submit_turn`] appends the user turn to the chat log, loads
//! the world snapshot, runs the graph executor on a background task, and
//! streams `turn.v1` events to the caller. On a successful turn it appends
//! the assistant turn; a cancelled or failed turn leaves no assistant entry.
//!
//! At most one turn runs at a time for the configured namespace; a second
//! submission while one is active is rejected with `TurnBusy`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use pallium_core::ids::TurnId;
use pallium_core::state::{ChatRole, ChatTurn, TurnState};
use pallium_llm::ndjson::NdjsonProvider;
use pallium_llm::provider::ChatProvider;
use pallium_store::chat_log::ChatLog;
use pallium_store::memory::MemoryClient;
use pallium_store::world_store::WorldStore;
use pallium_tools::builtin_registry;
use pallium_tools::skills::Toolkit;
use pallium_tools::traits::ToolResources;

use crate::config::RuntimeConfig;
use crate::emitter::{EventSubscription, TurnEmitter};
use crate::errors::RuntimeError;
use crate::graph::{GraphExecutor, TurnOutcome, WorldCommitter};
use crate::prompt::PromptRenderer;
use crate::stages::StageContext;

/// A running turn: its event stream and completion handle.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: TurnId,
    /// Ordered `turn.v1` events; ends after the terminal event.
    pub events: EventSubscription,
    /// Resolves to the final turn state and outcome.
    pub done: JoinHandle<(TurnState, TurnOutcome)>,
    pub cancel: CancellationToken,
}

/// Clears the active-turn marker even if the turn task panics.
struct ActiveGuard(Arc<Mutex<Option<String>>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// The orchestration core's public face.
pub struct Controller {
    config: Arc<RuntimeConfig>,
    provider: Arc<dyn ChatProvider>,
    toolkit: Arc<Toolkit>,
    world_store: Arc<WorldStore>,
    chat_log: Arc<ChatLog>,
    memory: MemoryClient,
    executor: Arc<GraphExecutor>,
    active: Arc<Mutex<Option<String>>>,
}

impl Controller {
    /// Build a controller with the NDJSON provider from
    /// `config.provider_endpoint`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let provider = Arc::new(NdjsonProvider::new(&config.provider_endpoint));
        Self::with_provider(config, provider)
    }

    /// Build a controller over an explicit provider (tests, alternative
    /// transports). Runs the firewall startup check.
    pub fn with_provider(
        config: RuntimeConfig,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, RuntimeError> {
        let toolkit = Toolkit::new(builtin_registry(), config.enabled_skills.clone())?;
        let memory = match &config.memory_endpoint {
            Some(endpoint) => MemoryClient::http(endpoint, &config.user_namespace),
            None => MemoryClient::disabled(&config.user_namespace),
        };
        let world_store = Arc::new(WorldStore::new(&config.world_state_path));
        let chat_log = Arc::new(ChatLog::new(
            &config.chat_history_path,
            config.chat_history_max_turns,
        ));

        Ok(Self {
            provider,
            toolkit: Arc::new(toolkit),
            world_store,
            chat_log,
            memory,
            executor: Arc::new(GraphExecutor::new()),
            active: Arc::new(Mutex::new(None)),
            config: Arc::new(config),
        })
    }

    /// Submit one user message. Returns the event stream and a handle that
    /// resolves to the final state.
    #[instrument(skip_all, fields(namespace = %self.config.user_namespace))]
    pub fn submit_turn(
        &self,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnHandle, RuntimeError> {
        let turn_id = TurnId::new();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(RuntimeError::TurnBusy(self.config.user_namespace.clone()));
            }
            *active = Some(turn_id.to_string());
        }
        let guard = ActiveGuard(Arc::clone(&self.active));

        let now_iso = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        // The user turn lands in the log before the graph runs; a crashed
        // turn may leave it without an assistant reply.
        if let Err(err) = self.chat_log.append_now(ChatRole::Human, user_text) {
            return Err(err.into());
        }
        let world = self.world_store.load(&now_iso, &self.config.timezone)?;

        let mut state = TurnState::new(
            user_text,
            turn_id.as_str(),
            &now_iso,
            &self.config.timezone,
            world.clone(),
        );

        let emitter = Arc::new(TurnEmitter::new(
            turn_id.as_str(),
            self.config.limits.emitter_buffer,
        ));
        let events = emitter.subscribe();

        let ctx = StageContext {
            provider: Arc::clone(&self.provider),
            toolkit: Arc::clone(&self.toolkit),
            resources: ToolResources {
                chat_log: Arc::clone(&self.chat_log),
                memory: self.memory.clone(),
                world: Arc::new(Mutex::new(world)),
                now_iso,
                tz: self.config.timezone.clone(),
            },
            prompts: PromptRenderer::new(&self.config.prompt_dir),
            emitter: Arc::clone(&emitter),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
        };

        let executor = Arc::clone(&self.executor);
        let world_store = Arc::clone(&self.world_store);
        let chat_log = Arc::clone(&self.chat_log);
        let committer: WorldCommitter = Arc::new(move |world| world_store.commit(world));

        info!(turn_id = %turn_id, "turn submitted");
        let done = tokio::spawn(async move {
            let _guard = guard;
            let outcome = executor.run_turn(&mut state, &ctx, &committer).await;

            // Persist the assistant reply only for completed turns.
            if outcome.ok && !state.final_.answer.is_empty() {
                if let Err(err) = chat_log.append_now(ChatRole::Assistant, &state.final_.answer) {
                    warn!(error = %err, "assistant turn append failed");
                }
            }
            emitter.close();
            (state, outcome)
        });

        Ok(TurnHandle {
            turn_id,
            events,
            done,
            cancel,
        })
    }

    /// Read the newest `n` chat turns, oldest first.
    pub fn read_chat_tail(&self, n: usize) -> Result<Vec<ChatTurn>, RuntimeError> {
        Ok(self.chat_log.tail(n, None)?)
    }

    /// Whether a turn is currently running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }
}
