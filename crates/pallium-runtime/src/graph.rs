//! The graph executor.
//!
//! Drives the fixed conditional topology over the turn state:
//!
//! ```text
//! router ─┬─ "context" → context_builder ⇄ memory_retriever (≤ N trips)
//!         ├─ "world"   → world_modifier ──┐
//!         └─ otherwise ───────────────────┴→ answer → reflect_topics → memory_writer → END
//! ```
//!
//! Every stage runs inside a node span (`node_start` … `node_end`). A stage
//! error before the answer stage is non-fatal: the issue is recorded and the
//! graph skips to `answer`. If the world changed (deep-equal minus
//! `updated_at`) the durable commit runs and a single `world_commit` event
//! precedes `turn_end_*`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{info, instrument, warn};

use pallium_core::events::{EventBody, TurnErrorReason, TurnSummary};
use pallium_core::state::{route, TurnState};
use pallium_core::world::{diff_worlds, WorldState};
use pallium_store::StoreError;

use crate::errors::RuntimeError;
use crate::stages::{ids, stage_registry, Stage, StageContext};

/// Performs the single durable world write at turn end.
pub type WorldCommitter = Arc<dyn Fn(&WorldState) -> Result<(), StoreError> + Send + Sync>;

/// What a turn produced, beyond the event stream.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// The turn ended with `turn_end_ok`.
    pub ok: bool,
    /// Failure reason when it did not.
    pub error: Option<TurnErrorReason>,
    /// Whether a world commit happened.
    pub world_committed: bool,
}

/// Executor over the fixed stage topology.
pub struct GraphExecutor {
    stages: HashMap<&'static str, Arc<dyn Stage>>,
}

impl Default for GraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stages: stage_registry(),
        }
    }

    /// Run one turn to completion. Emits `turn_start` first and exactly one
    /// `turn_end_*` last; never panics the caller on stage failure.
    #[instrument(skip_all, fields(turn_id = %state.runtime.turn_id))]
    pub async fn run_turn(
        &self,
        state: &mut TurnState,
        ctx: &StageContext,
        committer: &WorldCommitter,
    ) -> TurnOutcome {
        let started = Instant::now();
        ctx.emitter.emit(EventBody::TurnStart {
            user_text: state.task.user_text.clone(),
            now_iso: state.runtime.now_iso.clone(),
            timezone: state.runtime.timezone.clone(),
        });
        let initial_world = state.world.clone();

        let deadline = Duration::from_millis(ctx.config.limits.turn_deadline_ms);
        let driven = tokio::time::timeout(deadline, self.drive_stages(state, ctx)).await;

        let outcome = match driven {
            Err(_) => {
                warn!("turn deadline exceeded");
                self.end_error(ctx, TurnErrorReason::Deadline, "turn deadline exceeded")
            }
            Ok(Err(err)) if err.is_cancelled() => {
                self.end_error(ctx, TurnErrorReason::Cancelled, "turn cancelled")
            }
            Ok(Err(err)) => {
                let reason = match &err {
                    RuntimeError::Provider(_) => TurnErrorReason::Transport,
                    _ => TurnErrorReason::Internal,
                };
                self.end_error(ctx, reason, err.to_string())
            }
            Ok(Ok(visited)) => {
                self.finish_ok(state, ctx, committer, &initial_world, visited, started)
            }
        };

        let label = if outcome.ok { "ok" } else { "error" };
        counter!("turns_total", "outcome" => label).increment(1);
        histogram!("turn_duration_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    fn end_error(
        &self,
        ctx: &StageContext,
        reason: TurnErrorReason,
        message: impl Into<String>,
    ) -> TurnOutcome {
        ctx.emitter.emit(EventBody::TurnEndError {
            reason,
            message: message.into(),
        });
        TurnOutcome {
            ok: false,
            error: Some(reason),
            world_committed: false,
        }
    }

    fn finish_ok(
        &self,
        state: &mut TurnState,
        ctx: &StageContext,
        committer: &WorldCommitter,
        initial_world: &WorldState,
        visited: Vec<String>,
        started: Instant,
    ) -> TurnOutcome {
        let diff = diff_worlds(initial_world, &state.world);
        let mut world_committed = false;

        if !diff.is_empty() {
            state.world.updated_at = state.runtime.now_iso.clone();
            if let Err(err) = committer(&state.world) {
                warn!(error = %err, "world commit failed");
                return self.end_error(
                    ctx,
                    TurnErrorReason::Internal,
                    format!("world commit failed: {err}"),
                );
            }
            ctx.emitter.emit(EventBody::WorldCommit { diff });
            world_committed = true;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(nodes = visited.len(), duration_ms, "turn completed");
        ctx.emitter.emit(EventBody::TurnEndOk {
            summary: TurnSummary {
                nodes_visited: visited,
                duration_ms,
            },
        });
        TurnOutcome {
            ok: true,
            error: None,
            world_committed,
        }
    }

    /// Walk the topology. Returns the visited stage IDs in order.
    async fn drive_stages(
        &self,
        state: &mut TurnState,
        ctx: &StageContext,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut visited: Vec<String> = Vec::new();
        let mut current = ids::ROUTER;
        let mut round_trips: u32 = 0;
        let mut answered = false;

        loop {
            let Some(stage) = self.stages.get(current) else {
                return Err(RuntimeError::Internal(format!("unknown stage: {current}")));
            };

            let result = self.run_stage(stage.as_ref(), state, ctx).await;
            visited.push(current.to_owned());

            match result {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => return Err(RuntimeError::Cancelled),
                Err(err) => {
                    if current == ids::ANSWER {
                        // The answer stage could not complete: terminal.
                        return Err(err);
                    }
                    if !answered {
                        // Pre-answer failures reroute; the answer stage still
                        // sees the partial context and the recorded issues.
                        current = ids::ANSWER;
                        continue;
                    }
                    // Post-answer failures are recorded and the tail goes on.
                }
            }

            if current == ids::ANSWER {
                answered = true;
            }

            current = match current {
                ids::ROUTER => match state.task.route.as_str() {
                    route::CONTEXT => ids::CONTEXT_BUILDER,
                    route::WORLD => ids::WORLD_MODIFIER,
                    _ => ids::ANSWER,
                },
                ids::CONTEXT_BUILDER => {
                    if state.context.next == ids::MEMORY_RETRIEVER {
                        if round_trips >= ctx.config.limits.context_rounds {
                            state.push_issue("context_loop_bounded");
                            ids::ANSWER
                        } else {
                            round_trips += 1;
                            ids::MEMORY_RETRIEVER
                        }
                    } else {
                        ids::ANSWER
                    }
                }
                ids::MEMORY_RETRIEVER => ids::CONTEXT_BUILDER,
                ids::WORLD_MODIFIER => ids::ANSWER,
                ids::ANSWER => ids::REFLECT_TOPICS,
                ids::REFLECT_TOPICS => ids::MEMORY_WRITER,
                _ => break,
            };
        }
        Ok(visited)
    }

    /// Run one stage inside its node span.
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        state: &mut TurnState,
        ctx: &StageContext,
    ) -> Result<(), RuntimeError> {
        let stage_id = stage.id();
        ctx.emitter.emit(EventBody::NodeStart {
            stage_id: stage_id.to_owned(),
            role_key: stage.role_key().as_str().to_owned(),
        });
        state.runtime.trace_entered(stage_id);
        let runtime_issues_before = state.runtime.issues.len();
        let context_issues_before = state.context.issues.len();
        let started = Instant::now();

        let result = stage.run(state, ctx).await;

        match &result {
            Ok(()) => state.runtime.trace_committed(stage_id),
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                warn!(stage_id, error = %err, "stage failed");
                state.push_issue(format!("stage_error:{stage_id}:{err}"));
            }
        }

        let mut issues: Vec<String> = state.runtime.issues[runtime_issues_before..].to_vec();
        issues.extend(state.context.issues[context_issues_before..].iter().cloned());

        ctx.emitter.emit(EventBody::NodeEnd {
            stage_id: stage_id.to_owned(),
            ok: result.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
            issues,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestHarness;
    use pallium_core::events::TurnEvent;
    use pallium_core::messages::ToolCall;
    use pallium_llm::provider::StreamItem;
    use pallium_llm::testing::ScriptedCall;
    use std::collections::HashMap;

    fn tool_call_item(name: &str, id: &str, args: &str) -> StreamItem {
        StreamItem::ToolCall(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments_json: args.into(),
        })
    }

    async fn run(harness: &TestHarness, state: &mut pallium_core::state::TurnState) -> (TurnOutcome, Vec<TurnEvent>) {
        let ctx = harness.stage_context();
        let sub = harness.emitter.subscribe();
        let executor = GraphExecutor::new();
        let outcome = executor.run_turn(state, &ctx, &harness.committer()).await;
        harness.emitter.close();
        (outcome, sub.collect_all().await)
    }

    fn kinds(events: &[TurnEvent]) -> Vec<&'static str> {
        events.iter().map(TurnEvent::kind).collect()
    }

    fn assert_protocol_properties(events: &[TurnEvent]) {
        // Starts with turn_start at seq 1, ends with exactly one terminal.
        assert_eq!(events[0].kind(), "turn_start");
        assert_eq!(events[0].seq, 1);
        let terminals = events.iter().filter(|e| e.body.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().unwrap().body.is_terminal());

        // seq strictly increasing and contiguous.
        for window in events.windows(2) {
            assert_eq!(window[1].seq, window[0].seq + 1, "seq must be contiguous");
        }

        // node_start/node_end pairing per occurrence.
        let mut open: Vec<String> = Vec::new();
        for event in events {
            match &event.body {
                EventBody::NodeStart { stage_id, .. } => open.push(stage_id.clone()),
                EventBody::NodeEnd { stage_id, .. } => {
                    assert_eq!(open.pop().as_deref(), Some(stage_id.as_str()));
                }
                _ => {}
            }
        }
        assert!(open.is_empty(), "every node_start needs a node_end");

        // every tool_call has exactly one matching tool_result.
        let mut calls: HashMap<String, u32> = HashMap::new();
        for event in events {
            match &event.body {
                EventBody::ToolCall { id, .. } => *calls.entry(id.clone()).or_insert(0) += 1,
                EventBody::ToolResult { id, .. } => {
                    *calls.entry(id.clone()).or_insert(0) -= 1;
                }
                _ => {}
            }
        }
        assert!(calls.values().all(|v| *v == 0), "tool call/result mismatch");
    }

    fn assistant_text(events: &[TurnEvent]) -> (String, String) {
        let mut concat = String::new();
        let mut total = String::new();
        let mut started = 0;
        let mut ended = 0;
        for event in events {
            match &event.body {
                EventBody::AssistantStreamStart {} => started += 1,
                EventBody::AssistantDelta { text } => concat.push_str(text),
                EventBody::AssistantStreamEnd { text_total } => {
                    ended += 1;
                    total = text_total.clone();
                }
                _ => {}
            }
        }
        assert!(started <= 1 && ended <= 1, "at most one assistant stream");
        (concat, total)
    }

    // ── S1: trivial answer, no tools, no world change ────────────────────

    #[tokio::test]
    async fn trivial_answer_turn() {
        let harness = TestHarness::new();
        harness.provider.push_text(r#"{"route": "answer", "language": "en"}"#);
        harness.provider.push_items(vec![
            StreamItem::TextDelta("Hi".into()),
            StreamItem::TextDelta(".".into()),
        ]);
        harness.provider.push_text("[]");
        harness.provider.push_text("nothing to store");

        let mut state = harness.state("Say hi.");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok);
        assert!(!outcome.world_committed);
        assert_protocol_properties(&events);

        let (concat, total) = assistant_text(&events);
        assert_eq!(concat, "Hi.");
        assert_eq!(total, "Hi.");
        assert_eq!(state.final_.answer, "Hi.");

        // No world change, no commit event.
        assert!(!kinds(&events).contains(&"world_commit"));
        assert!(harness.commits.lock().is_empty());

        // Full tail ran.
        assert!(state
            .runtime
            .node_trace
            .iter()
            .any(|t| t == "reflect_topics:committed"));
        assert!(state
            .runtime
            .node_trace
            .iter()
            .any(|t| t == "memory_writer:committed"));
    }

    // ── S2: context loop with one memory retrieval ───────────────────────

    #[tokio::test]
    async fn context_loop_with_memory_retrieval() {
        let mut world = pallium_core::world::WorldState::default();
        world.topics = vec!["trip".into()];
        let harness = TestHarness::with_world(world);

        // router
        harness.provider.push_text(r#"{"route": "context"}"#);
        // context_builder #1: tool round, text round, formatting pass
        harness.provider.push_items(vec![tool_call_item(
            "memory_query",
            "tc_cb1",
            r#"{"query": "the trip"}"#,
        )]);
        harness.provider.push_text("gathering...");
        harness.provider.push_text(
            r#"{"complete": false, "next": "memory_retriever", "memory_request": {"query": "the trip", "k": 3}}"#,
        );
        // memory_retriever: tool round, text round, formatting pass
        harness.provider.push_items(vec![tool_call_item(
            "memory_query",
            "tc_mr1",
            r#"{"query": "the trip", "k": 3}"#,
        )]);
        harness.provider.push_text("looked it up");
        harness
            .provider
            .push_text(r#"{"did_query": true, "query_text": "the trip"}"#);
        // context_builder #2: no tools, formatting pass
        harness.provider.push_text("enough now");
        harness
            .provider
            .push_text(r#"{"complete": true, "next": "answer"}"#);
        // answer, reflect (unchanged topics), writer
        harness.provider.push_text("You said you leave on Friday.");
        harness.provider.push_text(r#"["trip"]"#);
        harness.provider.push_text("done");

        let mut state = harness.state("What did I say about the trip?");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok);
        assert_protocol_properties(&events);

        let committed: Vec<&str> = state
            .runtime
            .node_trace
            .iter()
            .filter(|t| t.ends_with(":committed"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            committed,
            vec![
                "router:committed",
                "context_builder:committed",
                "memory_retriever:committed",
                "context_builder:committed",
                "answer:committed",
                "reflect_topics:committed",
                "memory_writer:committed",
            ]
        );

        // Evidence packets: router prefill chat tail + two memory queries.
        let memory_packets = state
            .context
            .sources
            .iter()
            .filter(|p| p.kind == "memories")
            .count();
        assert_eq!(memory_packets, 2);
        assert!(state.context.complete);
        assert!(!outcome.world_committed, "topics unchanged");
    }

    // ── S3: world edit request ───────────────────────────────────────────

    #[tokio::test]
    async fn world_edit_commits_diff() {
        let harness = TestHarness::new();
        harness.provider.push_text(r#"{"route": "world"}"#);
        // world_modifier: tool round, text round, formatting pass
        harness.provider.push_items(vec![tool_call_item(
            "world_apply_ops",
            "tc_w1",
            r#"{"ops": [{"op": "set", "path": "project", "value": "aurora"}]}"#,
        )]);
        harness.provider.push_text("applied");
        harness.provider.push_text(r#"{"summary": "project set to aurora"}"#);
        // answer, reflect, writer
        harness.provider.push_text("Project is now aurora.");
        harness.provider.push_text("[]");
        harness.provider.push_text("done");

        let mut state = harness.state("Set project to 'aurora'.");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok);
        assert!(outcome.world_committed);
        assert_protocol_properties(&events);
        assert_eq!(state.world.project, "aurora");
        assert_eq!(state.runtime.status, "project set to aurora");

        // world_commit payload names the change, and precedes turn_end.
        let commit = events
            .iter()
            .find_map(|e| match &e.body {
                EventBody::WorldCommit { diff } => Some(diff.clone()),
                _ => None,
            })
            .expect("world_commit emitted");
        let change = commit.changed.get("project").unwrap();
        assert_eq!(change["to"], "aurora");
        let commit_idx = events.iter().position(|e| e.kind() == "world_commit").unwrap();
        let end_idx = events.iter().position(|e| e.body.is_terminal()).unwrap();
        assert!(commit_idx < end_idx);

        // Exactly one durable write.
        assert_eq!(harness.commits.lock().len(), 1);
        assert_eq!(harness.commits.lock()[0].project, "aurora");
    }

    // ── S4: forbidden tool is a result, not an abort ─────────────────────

    #[tokio::test]
    async fn forbidden_tool_is_nonfatal() {
        let harness = TestHarness::new();
        harness.provider.push_text(r#"{"route": "answer"}"#);
        harness.provider.push_text("Sure.");
        harness.provider.push_text("[]");
        // memory_writer tries to read chat history (only memory_store allowed).
        harness.provider.push_items(vec![tool_call_item(
            "chat_history_tail",
            "tc_bad",
            r#"{"limit": 5}"#,
        )]);
        harness.provider.push_text("stored nothing");

        let mut state = harness.state("hello");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok, "turn still completes");
        assert_protocol_properties(&events);
        assert!(state
            .runtime
            .issues
            .contains(&"tool_forbidden:chat_history_tail".to_owned()));

        // memory_writer's node_end is ok and carries the issue.
        let node_end = events
            .iter()
            .find_map(|e| match &e.body {
                EventBody::NodeEnd {
                    stage_id,
                    ok,
                    issues,
                    ..
                } if stage_id == "memory_writer" => Some((*ok, issues.clone())),
                _ => None,
            })
            .unwrap();
        assert!(node_end.0);
        assert!(node_end
            .1
            .contains(&"tool_forbidden:chat_history_tail".to_owned()));

        let forbidden_result = events.iter().any(|e| {
            matches!(
                &e.body,
                EventBody::ToolResult { ok: false, error: Some(err), .. }
                    if err.kind == pallium_core::errors::ToolErrorKind::Forbidden
            )
        });
        assert!(forbidden_result);
    }

    // ── S5: cancellation during answer streaming ─────────────────────────

    #[tokio::test]
    async fn cancellation_during_answer() {
        let harness = TestHarness::new();
        harness.provider.push_text(r#"{"route": "answer"}"#);
        harness.provider.push(ScriptedCall::StreamThenHang(vec![
            StreamItem::TextDelta("Hi the".into()),
        ]));

        let cancel = harness.cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut state = harness.state("Say something long");
        let (outcome, events) = run(&harness, &mut state).await;
        canceller.await.unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.error, Some(TurnErrorReason::Cancelled));
        assert!(!outcome.world_committed);
        assert!(harness.commits.lock().is_empty());

        // Stream end carries the partial text.
        let (_, total) = assistant_text(&events);
        assert_eq!(total, "Hi the");

        // answer node_end is not ok; terminal is turn_end_error{cancelled}.
        let answer_end = events.iter().find_map(|e| match &e.body {
            EventBody::NodeEnd { stage_id, ok, .. } if stage_id == "answer" => Some(*ok),
            _ => None,
        });
        assert_eq!(answer_end, Some(false));
        match &events.last().unwrap().body {
            EventBody::TurnEndError { reason, .. } => {
                assert_eq!(*reason, TurnErrorReason::Cancelled);
            }
            other => panic!("expected turn_end_error, got {other:?}"),
        }
        assert!(!kinds(&events).contains(&"world_commit"));
    }

    // ── S6: bounded context loop ─────────────────────────────────────────

    #[tokio::test]
    async fn bounded_context_loop_forces_answer() {
        let harness = TestHarness::new();
        harness.provider.push_text(r#"{"route": "context"}"#);
        // Builder always demands the retriever; retriever always returns.
        // Each invocation is a text round plus a formatting pass: the
        // builder runs 4 times (the 4th trips the bound), the retriever 3.
        for round in 0..4 {
            harness.provider.push_text("thinking");
            harness
                .provider
                .push_text(r#"{"complete": false, "next": "memory_retriever"}"#);
            if round < 3 {
                harness.provider.push_text("retrieving");
                harness
                    .provider
                    .push_text(r#"{"did_query": false, "query_text": ""}"#);
            }
        }
        harness.provider.push_text("Here is what I know.");
        harness.provider.push_text("[]");
        harness.provider.push_text("done");

        let mut state = harness.state("loop forever please");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok, "bounded turn still ends ok");
        assert!(state
            .runtime
            .issues
            .contains(&"context_loop_bounded".to_owned()));
        assert_protocol_properties(&events);

        let retriever_runs = state
            .runtime
            .node_trace
            .iter()
            .filter(|t| *t == "memory_retriever:committed")
            .count();
        assert_eq!(retriever_runs, 3, "round trips capped at 3");
        assert!(state
            .runtime
            .node_trace
            .iter()
            .any(|t| t == "answer:committed"));
    }

    // ── Property 9: unresolved prompt token ──────────────────────────────

    #[tokio::test]
    async fn unresolved_token_fails_stage_but_not_turn() {
        let harness = TestHarness::new();
        std::fs::write(
            harness.config.prompt_dir.join("router.txt"),
            "Route <<USER_MESSAGE>> with <<NOT_A_PROVIDED_TOKEN>>",
        )
        .unwrap();
        harness.provider.push_text("Hello!");
        harness.provider.push_text("[]");
        harness.provider.push_text("done");

        let mut state = harness.state("hi");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(outcome.ok, "turn completes via the answer stage");
        let router_end = events.iter().find_map(|e| match &e.body {
            EventBody::NodeEnd { stage_id, ok, .. } if stage_id == "router" => Some(*ok),
            _ => None,
        });
        assert_eq!(router_end, Some(false));
        assert!(state
            .runtime
            .issues
            .iter()
            .any(|i| i.starts_with("stage_error:router:")));
        assert_eq!(state.final_.answer, "Hello!");
        assert_protocol_properties(&events);
    }

    // ── Deadline ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn deadline_ends_turn_with_error() {
        let mut harness = TestHarness::new();
        let mut config = (*harness.config).clone();
        config.limits.turn_deadline_ms = 80;
        harness.config = Arc::new(config);

        harness.provider.push_text(r#"{"route": "answer"}"#);
        harness
            .provider
            .push(ScriptedCall::StreamThenHang(vec![StreamItem::TextDelta(
                "part".into(),
            )]));

        let mut state = harness.state("hang forever");
        let (outcome, events) = run(&harness, &mut state).await;

        assert!(!outcome.ok);
        assert_eq!(outcome.error, Some(TurnErrorReason::Deadline));
        match &events.last().unwrap().body {
            EventBody::TurnEndError { reason, .. } => {
                assert_eq!(*reason, TurnErrorReason::Deadline);
            }
            other => panic!("expected turn_end_error, got {other:?}"),
        }
        assert!(harness.commits.lock().is_empty());
    }

    // ── Post-answer stage failure is non-fatal ───────────────────────────

    #[tokio::test]
    async fn post_answer_stage_error_keeps_turn_ok() {
        let harness = TestHarness::new();
        std::fs::write(
            harness.config.prompt_dir.join("reflect_topics.txt"),
            "<<TOKEN_NOBODY_PROVIDES>>",
        )
        .unwrap();
        harness.provider.push_text(r#"{"route": "answer"}"#);
        harness.provider.push_text("Hey.");
        // reflect_topics fails on rendering; writer still runs.
        harness.provider.push_text("done");

        let mut state = harness.state("hi");
        let (outcome, _events) = run(&harness, &mut state).await;

        assert!(outcome.ok);
        assert_eq!(state.final_.answer, "Hey.");
        assert!(state
            .runtime
            .issues
            .iter()
            .any(|i| i.starts_with("stage_error:reflect_topics:")));
        assert!(state
            .runtime
            .node_trace
            .iter()
            .any(|t| t == "memory_writer:committed"));
    }
}
