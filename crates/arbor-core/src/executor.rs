use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::Level;

use arbor_observability::{emit_event, EngineEvent};
use arbor_tools::{ActionOutcome, ToolContext, ToolError, ToolExecutor};
use arbor_types::{
    ActionRecord, ActionSpec, ActionStatus, AiResponse, ChatMessage, DecisionMode, EventKind,
    EventStatus, LlmCall, Role, RunStatus,
};

use crate::context::build_context_snapshot;
use crate::planner::{topological_order, PlanOutcome, Planner, PlannerError};
use crate::registry::RunHandle;
use crate::run::{EventDraft, Run};

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(4);

/// How one executed action affects the rest of the tick.
enum Flow {
    Ok,
    /// Non-critical failure; dependents are skipped, the run continues.
    SoftFailed,
    Waiting(String),
    RunBlocked(String),
    RunFailed(String),
    RunCancelled,
}

/// Drives runs through their state machine: plan, schedule frontiers, apply
/// results, transition status. All mutations happen under the run handle's
/// tick lock, so at most one executor is active per run.
pub struct RunExecutor {
    planner: Planner,
    tools: ToolExecutor,
    pool: Arc<Semaphore>,
}

impl RunExecutor {
    pub fn new(planner: Planner, tools: ToolExecutor, max_concurrent_tools: usize) -> Self {
        Self {
            planner,
            tools,
            pool: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// One planner+execute cycle. Terminal runs return their latched result
    /// unchanged, which makes `continue` idempotent.
    pub async fn tick(&self, handle: &RunHandle) -> AiResponse {
        let _tick = handle.tick_lock.lock().await;

        {
            let run = handle.state.read().await;
            if run.status.is_terminal() {
                let content = run
                    .result_content
                    .clone()
                    .unwrap_or_else(|| "Run already finished.".to_string());
                return build_response(&run, content, false);
            }
        }

        if self.finish_if_cancelled(handle).await {
            let run = handle.state.read().await;
            return build_response(&run, "Run cancelled.".to_string(), false);
        }
        if self.park_if_pause_requested(handle).await {
            let run = handle.state.read().await;
            return build_response(&run, "Run paused.".to_string(), false);
        }

        // A run waiting on a textual reply must not re-execute its question.
        let (awaiting_reply, question) = {
            let run = handle.state.read().await;
            let awaiting = run.status == RunStatus::WaitingUser && has_waiting_input_record(&run);
            let question = run
                .latest_batch
                .as_ref()
                .map(|b| b.summary.clone())
                .unwrap_or_default();
            (awaiting, question)
        };
        if awaiting_reply {
            let run = handle.state.read().await;
            return build_response(&run, question, true);
        }

        let has_pending = {
            let run = handle.state.read().await;
            run.latest_batch.is_some() && !run.pending_action_ids.is_empty()
        };

        if has_pending {
            self.execute_pending(handle).await
        } else {
            self.plan_iteration(handle).await
        }
    }

    /// Inject a user reply into a waiting run: append the message, complete
    /// the pending user-input actions, then resume planning.
    pub async fn reply(&self, handle: &RunHandle, message: String) -> AiResponse {
        {
            let mut run = handle.state.write().await;
            run.messages.push(ChatMessage::new(Role::User, message.clone()));
            run.push_event(EventDraft {
                kind: Some(EventKind::System),
                stage: "control".to_string(),
                title: "User replied".to_string(),
                detail: message.clone(),
                status: Some(EventStatus::Completed),
                ..EventDraft::default()
            });
            complete_user_input_actions(&mut run, &message);
            run.status = RunStatus::Running;
        }
        self.tick(handle).await
    }

    async fn plan_iteration(&self, handle: &RunHandle) -> AiResponse {
        let (run_view, iteration) = {
            let mut run = handle.state.write().await;
            let iteration = run.iteration + 1;
            if run.status == RunStatus::Queued {
                run.status = RunStatus::Running;
            }
            run.push_event(EventDraft {
                kind: Some(EventKind::Planning),
                stage: "planning".to_string(),
                title: format!("Planning iteration {iteration}"),
                detail: "Selecting the next action batch".to_string(),
                status: Some(EventStatus::Running),
                iteration: Some(iteration),
                ..EventDraft::default()
            });
            (run.clone(), iteration)
        };

        emit_event(
            Level::INFO,
            EngineEvent {
                event: "planner.call.start",
                component: "core.executor",
                run_id: Some(&run_view.run_id),
                action_id: None,
                provider_id: Some(&run_view.provider_id),
                model_id: None,
                status: Some("start"),
                error_code: None,
                detail: None,
            },
        );

        let context = build_context_snapshot(
            self.tools.workspace(),
            &run_view.request,
            &run_view.action_history,
        )
        .await;

        let planned = self.planner.next_batch(&run_view, iteration, context).await;

        match planned {
            Ok(PlanOutcome { batch, llm }) => {
                let decision = batch.decision.clone();
                let summary = batch.summary.clone();
                let actions = batch.actions.clone();
                {
                    let mut run = handle.state.write().await;
                    run.set_latest_batch(batch);
                    run.push_event(EventDraft {
                        kind: Some(EventKind::Planning),
                        stage: "planning".to_string(),
                        title: format!("Planning iteration {iteration} completed"),
                        detail: summary.clone(),
                        status: Some(EventStatus::Completed),
                        iteration: Some(iteration),
                        data: planning_data(&decision.mode, actions.len(), &llm),
                        ..EventDraft::default()
                    });
                    for action in &actions {
                        run.push_event(EventDraft {
                            kind: Some(EventKind::Action),
                            stage: action.action_type.as_str().to_string(),
                            title: action.title.clone(),
                            detail: action.reason.clone(),
                            status: Some(EventStatus::Queued),
                            iteration: Some(iteration),
                            action_id: Some(action.id.clone()),
                            input: Some(action.input.clone()),
                            data: queued_data(action),
                            ..EventDraft::default()
                        });
                    }
                }

                match decision.mode {
                    DecisionMode::Blocked => {
                        let reason = decision
                            .reason
                            .unwrap_or_else(|| "Run is blocked.".to_string());
                        let mut run = handle.state.write().await;
                        run.pending_action_ids.clear();
                        run.latch_result(&reason);
                        run.mark_finished(RunStatus::Blocked);
                        run.push_event(finalize_event(iteration, &reason, EventStatus::Blocked));
                        build_response(&run, reason, false)
                    }
                    DecisionMode::Done if actions.is_empty() => {
                        let content = decision
                            .reason
                            .or_else(|| run_view.result_content.clone())
                            .unwrap_or_else(|| "Task completed.".to_string());
                        let mut run = handle.state.write().await;
                        run.pending_action_ids.clear();
                        run.latch_result(&content);
                        run.mark_finished(RunStatus::Completed);
                        run.push_event(finalize_event(iteration, &content, EventStatus::Completed));
                        build_response(&run, content, false)
                    }
                    _ => {
                        if decision.needs_user_trigger && !actions.is_empty() {
                            let mut run = handle.state.write().await;
                            run.status = RunStatus::WaitingUser;
                            return build_response(&run, summary, true);
                        }
                        self.execute_pending(handle).await
                    }
                }
            }
            Err(err) => self.fail_planning(handle, iteration, err).await,
        }
    }

    async fn fail_planning(
        &self,
        handle: &RunHandle,
        iteration: u64,
        err: PlannerError,
    ) -> AiResponse {
        let content = format!("Planning failed: {err}");
        let mut run = handle.state.write().await;
        run.push_event(EventDraft {
            kind: Some(EventKind::Planning),
            stage: "planning".to_string(),
            title: format!("Planning iteration {iteration} failed"),
            detail: content.clone(),
            status: Some(EventStatus::Failed),
            iteration: Some(iteration),
            error: Some(err.kind().to_string()),
            ..EventDraft::default()
        });
        emit_event(
            Level::ERROR,
            EngineEvent {
                event: "planner.call.error",
                component: "core.executor",
                run_id: Some(&run.run_id),
                action_id: None,
                provider_id: Some(&run.provider_id),
                model_id: None,
                status: Some("failed"),
                error_code: Some(err.kind()),
                detail: Some(&content),
            },
        );
        run.pending_action_ids.clear();
        run.latch_result(&content);
        run.mark_finished(RunStatus::Failed);
        build_response(&run, content, false)
    }

    async fn execute_pending(&self, handle: &RunHandle) -> AiResponse {
        let (batch, pending_ids, iteration) = {
            let mut run = handle.state.write().await;
            run.status = RunStatus::Running;
            let Some(batch) = run.latest_batch.clone() else {
                return build_response(&run, "Nothing to execute.".to_string(), false);
            };
            (batch, run.pending_action_ids.clone(), run.iteration)
        };

        let pending: HashSet<&str> = pending_ids.iter().map(|s| s.as_str()).collect();
        let selected: Vec<ActionSpec> = batch
            .actions
            .iter()
            .filter(|a| pending.contains(a.id.as_str()))
            .cloned()
            .collect();
        let in_batch: HashSet<String> = selected.iter().map(|a| a.id.clone()).collect();
        let mut remaining = topological_order(&selected);

        // Ids that satisfy a dependency: in-batch ids once executed here,
        // out-of-batch ids when a completed prior record exists. Prior
        // records never satisfy an id that this batch redefines.
        let prior_completed: HashSet<String> = {
            let run = handle.state.read().await;
            run.action_history
                .iter()
                .filter(|r| r.status == ActionStatus::Completed)
                .map(|r| r.action_id.clone())
                .collect()
        };
        let mut done_in_batch: HashSet<String> = HashSet::new();
        let mut dead: HashSet<String> = HashSet::new();
        let mut final_answer: Option<String> = None;

        let dep_satisfied = |dep: &String, done: &HashSet<String>| {
            if in_batch.contains(dep) {
                done.contains(dep)
            } else {
                prior_completed.contains(dep)
            }
        };

        while !remaining.is_empty() {
            if self.finish_if_cancelled(handle).await {
                let run = handle.state.read().await;
                return build_response(&run, "Run cancelled.".to_string(), false);
            }
            if self.park_if_pause_requested(handle).await {
                let run = handle.state.read().await;
                return build_response(&run, "Run paused.".to_string(), false);
            }

            // Short-circuit actions whose prerequisites failed or were skipped.
            let (skipped, rest): (Vec<ActionSpec>, Vec<ActionSpec>) = remaining
                .into_iter()
                .partition(|a| a.depends_on.iter().any(|d| dead.contains(d)));
            for action in &skipped {
                dead.insert(action.id.clone());
                let mut run = handle.state.write().await;
                record_action(
                    &mut run,
                    action,
                    iteration,
                    ActionStatus::Skipped,
                    json!({}),
                    Some("skipped: prerequisite failed".to_string()),
                );
                run.pending_action_ids.retain(|id| id != &action.id);
            }
            if !skipped.is_empty() {
                remaining = rest;
                continue;
            }
            remaining = rest;

            let mut frontier: Vec<ActionSpec> = Vec::new();
            let mut rest: Vec<ActionSpec> = Vec::new();
            for action in remaining.drain(..) {
                if action
                    .depends_on
                    .iter()
                    .all(|d| dep_satisfied(d, &done_in_batch))
                {
                    frontier.push(action);
                } else {
                    rest.push(action);
                }
            }
            remaining = rest;

            if frontier.is_empty() {
                // Whatever is left can never become ready.
                for action in std::mem::take(&mut remaining) {
                    dead.insert(action.id.clone());
                    let mut run = handle.state.write().await;
                    record_action(
                        &mut run,
                        &action,
                        iteration,
                        ActionStatus::Skipped,
                        json!({}),
                        Some("skipped: dependencies never satisfied".to_string()),
                    );
                    run.pending_action_ids.retain(|id| id != &action.id);
                }
                break;
            }

            // Higher priority first, id as the tie-break.
            frontier.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            let parallel = frontier.len() > 1 && frontier.iter().all(|a| a.can_parallel);

            if parallel {
                let futures: Vec<_> = frontier
                    .iter()
                    .map(|action| {
                        let action = action.clone();
                        async move {
                            let result = self.run_action(handle, &action, iteration).await;
                            (action, result)
                        }
                    })
                    .collect();
                let results = futures::future::join_all(futures).await;
                for (action, result) in results {
                    match self.apply_result(handle, &action, iteration, result).await {
                        Flow::Ok => {
                            done_in_batch.insert(action.id.clone());
                            if let Some(answer) = self.take_final_answer(handle, &action).await {
                                final_answer = Some(answer);
                            }
                        }
                        Flow::SoftFailed => {
                            dead.insert(action.id.clone());
                        }
                        Flow::Waiting(message) => {
                            let run = handle.state.read().await;
                            return build_response(&run, message, true);
                        }
                        Flow::RunBlocked(reason) => {
                            let run = handle.state.read().await;
                            return build_response(&run, reason, false);
                        }
                        Flow::RunFailed(message) => {
                            let run = handle.state.read().await;
                            return build_response(&run, message, false);
                        }
                        Flow::RunCancelled => {
                            let run = handle.state.read().await;
                            return build_response(&run, "Run cancelled.".to_string(), false);
                        }
                    }
                }
            } else {
                for action in frontier {
                    if self.finish_if_cancelled(handle).await {
                        let run = handle.state.read().await;
                        return build_response(&run, "Run cancelled.".to_string(), false);
                    }
                    let result = self.run_action(handle, &action, iteration).await;
                    match self.apply_result(handle, &action, iteration, result).await {
                        Flow::Ok => {
                            done_in_batch.insert(action.id.clone());
                            if let Some(answer) = self.take_final_answer(handle, &action).await {
                                final_answer = Some(answer);
                            }
                        }
                        Flow::SoftFailed => {
                            dead.insert(action.id.clone());
                        }
                        Flow::Waiting(message) => {
                            let run = handle.state.read().await;
                            return build_response(&run, message, true);
                        }
                        Flow::RunBlocked(reason) => {
                            let run = handle.state.read().await;
                            return build_response(&run, reason, false);
                        }
                        Flow::RunFailed(message) => {
                            let run = handle.state.read().await;
                            return build_response(&run, message, false);
                        }
                        Flow::RunCancelled => {
                            let run = handle.state.read().await;
                            return build_response(&run, "Run cancelled.".to_string(), false);
                        }
                    }
                }
            }
        }

        self.finish_iteration(handle, iteration, batch.decision.mode, final_answer, &batch.summary)
            .await
    }

    async fn finish_iteration(
        &self,
        handle: &RunHandle,
        iteration: u64,
        mode: DecisionMode,
        final_answer: Option<String>,
        summary: &str,
    ) -> AiResponse {
        let mut run = handle.state.write().await;
        run.active_action_id = None;
        run.push_event(EventDraft {
            kind: Some(EventKind::System),
            stage: "iteration_summary".to_string(),
            title: format!("Iteration {iteration} finished"),
            detail: summary.to_string(),
            status: Some(EventStatus::Completed),
            iteration: Some(iteration),
            ..EventDraft::default()
        });

        let done = mode == DecisionMode::Done || final_answer.is_some();
        if done {
            let content = final_answer
                .or_else(|| run.result_content.clone())
                .unwrap_or_else(|| summary.to_string());
            run.pending_action_ids.clear();
            run.latch_result(&content);
            run.mark_finished(RunStatus::Completed);
            run.push_event(finalize_event(iteration, &content, EventStatus::Completed));
            return build_response(&run, content, false);
        }

        run.status = RunStatus::Running;
        build_response(&run, summary.to_string(), false)
    }

    /// Execute one action with bounded retries under the shared tool pool.
    async fn run_action(
        &self,
        handle: &RunHandle,
        action: &ActionSpec,
        iteration: u64,
    ) -> Result<ActionOutcome, ToolError> {
        {
            let mut run = handle.state.write().await;
            run.active_action_id = Some(action.id.clone());
            run.push_event(EventDraft {
                kind: Some(EventKind::Action),
                stage: action.action_type.as_str().to_string(),
                title: action.title.clone(),
                detail: action.reason.clone(),
                status: Some(EventStatus::Running),
                iteration: Some(iteration),
                action_id: Some(action.id.clone()),
                input: Some(action.input.clone()),
                ..EventDraft::default()
            });
        }

        let max_attempts = {
            let run = handle.state.read().await;
            1 + action.max_retries.min(run.max_retries)
        };

        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            let _permit = self.pool.acquire().await;
            let history = { handle.state.read().await.action_history.clone() };
            let ctx = ToolContext { history: &history };
            let result = self
                .tools
                .execute(action, &ctx, handle.cancel.clone())
                .await;
            match result {
                Err(err)
                    if err.retryable()
                        && attempt < max_attempts
                        && !handle.cancel.is_cancelled() =>
                {
                    tracing::warn!(
                        action_id = action.id.as_str(),
                        attempt,
                        "action failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn apply_result(
        &self,
        handle: &RunHandle,
        action: &ActionSpec,
        iteration: u64,
        result: Result<ActionOutcome, ToolError>,
    ) -> Flow {
        let mut run = handle.state.write().await;
        run.active_action_id = None;

        match result {
            Ok(outcome) => {
                if outcome.waiting_user {
                    let message = outcome
                        .assistant_message
                        .clone()
                        .unwrap_or_else(|| "Waiting for your reply.".to_string());
                    record_action(
                        &mut run,
                        action,
                        iteration,
                        ActionStatus::WaitingUser,
                        outcome.output,
                        None,
                    );
                    run.status = RunStatus::WaitingUser;
                    return Flow::Waiting(message);
                }
                if let Some(reason) = outcome.blocker {
                    record_action(
                        &mut run,
                        action,
                        iteration,
                        ActionStatus::Blocked,
                        outcome.output,
                        None,
                    );
                    run.pending_action_ids.retain(|id| id != &action.id);
                    run.latch_result(&reason);
                    run.mark_finished(RunStatus::Blocked);
                    run.push_event(finalize_event(iteration, &reason, EventStatus::Blocked));
                    return Flow::RunBlocked(reason);
                }

                run.result_changes.extend(outcome.file_changes.iter().cloned());
                record_action(
                    &mut run,
                    action,
                    iteration,
                    ActionStatus::Completed,
                    outcome.output,
                    None,
                );
                run.pending_action_ids.retain(|id| id != &action.id);
                if let Some(answer) = outcome.final_answer {
                    run.result_content = Some(answer);
                }
                Flow::Ok
            }
            Err(ToolError::Cancelled) => {
                record_action(
                    &mut run,
                    action,
                    iteration,
                    ActionStatus::Cancelled,
                    json!({}),
                    Some("cancelled".to_string()),
                );
                run.pending_action_ids.clear();
                run.latch_result("Run cancelled.");
                run.mark_finished(RunStatus::Cancelled);
                run.push_event(finalize_event(
                    iteration,
                    "Run cancelled.",
                    EventStatus::Cancelled,
                ));
                Flow::RunCancelled
            }
            Err(err) => {
                let message = format!("{} failed: {err}", action.title);
                record_action(
                    &mut run,
                    action,
                    iteration,
                    ActionStatus::Failed,
                    json!({"error_kind": err.kind()}),
                    Some(err.to_string()),
                );
                run.pending_action_ids.retain(|id| id != &action.id);

                if action.action_type.is_critical() {
                    run.latch_result(&message);
                    run.mark_finished(RunStatus::Failed);
                    run.push_event(finalize_event(iteration, &message, EventStatus::Failed));
                    Flow::RunFailed(message)
                } else {
                    Flow::SoftFailed
                }
            }
        }
    }

    async fn take_final_answer(&self, handle: &RunHandle, action: &ActionSpec) -> Option<String> {
        if action.action_type != arbor_types::ActionType::FinalAnswer {
            return None;
        }
        handle.state.read().await.result_content.clone()
    }

    async fn finish_if_cancelled(&self, handle: &RunHandle) -> bool {
        let mut run = handle.state.write().await;
        if !run.cancel_requested || run.status.is_terminal() {
            return run.status == RunStatus::Cancelled;
        }
        run.pending_action_ids.clear();
        run.latch_result("Run cancelled.");
        run.mark_finished(RunStatus::Cancelled);
        run.push_event(EventDraft {
            kind: Some(EventKind::System),
            stage: "finalize".to_string(),
            title: "Run cancelled".to_string(),
            detail: "Stopped at an action boundary".to_string(),
            status: Some(EventStatus::Cancelled),
            ..EventDraft::default()
        });
        true
    }

    async fn park_if_pause_requested(&self, handle: &RunHandle) -> bool {
        let mut run = handle.state.write().await;
        if !run.pause_requested || run.status.is_terminal() {
            return false;
        }
        run.status = RunStatus::Paused;
        run.push_event(EventDraft {
            kind: Some(EventKind::System),
            stage: "control".to_string(),
            title: "Run paused".to_string(),
            detail: "Paused at an action boundary; resume to continue".to_string(),
            status: Some(EventStatus::WaitingUser),
            ..EventDraft::default()
        });
        true
    }
}

/// Pending ask_user/request_approval actions whose question already reached
/// the user (their record is waiting_user).
fn has_waiting_input_record(run: &Run) -> bool {
    run.action_history.iter().any(|record| {
        record.status == ActionStatus::WaitingUser
            && record.action_type.is_user_input()
            && run.pending_action_ids.contains(&record.action_id)
    })
}

/// Close out pending user-input actions with the reply as their output.
fn complete_user_input_actions(run: &mut Run, reply: &str) {
    let Some(batch) = run.latest_batch.clone() else {
        run.pending_action_ids.clear();
        return;
    };
    let pending: Vec<ActionSpec> = batch
        .actions
        .iter()
        .filter(|a| a.action_type.is_user_input() && run.pending_action_ids.contains(&a.id))
        .cloned()
        .collect();

    for action in pending {
        let output = json!({"reply": reply});
        // Rewrite the waiting record in place if the question already ran.
        let waiting_idx = run
            .action_history
            .iter()
            .position(|r| r.action_id == action.id && r.status == ActionStatus::WaitingUser);
        if let Some(idx) = waiting_idx {
            let record = &mut run.action_history[idx];
            record.status = ActionStatus::Completed;
            record.output = output.clone();
            record.ended_at = Some(chrono::Utc::now());
        } else {
            run.action_history.push(ActionRecord {
                iteration: run.iteration,
                action_id: action.id.clone(),
                action_type: action.action_type,
                status: ActionStatus::Completed,
                title: action.title.clone(),
                reason: action.reason.clone(),
                input: action.input.clone(),
                output: output.clone(),
                artifacts: action.artifacts.clone(),
                error: None,
                started_at: Some(chrono::Utc::now()),
                ended_at: Some(chrono::Utc::now()),
            });
        }
        let iteration = run.iteration;
        run.push_event(EventDraft {
            kind: Some(EventKind::Action),
            stage: action.action_type.as_str().to_string(),
            title: action.title.clone(),
            detail: "Completed by user reply".to_string(),
            status: Some(EventStatus::Completed),
            iteration: Some(iteration),
            action_id: Some(action.id.clone()),
            output: Some(output),
            ..EventDraft::default()
        });
        run.pending_action_ids.retain(|id| id != &action.id);
    }
}

fn record_action(
    run: &mut Run,
    action: &ActionSpec,
    iteration: u64,
    status: ActionStatus,
    output: Value,
    error: Option<String>,
) {
    let now = chrono::Utc::now();
    run.action_history.push(ActionRecord {
        iteration,
        action_id: action.id.clone(),
        action_type: action.action_type,
        status,
        title: action.title.clone(),
        reason: action.reason.clone(),
        input: action.input.clone(),
        output: output.clone(),
        artifacts: action.artifacts.clone(),
        error: error.clone(),
        started_at: Some(now),
        ended_at: Some(now),
    });
    let event_status = match status {
        ActionStatus::Completed => EventStatus::Completed,
        ActionStatus::Failed => EventStatus::Failed,
        ActionStatus::WaitingUser => EventStatus::WaitingUser,
        ActionStatus::Blocked => EventStatus::Blocked,
        ActionStatus::Cancelled => EventStatus::Cancelled,
        ActionStatus::Skipped => EventStatus::Failed,
        ActionStatus::Queued => EventStatus::Queued,
        ActionStatus::Running => EventStatus::Running,
    };
    run.push_event(EventDraft {
        kind: Some(EventKind::Action),
        stage: action.action_type.as_str().to_string(),
        title: action.title.clone(),
        detail: error.clone().unwrap_or_default(),
        status: Some(event_status),
        iteration: Some(iteration),
        action_id: Some(action.id.clone()),
        input: Some(action.input.clone()),
        output: Some(output),
        artifacts: action.artifacts.clone(),
        error,
        ..EventDraft::default()
    });
}

fn finalize_event(iteration: u64, detail: &str, status: EventStatus) -> EventDraft {
    EventDraft {
        kind: Some(EventKind::System),
        stage: "finalize".to_string(),
        title: match status {
            EventStatus::Completed => "Run completed".to_string(),
            EventStatus::Failed => "Run failed".to_string(),
            EventStatus::Blocked => "Run blocked".to_string(),
            EventStatus::Cancelled => "Run cancelled".to_string(),
            _ => "Run finished".to_string(),
        },
        detail: detail.to_string(),
        status: Some(status),
        iteration: Some(iteration),
        ..EventDraft::default()
    }
}

fn planning_data(mode: &DecisionMode, action_count: usize, llm: &LlmCall) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("decision".to_string(), json!(mode));
    data.insert("action_count".to_string(), json!(action_count));
    data.insert("llm".to_string(), json!(llm));
    data
}

fn queued_data(action: &ActionSpec) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("depends_on".to_string(), json!(action.depends_on));
    data.insert("can_parallel".to_string(), json!(action.can_parallel));
    data
}

/// Assemble the response the HTTP layer returns after a tick.
pub fn build_response(run: &Run, content: String, needs_user_trigger: bool) -> AiResponse {
    let pending_actions: Vec<ActionSpec> = run
        .latest_batch
        .as_ref()
        .map(|batch| {
            batch
                .actions
                .iter()
                .filter(|a| run.pending_action_ids.contains(&a.id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    AiResponse {
        content,
        action: "chat".to_string(),
        file_path: run.result_file_path.clone(),
        file_content: run.result_file_content.clone(),
        changes: if run.result_changes.is_empty() {
            None
        } else {
            Some(run.result_changes.clone())
        },
        run: Some(run.snapshot()),
        run_id: Some(run.run_id.clone()),
        needs_user_trigger,
        pending_actions,
    }
}
