use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use arbor_types::{EventKind, EventStatus, RunSnapshot, RunStatus};

use crate::run::{EventDraft, Run};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run {run_id} is {status:?}")]
    Conflict { run_id: String, status: RunStatus },
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "run_not_found",
            ControlError::Conflict { .. } => "run_conflict",
        }
    }
}

/// Per-run shared state. `tick_lock` guarantees a single executor per run;
/// `cancel` is the master cancellation token actions derive from.
pub struct RunHandle {
    pub state: RwLock<Run>,
    pub tick_lock: Mutex<()>,
    pub cancel: CancellationToken,
}

impl RunHandle {
    fn new(run: Run) -> Self {
        Self {
            state: RwLock::new(run),
            tick_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }
}

/// In-memory `run_id → Run` map. Runs live here for their whole lifetime and
/// are evicted by the TTL sweeper once terminal.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, Arc<RunHandle>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) -> Arc<RunHandle> {
        let run_id = run.run_id.clone();
        let handle = Arc::new(RunHandle::new(run));
        self.runs.write().await.insert(run_id, handle.clone());
        handle
    }

    pub async fn get(&self, run_id: &str) -> Result<Arc<RunHandle>, ControlError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(run_id.to_string()))
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        let handle = self.get(run_id).await?;
        let run = handle.state.read().await;
        Ok(run.snapshot())
    }

    /// Request a pause. The executor parks the run at the next safe point; a
    /// run already waiting on the user pauses immediately.
    pub async fn request_pause(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        let handle = self.get(run_id).await?;
        let mut run = handle.state.write().await;
        if !run.status.is_terminal() {
            run.pause_requested = true;
            if run.status == RunStatus::WaitingUser {
                run.status = RunStatus::Paused;
            }
            let active = run.active_action_id.clone();
            run.push_event(EventDraft {
                kind: Some(EventKind::System),
                stage: "control".to_string(),
                title: "Pause requested".to_string(),
                detail: "Will pause once the current action finishes".to_string(),
                status: Some(EventStatus::WaitingUser),
                action_id: active,
                ..EventDraft::default()
            });
        }
        Ok(run.snapshot())
    }

    pub async fn clear_pause(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        let handle = self.get(run_id).await?;
        let mut run = handle.state.write().await;
        if run.status != RunStatus::Cancelled {
            run.pause_requested = false;
            if run.status == RunStatus::Paused {
                run.status = RunStatus::Running;
            }
            run.push_event(EventDraft {
                kind: Some(EventKind::System),
                stage: "control".to_string(),
                title: "Run resumed".to_string(),
                detail: "Automatic execution resumed".to_string(),
                status: Some(EventStatus::Running),
                ..EventDraft::default()
            });
        }
        Ok(run.snapshot())
    }

    /// Request cancellation: set the flag, fire the master token, and when no
    /// executor is mid-tick finalize immediately.
    pub async fn request_cancel(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        let handle = self.get(run_id).await?;
        {
            let mut run = handle.state.write().await;
            if run.status.is_terminal() {
                return Ok(run.snapshot());
            }
            run.cancel_requested = true;
        }
        handle.cancel.cancel();

        // If no tick is in flight, the transition happens right here instead
        // of waiting for the next tick.
        if let Ok(_tick) = handle.tick_lock.try_lock() {
            let mut run = handle.state.write().await;
            if !run.status.is_terminal() {
                run.pending_action_ids.clear();
                run.latch_result("Run cancelled.");
                run.mark_finished(RunStatus::Cancelled);
                run.push_event(EventDraft {
                    kind: Some(EventKind::System),
                    stage: "finalize".to_string(),
                    title: "Run cancelled".to_string(),
                    detail: "Cancelled before the next action".to_string(),
                    status: Some(EventStatus::Cancelled),
                    ..EventDraft::default()
                });
            }
        }

        let run = handle.state.read().await;
        Ok(run.snapshot())
    }

    /// Drop terminal runs whose `finished_at` is older than `ttl`.
    pub async fn sweep_terminal(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut evicted = 0;
        let mut runs = self.runs.write().await;
        let ids: Vec<String> = runs.keys().cloned().collect();
        for id in ids {
            let expired = {
                let Some(handle) = runs.get(&id) else { continue };
                let run = handle.state.read().await;
                run.status.is_terminal()
                    && run.finished_at.map(|at| at < cutoff).unwrap_or(false)
            };
            if expired {
                runs.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Background garbage collection of expired terminal runs.
    pub fn spawn_sweeper(&self, ttl: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_terminal(ttl).await;
                if evicted > 0 {
                    tracing::info!(evicted, "swept expired terminal runs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{AiRequest, ChatMessage, HistoryConfig, Role};

    fn request() -> AiRequest {
        AiRequest {
            provider: "openai".to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            current_file: None,
            current_code: None,
            file_path: None,
            snippets: None,
            chat_only: true,
            planning_mode: false,
            force_code_edit: false,
            history_config: None,
        }
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let registry = RunRegistry::new();
        let err = registry.snapshot("nope").await.unwrap_err();
        assert_eq!(err.kind(), "run_not_found");
    }

    #[tokio::test]
    async fn cancel_without_active_tick_finalizes_immediately() {
        let registry = RunRegistry::new();
        let run = Run::new(request(), 2, HistoryConfig::default());
        let handle = registry.insert(run).await;
        let run_id = { handle.state.read().await.run_id.clone() };

        let snapshot = registry.request_cancel(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert!(snapshot.cancel_requested);
        assert!(snapshot.pending_action_ids.is_empty());
        assert!(handle.cancel.is_cancelled());

        // Idempotent on terminal runs.
        let again = registry.request_cancel(&run_id).await.unwrap();
        assert_eq!(again.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn pause_on_waiting_run_pauses_immediately() {
        let registry = RunRegistry::new();
        let mut run = Run::new(request(), 2, HistoryConfig::default());
        run.status = RunStatus::WaitingUser;
        let handle = registry.insert(run).await;
        let run_id = { handle.state.read().await.run_id.clone() };

        let snapshot = registry.request_pause(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Paused);

        let snapshot = registry.clear_pause(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Running);
        assert!(!snapshot.pause_requested);
    }

    #[tokio::test]
    async fn sweeper_evicts_only_expired_terminal_runs() {
        let registry = RunRegistry::new();

        let mut finished = Run::new(request(), 2, HistoryConfig::default());
        finished.mark_finished(RunStatus::Completed);
        finished.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        let finished_id = finished.run_id.clone();
        registry.insert(finished).await;

        let live = Run::new(request(), 2, HistoryConfig::default());
        let live_id = live.run_id.clone();
        registry.insert(live).await;

        let evicted = registry.sweep_terminal(Duration::from_secs(3600)).await;
        assert_eq!(evicted, 1);
        assert!(registry.snapshot(&finished_id).await.is_err());
        assert!(registry.snapshot(&live_id).await.is_ok());
    }
}
