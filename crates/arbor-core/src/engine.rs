use std::sync::Arc;

use arbor_providers::ChatClient;
use arbor_tools::ToolExecutor;
use arbor_types::{AiRequest, AiResponse, EventKind, EventStatus, RunSnapshot, RunStatus};
use arbor_workspace::Workspace;

use crate::config::EngineConfig;
use crate::executor::RunExecutor;
use crate::planner::Planner;
use crate::registry::{ControlError, RunRegistry};
use crate::run::{EventDraft, Run};

/// Facade wiring the planner, executor, and registry together. This is the
/// engine the HTTP surface talks to.
#[derive(Clone)]
pub struct AgentEngine {
    registry: RunRegistry,
    executor: Arc<RunExecutor>,
    config: EngineConfig,
}

impl AgentEngine {
    pub fn new(chat: Arc<dyn ChatClient>, workspace: Workspace, config: EngineConfig) -> Self {
        let planner = Planner::new(chat);
        let tools = ToolExecutor::new(workspace);
        let executor = Arc::new(RunExecutor::new(
            planner,
            tools,
            config.max_concurrent_tools,
        ));
        Self {
            registry: RunRegistry::new(),
            executor,
            config,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub async fn create_run(&self, request: AiRequest) -> String {
        let mut run = Run::new(request, self.config.max_retries, self.config.default_history);
        let intent = run.intent;
        run.push_event(EventDraft {
            kind: Some(EventKind::System),
            stage: "run".to_string(),
            title: "Run created".to_string(),
            detail: format!("intent={intent:?}"),
            status: Some(EventStatus::Completed),
            ..EventDraft::default()
        });
        let run_id = run.run_id.clone();
        self.registry.insert(run).await;
        run_id
    }

    /// The one-shot chat surface: create a run and execute exactly one tick
    /// synchronously.
    pub async fn chat(&self, request: AiRequest) -> AiResponse {
        let run_id = self.create_run(request).await;
        match self.continue_run(&run_id).await {
            Ok(response) => response,
            Err(err) => AiResponse {
                content: err.to_string(),
                action: "chat".to_string(),
                file_path: None,
                file_content: None,
                changes: None,
                run: None,
                run_id: Some(run_id),
                needs_user_trigger: false,
                pending_actions: Vec::new(),
            },
        }
    }

    /// Create a run without waiting for the first tick.
    pub async fn start(&self, request: AiRequest) -> String {
        self.create_run(request).await
    }

    /// Drive one more tick. Terminal runs return their latched result
    /// unchanged.
    pub async fn continue_run(&self, run_id: &str) -> Result<AiResponse, ControlError> {
        let handle = self.registry.get(run_id).await?;
        Ok(self.executor.tick(&handle).await)
    }

    /// Inject a user reply into a waiting run, then tick.
    pub async fn reply(&self, run_id: &str, message: String) -> Result<AiResponse, ControlError> {
        let handle = self.registry.get(run_id).await?;
        {
            let run = handle.state.read().await;
            if run.status != RunStatus::WaitingUser {
                return Err(ControlError::Conflict {
                    run_id: run_id.to_string(),
                    status: run.status,
                });
            }
        }
        Ok(self.executor.reply(&handle, message).await)
    }

    pub async fn pause(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        self.registry.request_pause(run_id).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        self.registry.clear_pause(run_id).await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        self.registry.request_cancel(run_id).await
    }

    pub async fn get(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        self.registry.snapshot(run_id).await
    }

    /// Start the background eviction of expired terminal runs.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.registry
            .spawn_sweeper(self.config.run_ttl, self.config.sweep_interval)
    }
}
