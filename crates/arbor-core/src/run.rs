use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use arbor_types::{
    ActionBatch, ActionRecord, AiRequest, ChatMessage, EventKind, EventStatus, ExecutionEvent,
    FileChange, HistoryConfig, Intent, RunSnapshot, RunStatus,
};

const EDIT_MARKERS: [&str; 8] = [
    "modify", "change", "edit", "fix", "refactor", "rewrite", "optimize", "improve",
];

/// Mutable run state. Owned by the registry, mutated only under its handle's
/// tick lock; all other callers see deep `RunSnapshot` copies.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub intent: Intent,
    pub provider_id: String,
    pub status: RunStatus,
    pub iteration: u64,
    pub max_retries: u32,
    pub messages: Vec<ChatMessage>,
    pub history_config: HistoryConfig,
    pub request: AiRequest,
    pub action_history: Vec<ActionRecord>,
    pub latest_batch: Option<ActionBatch>,
    pub pending_action_ids: Vec<String>,
    pub active_action_id: Option<String>,
    pub events: Vec<ExecutionEvent>,
    pub result_action: Option<String>,
    pub result_content: Option<String>,
    pub result_file_path: Option<String>,
    pub result_file_content: Option<String>,
    pub result_changes: Vec<FileChange>,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    next_event_id: u64,
    last_event_at: DateTime<Utc>,
}

/// Fields of an event the caller actually chooses; ids and timestamps are
/// assigned on append.
#[derive(Debug, Default)]
pub struct EventDraft {
    pub kind: Option<EventKind>,
    pub stage: String,
    pub title: String,
    pub detail: String,
    pub status: Option<EventStatus>,
    pub iteration: Option<u64>,
    pub action_id: Option<String>,
    pub parent_action_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metrics: Option<Value>,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
    pub data: Map<String, Value>,
}

impl Run {
    pub fn new(request: AiRequest, max_retries: u32, default_history: HistoryConfig) -> Self {
        let intent = infer_intent(&request);
        let history_config = request.history_config.unwrap_or(default_history);
        Self {
            run_id: Uuid::new_v4().to_string(),
            intent,
            provider_id: request.provider.clone(),
            status: RunStatus::Queued,
            iteration: 0,
            max_retries,
            messages: request.messages.clone(),
            history_config,
            request,
            action_history: Vec::new(),
            latest_batch: None,
            pending_action_ids: Vec::new(),
            active_action_id: None,
            events: Vec::new(),
            result_action: None,
            result_content: None,
            result_file_path: None,
            result_file_content: None,
            result_changes: Vec::new(),
            pause_requested: false,
            cancel_requested: false,
            started_at: Some(Utc::now()),
            finished_at: None,
            next_event_id: 1,
            last_event_at: Utc::now(),
        }
    }

    /// Append one event. Ids are strictly increasing and timestamps are
    /// clamped so they never run backwards within a run.
    pub fn push_event(&mut self, draft: EventDraft) -> u64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        let timestamp = Utc::now().max(self.last_event_at);
        self.last_event_at = timestamp;
        self.events.push(ExecutionEvent {
            event_id,
            kind: draft.kind.unwrap_or(EventKind::System),
            stage: draft.stage,
            title: draft.title,
            detail: draft.detail,
            status: draft.status.unwrap_or(EventStatus::Info),
            timestamp,
            iteration: draft.iteration,
            action_id: draft.action_id,
            parent_action_id: draft.parent_action_id,
            input: draft.input,
            output: draft.output,
            metrics: draft.metrics,
            artifacts: draft.artifacts,
            error: draft.error,
            data: draft.data,
        });
        event_id
    }

    pub fn set_latest_batch(&mut self, batch: ActionBatch) {
        self.iteration = batch.iteration;
        self.pending_action_ids = batch.actions.iter().map(|a| a.id.clone()).collect();
        self.latest_batch = Some(batch);
    }

    pub fn mark_finished(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn latch_result(&mut self, content: &str) {
        self.result_action = Some("chat".to_string());
        self.result_content = Some(content.to_string());
        if let Some(change) = self.result_changes.last() {
            self.result_file_path = Some(change.file_path.clone());
            self.result_file_content = change.after_content.clone();
        }
    }

    pub fn latest_user_query(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == arbor_types::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            intent: self.intent,
            provider_id: self.provider_id.clone(),
            status: self.status,
            iteration: self.iteration,
            max_retries: self.max_retries,
            messages: self.messages.clone(),
            history_config: self.history_config,
            action_history: self.action_history.clone(),
            latest_batch: self.latest_batch.clone(),
            pending_action_ids: self.pending_action_ids.clone(),
            active_action_id: self.active_action_id.clone(),
            events: self.events.clone(),
            result_action: self.result_action.clone(),
            result_content: self.result_content.clone(),
            result_file_path: self.result_file_path.clone(),
            result_file_content: self.result_file_content.clone(),
            result_changes: self.result_changes.clone(),
            pause_requested: self.pause_requested,
            cancel_requested: self.cancel_requested,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

pub fn infer_intent(request: &AiRequest) -> Intent {
    if request.force_code_edit {
        return Intent::CodeEdit;
    }
    if request.chat_only {
        return Intent::Qa;
    }
    if request.current_file.is_some() || request.file_path.is_some() {
        return Intent::CodeEdit;
    }
    let text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == arbor_types::Role::User)
        .map(|m| m.content.to_lowercase())
        .unwrap_or_default();
    if EDIT_MARKERS.iter().any(|marker| text.contains(marker)) {
        Intent::CodeEdit
    } else {
        Intent::Qa
    }
}
