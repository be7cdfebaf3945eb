use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionBatch, ActionRecord, ActionSpec};
use crate::event::ExecutionEvent;
use crate::provider::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub file_path: String,
    pub start_line: u64,
    pub end_line: u64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippets: Option<Vec<CodeSnippet>>,
    #[serde(default)]
    pub chat_only: bool,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            snippets: None,
            chat_only: false,
        }
    }
}

/// Bounds on what the planner LLM sees. The run itself retains full history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_turns")]
    pub turns: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars_per_message: usize,
    #[serde(default = "default_true")]
    pub summary_enabled: bool,
    #[serde(default = "default_summary_chars")]
    pub summary_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            turns: default_turns(),
            max_chars_per_message: default_max_chars(),
            summary_enabled: true,
            summary_max_chars: default_summary_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteResult {
    Written,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub file_path: String,
    #[serde(default)]
    pub file_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_unified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
    pub write_result: WriteResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingUser,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Blocked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Qa,
    CodeEdit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub provider: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippets: Option<Vec<CodeSnippet>>,
    #[serde(default)]
    pub chat_only: bool,
    #[serde(default)]
    pub planning_mode: bool,
    #[serde(default)]
    pub force_code_edit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_config: Option<HistoryConfig>,
}

/// Deep-copied view of a run, safe to hand to any caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub intent: Intent,
    pub provider_id: String,
    pub status: RunStatus,
    pub iteration: u64,
    pub max_retries: u32,
    pub messages: Vec<ChatMessage>,
    pub history_config: HistoryConfig,
    pub action_history: Vec<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_batch: Option<ActionBatch>,
    #[serde(default)]
    pub pending_action_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_action_id: Option<String>,
    #[serde(default)]
    pub events: Vec<ExecutionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_content: Option<String>,
    #[serde(default)]
    pub result_changes: Vec<FileChange>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<FileChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub needs_user_trigger: bool,
    #[serde(default)]
    pub pending_actions: Vec<ActionSpec>,
}

fn default_turns() -> usize {
    40
}

fn default_max_chars() -> usize {
    4000
}

fn default_summary_chars() -> usize {
    1200
}

fn default_true() -> bool {
    true
}

fn default_action() -> String {
    "chat".to_string()
}
