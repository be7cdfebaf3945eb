use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of operations the planner may request. Unknown variants fail
/// deserialization at the planner boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ScanWorkspace,
    ReadFiles,
    SearchCode,
    ExtractSymbols,
    AnalyzeDependencies,
    SummarizeContext,
    ProposeSubplan,
    RunCommand,
    RunTests,
    RunLint,
    RunBuild,
    CreateFile,
    UpdateFile,
    DeleteFile,
    MoveFile,
    ApplyPatch,
    ValidateResult,
    AskUser,
    RequestApproval,
    FinalAnswer,
    ReportBlocker,
}

impl ActionType {
    pub const ALL: [ActionType; 21] = [
        ActionType::ScanWorkspace,
        ActionType::ReadFiles,
        ActionType::SearchCode,
        ActionType::ExtractSymbols,
        ActionType::AnalyzeDependencies,
        ActionType::SummarizeContext,
        ActionType::ProposeSubplan,
        ActionType::RunCommand,
        ActionType::RunTests,
        ActionType::RunLint,
        ActionType::RunBuild,
        ActionType::CreateFile,
        ActionType::UpdateFile,
        ActionType::DeleteFile,
        ActionType::MoveFile,
        ActionType::ApplyPatch,
        ActionType::ValidateResult,
        ActionType::AskUser,
        ActionType::RequestApproval,
        ActionType::FinalAnswer,
        ActionType::ReportBlocker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::ScanWorkspace => "scan_workspace",
            ActionType::ReadFiles => "read_files",
            ActionType::SearchCode => "search_code",
            ActionType::ExtractSymbols => "extract_symbols",
            ActionType::AnalyzeDependencies => "analyze_dependencies",
            ActionType::SummarizeContext => "summarize_context",
            ActionType::ProposeSubplan => "propose_subplan",
            ActionType::RunCommand => "run_command",
            ActionType::RunTests => "run_tests",
            ActionType::RunLint => "run_lint",
            ActionType::RunBuild => "run_build",
            ActionType::CreateFile => "create_file",
            ActionType::UpdateFile => "update_file",
            ActionType::DeleteFile => "delete_file",
            ActionType::MoveFile => "move_file",
            ActionType::ApplyPatch => "apply_patch",
            ActionType::ValidateResult => "validate_result",
            ActionType::AskUser => "ask_user",
            ActionType::RequestApproval => "request_approval",
            ActionType::FinalAnswer => "final_answer",
            ActionType::ReportBlocker => "report_blocker",
        }
    }

    /// Actions that mutate the workspace.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ActionType::CreateFile
                | ActionType::UpdateFile
                | ActionType::DeleteFile
                | ActionType::MoveFile
                | ActionType::ApplyPatch
        )
    }

    /// Actions whose failure must terminate the run.
    pub fn is_critical(self) -> bool {
        self.is_write() || matches!(self, ActionType::FinalAnswer | ActionType::ReportBlocker)
    }

    /// Actions that read workspace content and should run after a scan.
    pub fn is_discovery(self) -> bool {
        matches!(
            self,
            ActionType::SearchCode
                | ActionType::ReadFiles
                | ActionType::ExtractSymbols
                | ActionType::AnalyzeDependencies
        )
    }

    pub fn is_user_input(self) -> bool {
        matches!(self, ActionType::AskUser | ActionType::RequestApproval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    Continue,
    AskUser,
    Done,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDecision {
    pub mode: DecisionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "default_true")]
    pub needs_user_trigger: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfaction_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub title: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub can_parallel: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_action_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBatch {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub iteration: u64,
    pub summary: String,
    pub decision: BatchDecision,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub next_questions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
    WaitingUser,
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Queued | ActionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub iteration: u64,
    pub action_id: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub title: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i64 {
    3
}

fn default_timeout_sec() -> u64 {
    120
}

fn default_action_retries() -> u32 {
    1
}

fn default_version() -> String {
    "1.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_round_trips_through_snake_case() {
        for ty in ActionType::ALL {
            let text = serde_json::to_string(&ty).unwrap();
            assert_eq!(text, format!("\"{}\"", ty.as_str()));
            let back: ActionType = serde_json::from_str(&text).unwrap();
            assert_eq!(back, ty);
        }
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        let err = serde_json::from_value::<ActionSpec>(json!({
            "id": "a1",
            "type": "launch_rocket",
            "title": "nope"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn spec_defaults_match_planner_contract() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "id": "a1",
            "type": "scan_workspace",
            "title": "Scan"
        }))
        .unwrap();
        assert_eq!(spec.priority, 3);
        assert_eq!(spec.timeout_sec, 120);
        assert_eq!(spec.max_retries, 1);
        assert!(!spec.can_parallel);
        assert!(spec.depends_on.is_empty());
    }

    #[test]
    fn critical_actions_cover_writes_and_terminals() {
        assert!(ActionType::CreateFile.is_critical());
        assert!(ActionType::ApplyPatch.is_critical());
        assert!(ActionType::FinalAnswer.is_critical());
        assert!(ActionType::ReportBlocker.is_critical());
        assert!(!ActionType::ReadFiles.is_critical());
        assert!(!ActionType::RunTests.is_critical());
    }
}
