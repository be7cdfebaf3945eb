use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use arbor_types::{ActionRecord, ActionSpec, ActionType, FileChange};
use arbor_workspace::{Workspace, WorkspaceError};

mod inspect;
mod mutate;
mod shell;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("path escape: {path}")]
    PathEscape { path: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ToolError {
    /// Stable kind string from the engine error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::PathEscape { .. } => "tool_path_escape",
            ToolError::NotFound(_) => "tool_not_found",
            ToolError::Io(_) => "tool_io",
            ToolError::Timeout(_) => "tool_timeout",
            ToolError::Cancelled => "tool_cancelled",
            ToolError::InvalidInput(_) => "tool_invalid_input",
        }
    }

    /// Whether the executor may retry the action.
    pub fn retryable(&self) -> bool {
        matches!(self, ToolError::Io(_) | ToolError::Timeout(_))
    }
}

impl From<WorkspaceError> for ToolError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::PathEscape { path } => ToolError::PathEscape { path },
            WorkspaceError::NotFound { path } => ToolError::NotFound(path),
            other => ToolError::Io(other.to_string()),
        }
    }
}

/// Normalized result of one executed action.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub output: Value,
    pub file_changes: Vec<FileChange>,
    pub assistant_message: Option<String>,
    pub final_answer: Option<String>,
    /// Action suspends the run until the user replies.
    pub waiting_user: bool,
    /// Action declares the run blocked.
    pub blocker: Option<String>,
}

impl ActionOutcome {
    fn data(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Read-only run state a tool may consult.
pub struct ToolContext<'a> {
    pub history: &'a [ActionRecord],
}

/// Executes the closed action set against one workspace. Side effects are
/// confined to the workspace root; every path is resolved before I/O.
#[derive(Clone)]
pub struct ToolExecutor {
    workspace: Workspace,
}

impl ToolExecutor {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run one action under its `timeout_sec` and the run's cancellation
    /// token. Child processes are killed on either signal.
    pub async fn execute(
        &self,
        action: &ActionSpec,
        ctx: &ToolContext<'_>,
        cancel: CancellationToken,
    ) -> Result<ActionOutcome, ToolError> {
        let timeout = Duration::from_secs(action.timeout_sec.max(1));
        let scoped = cancel.child_token();
        let work = self.dispatch(action, ctx, scoped.clone());

        tokio::select! {
            _ = cancel.cancelled() => {
                scoped.cancel();
                Err(ToolError::Cancelled)
            }
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    scoped.cancel();
                    Err(ToolError::Timeout(action.timeout_sec))
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action: &ActionSpec,
        ctx: &ToolContext<'_>,
        cancel: CancellationToken,
    ) -> Result<ActionOutcome, ToolError> {
        let ws = &self.workspace;
        match action.action_type {
            ActionType::ScanWorkspace => {
                inspect::scan_workspace(ws, parse_input(&action.input)?).await
            }
            ActionType::ReadFiles => inspect::read_files(ws, parse_input(&action.input)?).await,
            ActionType::SearchCode => inspect::search_code(ws, parse_input(&action.input)?).await,
            ActionType::ExtractSymbols => {
                inspect::extract_symbols(ws, parse_input(&action.input)?).await
            }
            ActionType::AnalyzeDependencies => {
                inspect::analyze_dependencies(ws, parse_input(&action.input)?).await
            }
            ActionType::SummarizeContext => Ok(inspect::summarize_context(ctx.history)),
            ActionType::ProposeSubplan => Ok(inspect::propose_subplan(&action.input)),
            ActionType::RunCommand
            | ActionType::RunTests
            | ActionType::RunLint
            | ActionType::RunBuild => {
                shell::run_shell(ws, parse_input(&action.input)?, cancel).await
            }
            ActionType::CreateFile | ActionType::UpdateFile => {
                mutate::write_file(ws, parse_input(&action.input)?).await
            }
            ActionType::DeleteFile => mutate::delete_file(ws, parse_input(&action.input)?).await,
            ActionType::MoveFile => mutate::move_file(ws, parse_input(&action.input)?).await,
            ActionType::ApplyPatch => mutate::apply_patch(ws, parse_input(&action.input)?).await,
            ActionType::ValidateResult => Ok(inspect::validate_result(
                parse_input(&action.input)?,
                ctx.history,
            )),
            ActionType::AskUser => {
                let question = string_field(&action.input, "question")
                    .unwrap_or_else(|| "More information is needed to continue.".to_string());
                Ok(ActionOutcome {
                    output: json!({"question": question}),
                    assistant_message: Some(question),
                    waiting_user: true,
                    ..ActionOutcome::default()
                })
            }
            ActionType::RequestApproval => {
                let prompt = string_field(&action.input, "prompt")
                    .unwrap_or_else(|| "This action needs your approval to continue.".to_string());
                let summary = string_field(&action.input, "action_summary");
                Ok(ActionOutcome {
                    output: json!({"prompt": prompt, "action_summary": summary}),
                    assistant_message: Some(prompt),
                    waiting_user: true,
                    ..ActionOutcome::default()
                })
            }
            ActionType::FinalAnswer => {
                let content = string_field(&action.input, "content")
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| {
                        ToolError::InvalidInput("final_answer requires input.content".to_string())
                    })?;
                Ok(ActionOutcome {
                    output: action.input.clone(),
                    assistant_message: Some(content.clone()),
                    final_answer: Some(content),
                    ..ActionOutcome::default()
                })
            }
            ActionType::ReportBlocker => {
                let reason = string_field(&action.input, "reason")
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| action.reason.clone());
                Ok(ActionOutcome {
                    output: json!({"reason": reason}),
                    assistant_message: Some(reason.clone()),
                    blocker: Some(reason),
                    ..ActionOutcome::default()
                })
            }
        }
    }
}

fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    let value = if input.is_null() {
        json!({})
    } else {
        input.clone()
    };
    serde_json::from_value(value).map_err(|err| ToolError::InvalidInput(err.to_string()))
}

fn string_field(input: &Value, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::WriteResult;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ToolExecutor) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ToolExecutor::new(ws))
    }

    fn action(action_type: ActionType, input: Value) -> ActionSpec {
        serde_json::from_value(json!({
            "id": "a1",
            "type": action_type.as_str(),
            "title": action_type.as_str(),
            "input": input,
        }))
        .unwrap()
    }

    async fn run(
        executor: &ToolExecutor,
        spec: &ActionSpec,
    ) -> Result<ActionOutcome, ToolError> {
        executor
            .execute(spec, &ToolContext { history: &[] }, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn create_file_emits_change_with_hashes_and_diff() {
        let (_dir, executor) = setup();
        let spec = action(
            ActionType::CreateFile,
            json!({"path": "hello.py", "content": "print('hi')\n"}),
        );
        let outcome = run(&executor, &spec).await.unwrap();
        assert_eq!(outcome.file_changes.len(), 1);
        let change = &outcome.file_changes[0];
        assert_eq!(change.file_path, "hello.py");
        assert_eq!(change.write_result, WriteResult::Written);
        assert_eq!(
            change.after_hash.as_deref(),
            Some(arbor_workspace::content_hash("print('hi')\n").as_str())
        );
        assert!(change.diff_unified.as_deref().unwrap().contains("+print('hi')"));
        let written = executor.workspace().read_to_string("hello.py").await.unwrap();
        assert_eq!(written, "print('hi')\n");
    }

    #[tokio::test]
    async fn path_escape_fails_before_io() {
        let (_dir, executor) = setup();
        let spec = action(
            ActionType::ReadFiles,
            json!({"paths": ["../../etc/passwd"]}),
        );
        let err = run(&executor, &spec).await.unwrap_err();
        assert_eq!(err.kind(), "tool_path_escape");

        let spec = action(
            ActionType::CreateFile,
            json!({"path": "../escape.txt", "content": "x"}),
        );
        let err = run(&executor, &spec).await.unwrap_err();
        assert_eq!(err.kind(), "tool_path_escape");
    }

    #[tokio::test]
    async fn ask_user_suspends_and_carries_question() {
        let (_dir, executor) = setup();
        let spec = action(ActionType::AskUser, json!({"question": "Which Python?"}));
        let outcome = run(&executor, &spec).await.unwrap();
        assert!(outcome.waiting_user);
        assert_eq!(outcome.output["question"], "Which Python?");
        assert_eq!(outcome.assistant_message.as_deref(), Some("Which Python?"));
    }

    #[tokio::test]
    async fn final_answer_requires_content() {
        let (_dir, executor) = setup();
        let spec = action(ActionType::FinalAnswer, json!({}));
        let err = run(&executor, &spec).await.unwrap_err();
        assert_eq!(err.kind(), "tool_invalid_input");

        let spec = action(ActionType::FinalAnswer, json!({"content": "All done."}));
        let outcome = run(&executor, &spec).await.unwrap();
        assert_eq!(outcome.final_answer.as_deref(), Some("All done."));
        assert!(!outcome.waiting_user);
    }

    #[tokio::test]
    async fn command_timeout_kills_the_process() {
        let (_dir, executor) = setup();
        let mut spec = action(ActionType::RunCommand, json!({"command": "sleep 30"}));
        spec.timeout_sec = 1;
        let err = run(&executor, &spec).await.unwrap_err();
        assert_eq!(err.kind(), "tool_timeout");
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn cancellation_interrupts_running_command() {
        let (_dir, executor) = setup();
        let spec = action(ActionType::RunCommand, json!({"command": "sleep 30"}));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = executor
            .execute(&spec, &ToolContext { history: &[] }, cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
