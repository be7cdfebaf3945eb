use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;

use arbor_core::{AgentEngine, EngineConfig};
use arbor_providers::{ChatClient, ProviderError};
use arbor_types::{
    ActionStatus, AiRequest, ChatMessage, ChatOptions, ChatOutcome, EventStatus, PromptMessage,
    Role, RunStatus, TokenSource, TokenUsage, WriteResult,
};
use arbor_workspace::Workspace;

/// Plays back canned planner responses in order and counts calls.
struct ScriptedChat {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedChat {
    fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn chat(
        &self,
        _provider_id: &str,
        messages: &[PromptMessage],
        _options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| batch_final("No more scripted responses."));
        Ok(ChatOutcome {
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
            content,
            usage: TokenUsage::new(10, 5, TokenSource::Estimated),
            prompt_messages: messages.to_vec(),
            elapsed_ms: 1,
        })
    }
}

fn batch_final(content: &str) -> String {
    json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "answer the user",
        "decision": {"mode": "done", "needs_user_trigger": false},
        "actions": [{
            "id": "a1",
            "type": "final_answer",
            "title": "Answer",
            "reason": "question can be answered directly",
            "input": {"content": content},
        }],
    })
    .to_string()
}

fn request(content: &str) -> AiRequest {
    AiRequest {
        provider: "scripted".to_string(),
        messages: vec![ChatMessage::new(Role::User, content)],
        current_file: None,
        current_code: None,
        file_path: None,
        snippets: None,
        chat_only: false,
        planning_mode: false,
        force_code_edit: false,
        history_config: None,
    }
}

fn engine_with(
    dir: &tempfile::TempDir,
    responses: Vec<String>,
) -> (AgentEngine, Arc<ScriptedChat>) {
    let chat = ScriptedChat::new(responses);
    let workspace = Workspace::new(dir.path()).unwrap();
    let engine = AgentEngine::new(chat.clone(), workspace, EngineConfig::default());
    (engine, chat)
}

#[tokio::test]
async fn simple_chat_completes_with_final_answer() {
    let dir = tempdir().unwrap();
    let (engine, chat) = engine_with(&dir, vec![batch_final("This file parses config.")]);

    let mut req = request("Explain this file");
    req.current_file = Some("src/a.py".to_string());
    req.chat_only = true;
    let response = engine.chat(req).await;

    assert_eq!(response.content, "This file parses config.");
    assert!(response.changes.is_none());
    let run = response.run.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.result_content.is_some());
    assert_eq!(chat.call_count(), 1);
}

#[tokio::test]
async fn generate_new_file_writes_workspace_and_reports_hash() {
    let dir = tempdir().unwrap();
    let body = "def main():\n    print('hello')\n";
    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "create hello.py",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [
            {
                "id": "a1",
                "type": "create_file",
                "title": "Create hello.py",
                "reason": "user asked for a new script",
                "input": {"path": "hello.py", "content": body},
            },
            {
                "id": "a2",
                "type": "final_answer",
                "title": "Report",
                "reason": "file created",
                "input": {"content": "Created hello.py"},
                "depends_on": ["a1"],
            },
        ],
    })
    .to_string();
    let (engine, _chat) = engine_with(&dir, vec![script]);

    let response = engine.chat(request("create hello.py")).await;

    let changes = response.changes.unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.file_path, "hello.py");
    assert_eq!(change.write_result, WriteResult::Written);

    let written = std::fs::read_to_string(dir.path().join("hello.py")).unwrap();
    assert_eq!(written, body);
    assert_eq!(
        change.after_hash.as_deref().unwrap(),
        arbor_workspace::content_hash(&written)
    );
    assert_eq!(response.run.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn modify_existing_file_carries_diff_preview() {
    let dir = tempdir().unwrap();
    let before = "export const x = 1;\n";
    let after = "export const x = 2;\n";
    std::fs::write(dir.path().join("util.ts"), before).unwrap();

    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "bump constant",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [
            {
                "id": "a1",
                "type": "update_file",
                "title": "Update util.ts",
                "reason": "user asked for the change",
                "input": {"path": "util.ts", "content": after},
            },
            {
                "id": "a2",
                "type": "final_answer",
                "title": "Report",
                "reason": "change applied",
                "input": {"content": "util.ts updated"},
                "depends_on": ["a1"],
            },
        ],
    })
    .to_string();
    let (engine, _chat) = engine_with(&dir, vec![script]);

    let response = engine.chat(request("modify util.ts")).await;
    let run_id = response.run_id.clone().unwrap();

    let change = &response.changes.as_ref().unwrap()[0];
    assert_eq!(change.before_content.as_deref(), Some(before));
    let diff = change.diff_unified.as_deref().unwrap();
    assert!(diff.contains("-export const x = 1;"));
    assert!(diff.contains("+export const x = 2;"));

    // The polled snapshot exposes the same change.
    let snapshot = engine.get(&run_id).await.unwrap();
    assert_eq!(snapshot.result_changes.len(), 1);
    assert_eq!(
        snapshot.result_changes[0].diff_unified.as_deref(),
        Some(diff)
    );
}

#[tokio::test]
async fn ask_user_suspends_then_reply_resumes() {
    let dir = tempdir().unwrap();
    let ask = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "need the python version",
        "decision": {"mode": "ask_user", "needs_user_trigger": true},
        "actions": [{
            "id": "a1",
            "type": "ask_user",
            "title": "Clarify runtime",
            "reason": "version not specified",
            "input": {"question": "Which Python version?"},
        }],
    })
    .to_string();
    let (engine, chat) = engine_with(&dir, vec![ask, batch_final("Using Python 3.11.")]);

    let response = engine.chat(request("set up the project")).await;
    let run_id = response.run_id.clone().unwrap();
    let run = response.run.unwrap();
    assert_eq!(run.status, RunStatus::WaitingUser);
    assert!(response.needs_user_trigger);
    assert_eq!(run.pending_action_ids, vec!["a1".to_string()]);

    let response = engine
        .reply(&run_id, "use Python 3.11".to_string())
        .await
        .unwrap();
    let run = response.run.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(response.content, "Using Python 3.11.");

    // The reply landed as a user message and closed the ask action.
    assert!(run
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content == "use Python 3.11"));
    let ask_record = run
        .action_history
        .iter()
        .find(|r| r.action_id == "a1")
        .unwrap();
    assert_eq!(ask_record.status, ActionStatus::Completed);
    assert_eq!(ask_record.output["reply"], "use Python 3.11");
    assert_eq!(chat.call_count(), 2);

    // Replying to a non-waiting run conflicts.
    let err = engine.reply(&run_id, "again".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), "run_conflict");
}

#[tokio::test]
async fn cancel_mid_command_stops_within_a_second() {
    let dir = tempdir().unwrap();
    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "long command",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [{
            "id": "a1",
            "type": "run_command",
            "title": "Sleep",
            "reason": "simulated long build",
            "input": {"command": "sleep 30"},
            "timeout_sec": 60,
        }],
    })
    .to_string();
    let (engine, chat) = engine_with(&dir, vec![script]);

    let run_id = engine.start(request("run the build")).await;
    let ticker = {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { engine.continue_run(&run_id).await })
    };

    // Let the command start, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel(&run_id).await.unwrap();

    let started = std::time::Instant::now();
    loop {
        let snapshot = engine.get(&run_id).await.unwrap();
        if snapshot.status == RunStatus::Cancelled {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "run did not cancel in time: {:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let _ = ticker.await.unwrap();
    let snapshot = engine.get(&run_id).await.unwrap();
    let record = snapshot
        .action_history
        .iter()
        .find(|r| r.action_id == "a1")
        .unwrap();
    assert!(matches!(
        record.status,
        ActionStatus::Cancelled | ActionStatus::Failed
    ));
    // No planner call after cancellation.
    assert_eq!(chat.call_count(), 1);
    // Cancelled runs never report written changes.
    assert!(snapshot
        .result_changes
        .iter()
        .all(|c| c.write_result != WriteResult::Written));
}

#[tokio::test]
async fn path_escape_fails_action_without_killing_the_run() {
    let dir = tempdir().unwrap();
    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "read system file",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [{
            "id": "a1",
            "type": "read_files",
            "title": "Read passwd",
            "reason": "inspect",
            "input": {"paths": ["../../etc/passwd"]},
        }],
    })
    .to_string();
    let (engine, _chat) = engine_with(&dir, vec![script]);

    let response = engine.chat(request("read that file")).await;
    let run = response.run.unwrap();

    let record = run
        .action_history
        .iter()
        .find(|r| r.action_id == "a1")
        .unwrap();
    assert_eq!(record.status, ActionStatus::Failed);
    assert_eq!(record.output["error_kind"], "tool_path_escape");
    assert!(!run.status.is_terminal());
}

#[tokio::test]
async fn repeated_invalid_planner_output_fails_the_run() {
    let dir = tempdir().unwrap();
    let garbage = "this is not json".to_string();
    let (engine, chat) = engine_with(&dir, vec![garbage.clone(), garbage.clone(), garbage]);

    let response = engine.chat(request("do something")).await;
    let run = response.run.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(response.content.contains("Planning failed"));
    // Initial attempt plus two repair retries.
    assert_eq!(chat.call_count(), 3);
    let failed_event = run
        .events
        .iter()
        .find(|e| e.status == EventStatus::Failed)
        .unwrap();
    assert_eq!(failed_event.error.as_deref(), Some("planner_invalid_output"));
}

#[tokio::test]
async fn events_are_ordered_and_dependencies_execute_first() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("lib.rs"), "pub fn a() {}\n").unwrap();
    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "inspect then answer",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [
            {
                "id": "a2",
                "type": "read_files",
                "title": "Read lib.rs",
                "reason": "inspect",
                "input": {"paths": ["lib.rs"]},
                "depends_on": ["a1"],
            },
            {
                "id": "a1",
                "type": "scan_workspace",
                "title": "Scan",
                "reason": "index first",
                "input": {},
            },
            {
                "id": "a3",
                "type": "final_answer",
                "title": "Answer",
                "reason": "done",
                "input": {"content": "Inspected."},
                "depends_on": ["a2"],
            },
        ],
    })
    .to_string();
    let (engine, _chat) = engine_with(&dir, vec![script]);

    let response = engine.chat(request("inspect the workspace")).await;
    let run = response.run.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    for pair in run.events.windows(2) {
        assert!(pair[0].event_id < pair[1].event_id);
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    let completed_of = |id: &str| {
        run.events
            .iter()
            .position(|e| {
                e.action_id.as_deref() == Some(id) && e.status == EventStatus::Completed
            })
            .unwrap()
    };
    let running_of = |id: &str| {
        run.events
            .iter()
            .position(|e| e.action_id.as_deref() == Some(id) && e.status == EventStatus::Running)
            .unwrap()
    };
    assert!(completed_of("a1") < running_of("a2"));
    assert!(completed_of("a2") < running_of("a3"));
}

#[tokio::test]
async fn continue_on_completed_run_is_idempotent() {
    let dir = tempdir().unwrap();
    let (engine, chat) = engine_with(&dir, vec![batch_final("Done.")]);

    let response = engine.chat(request("say done")).await;
    let run_id = response.run_id.unwrap();
    assert_eq!(chat.call_count(), 1);

    let first = engine.continue_run(&run_id).await.unwrap();
    let second = engine.continue_run(&run_id).await.unwrap();

    // No extra planner calls, byte-identical payloads.
    assert_eq!(chat.call_count(), 1);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[tokio::test]
async fn failed_prerequisite_skips_dependents() {
    let dir = tempdir().unwrap();
    let script = json!({
        "version": "1.0",
        "iteration": 1,
        "summary": "doomed chain",
        "decision": {"mode": "continue", "needs_user_trigger": false},
        "actions": [
            {
                "id": "a1",
                "type": "run_tests",
                "title": "Run tests",
                "reason": "check",
                "input": {"command": ""},
            },
            {
                "id": "a2",
                "type": "run_lint",
                "title": "Lint",
                "reason": "after tests",
                "input": {"command": "true"},
                "depends_on": ["a1"],
            },
        ],
    })
    .to_string();
    let (engine, _chat) = engine_with(&dir, vec![script]);

    let response = engine.chat(request("test then lint")).await;
    let run = response.run.unwrap();

    let a1 = run
        .action_history
        .iter()
        .find(|r| r.action_id == "a1")
        .unwrap();
    assert_eq!(a1.status, ActionStatus::Failed);
    let a2 = run
        .action_history
        .iter()
        .find(|r| r.action_id == "a2")
        .unwrap();
    assert_eq!(a2.status, ActionStatus::Skipped);
    assert!(!run.status.is_terminal());
}

#[tokio::test]
async fn pause_request_parks_the_run_at_next_tick() {
    let dir = tempdir().unwrap();
    let (engine, _chat) = engine_with(&dir, vec![batch_final("Resumed and finished.")]);

    let run_id = engine.start(request("anything")).await;
    engine.pause(&run_id).await.unwrap();

    let response = engine.continue_run(&run_id).await.unwrap();
    let run = response.run.unwrap();
    assert_eq!(run.status, RunStatus::Paused);

    engine.resume(&run_id).await.unwrap();
    let response = engine.continue_run(&run_id).await.unwrap();
    assert_eq!(response.run.unwrap().status, RunStatus::Completed);
}
