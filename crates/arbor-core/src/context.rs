use ignore::WalkBuilder;
use serde_json::{json, Value};

use arbor_types::{ActionRecord, ActionStatus, AiRequest};
use arbor_workspace::Workspace;

const MAX_SAMPLE_FILES: usize = 120;
const PREVIEW_CHARS: usize = 1200;
const RECENT_RECORDS: usize = 20;
const RECORD_OUTPUT_CAP: usize = 20_000;

const IGNORED_DIRS: [&str; 7] = [
    ".git",
    "node_modules",
    "dist",
    "build",
    "__pycache__",
    ".idea",
    "target",
];

/// Compact view of workspace + request + execution history injected into
/// every planner prompt.
pub async fn build_context_snapshot(
    workspace: &Workspace,
    request: &AiRequest,
    history: &[ActionRecord],
) -> Value {
    json!({
        "workspace": workspace_summary(workspace),
        "current_file": current_file_summary(workspace, request).await,
        "snippets": snippet_summary(request),
        "history": history_summary(history),
    })
}

fn workspace_summary(workspace: &Workspace) -> Value {
    let mut files = Vec::new();
    let mut total = 0usize;
    for entry in WalkBuilder::new(workspace.root()).hidden(false).build().flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(workspace.root()) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.split('/').any(|part| IGNORED_DIRS.contains(&part)) {
            continue;
        }
        total += 1;
        if files.len() < MAX_SAMPLE_FILES {
            files.push(rel);
        }
    }
    json!({
        "root": workspace.root().display().to_string(),
        "file_count": total,
        "sample_files": files,
    })
}

async fn current_file_summary(workspace: &Workspace, request: &AiRequest) -> Value {
    let Some(file_path) = request
        .current_file
        .as_deref()
        .or(request.file_path.as_deref())
    else {
        return json!({"file": null, "chars": 0, "reason": "no_target_file"});
    };

    let content = if request.current_file.as_deref() == Some(file_path) {
        request.current_code.clone()
    } else {
        None
    };
    let content = match content {
        Some(content) => content,
        None => match workspace.read_to_string(file_path).await {
            Ok(content) => content,
            Err(_) => {
                return json!({"file": file_path, "chars": 0, "reason": "file_not_readable"})
            }
        },
    };

    json!({
        "file": file_path,
        "chars": content.chars().count(),
        "preview": content.chars().take(PREVIEW_CHARS).collect::<String>(),
    })
}

fn snippet_summary(request: &AiRequest) -> Value {
    let snippets = request.snippets.as_deref().unwrap_or_default();
    json!({
        "count": snippets.len(),
        "paths": snippets
            .iter()
            .take(30)
            .map(|s| s.file_path.clone())
            .collect::<Vec<_>>(),
        "chars": snippets.iter().map(|s| s.content.chars().count()).sum::<usize>(),
    })
}

fn history_summary(history: &[ActionRecord]) -> Value {
    let completed = history
        .iter()
        .filter(|r| r.status == ActionStatus::Completed)
        .count();
    let failed = history
        .iter()
        .filter(|r| matches!(r.status, ActionStatus::Failed | ActionStatus::Blocked))
        .count();

    let recent: Vec<Value> = history
        .iter()
        .rev()
        .take(RECENT_RECORDS)
        .rev()
        .map(|record| {
            json!({
                "iteration": record.iteration,
                "action_id": record.action_id,
                "type": record.action_type.as_str(),
                "status": record.status,
                "error": record.error,
                "output": cap_output(&record.output),
            })
        })
        .collect();

    let has_write = history
        .iter()
        .any(|r| r.action_type.is_write() && r.status == ActionStatus::Completed);

    json!({
        "completed": completed,
        "failed": failed,
        "recent": recent,
        "has_write": has_write,
    })
}

/// Large tool outputs are cut down before they reach the prompt.
fn cap_output(output: &Value) -> Value {
    match output {
        Value::String(text) if text.chars().count() > RECORD_OUTPUT_CAP => {
            Value::String(text.chars().take(RECORD_OUTPUT_CAP).collect())
        }
        Value::Object(map) => {
            let mut capped = map.clone();
            for value in capped.values_mut() {
                if let Value::String(text) = value {
                    if text.chars().count() > RECORD_OUTPUT_CAP {
                        *value = Value::String(text.chars().take(RECORD_OUTPUT_CAP).collect());
                    }
                }
            }
            Value::Object(capped)
        }
        other => other.clone(),
    }
}
