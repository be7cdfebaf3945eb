use serde::Deserialize;
use serde_json::json;

use arbor_types::{FileChange, WriteResult};
use arbor_workspace::{apply_unified_diff, content_hash, unified_diff, Workspace};

use crate::{ActionOutcome, ToolError};

#[derive(Debug, Deserialize)]
pub(crate) struct WriteInput {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteInput {
    path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MoveInput {
    #[serde(alias = "old_path")]
    from: String,
    #[serde(alias = "new_path")]
    to: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PatchInput {
    path: String,
    #[serde(alias = "diff", alias = "patch")]
    diff_unified: String,
}

pub(crate) async fn write_file(ws: &Workspace, input: WriteInput) -> Result<ActionOutcome, ToolError> {
    let _guard = ws.lock_path(&input.path).await?;
    let before = ws.read_to_string(&input.path).await.unwrap_or_default();
    ws.write_file(&input.path, &input.content).await?;
    Ok(write_outcome(&input.path, before, input.content))
}

pub(crate) async fn apply_patch(ws: &Workspace, input: PatchInput) -> Result<ActionOutcome, ToolError> {
    let _guard = ws.lock_path(&input.path).await?;
    let before = ws.read_to_string(&input.path).await.unwrap_or_default();
    let after = apply_unified_diff(&before, &input.diff_unified)
        .map_err(|err| ToolError::InvalidInput(err.to_string()))?;
    ws.write_file(&input.path, &after).await?;
    Ok(write_outcome(&input.path, before, after))
}

pub(crate) async fn delete_file(ws: &Workspace, input: DeleteInput) -> Result<ActionOutcome, ToolError> {
    let _guard = ws.lock_path(&input.path).await?;
    let before = ws.read_to_string(&input.path).await.ok();
    ws.delete_item(&input.path).await?;

    let change = FileChange {
        file_path: input.path.clone(),
        file_content: String::new(),
        before_content: before.clone(),
        after_content: None,
        diff_unified: before
            .as_deref()
            .map(|content| unified_diff(content, "", &input.path)),
        before_hash: before.as_deref().map(content_hash),
        after_hash: None,
        write_result: WriteResult::Written,
        error: None,
    };
    Ok(ActionOutcome {
        output: json!({"path": input.path, "deleted": true}),
        file_changes: vec![change],
        ..ActionOutcome::default()
    })
}

pub(crate) async fn move_file(ws: &Workspace, input: MoveInput) -> Result<ActionOutcome, ToolError> {
    let _guard = ws.lock_path(&input.from).await?;
    let content = ws.read_to_string(&input.from).await.ok();
    ws.rename_item(&input.from, &input.to).await?;

    let change = FileChange {
        file_path: input.to.clone(),
        file_content: content.clone().unwrap_or_default(),
        before_content: None,
        after_content: content.clone(),
        diff_unified: None,
        before_hash: None,
        after_hash: content.as_deref().map(content_hash),
        write_result: WriteResult::Written,
        error: None,
    };
    Ok(ActionOutcome {
        output: json!({"from": input.from, "to": input.to, "moved": true}),
        file_changes: vec![change],
        ..ActionOutcome::default()
    })
}

fn write_outcome(path: &str, before: String, after: String) -> ActionOutcome {
    let diff = unified_diff(&before, &after, path);
    let change = FileChange {
        file_path: path.to_string(),
        file_content: after.clone(),
        before_hash: Some(content_hash(&before)),
        after_hash: Some(content_hash(&after)),
        before_content: Some(before.clone()),
        after_content: Some(after.clone()),
        diff_unified: Some(diff),
        write_result: WriteResult::Written,
        error: None,
    };
    ActionOutcome {
        output: json!({
            "path": path,
            "before_len": before.chars().count(),
            "after_len": after.chars().count(),
        }),
        file_changes: vec![change],
        ..ActionOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn workspace_with(path: &str, content: &str) -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write_file(path, content).await.unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn update_records_before_and_after_state() {
        let (_dir, ws) = workspace_with("util.ts", "export const a = 1;\n").await;
        let outcome = write_file(
            &ws,
            WriteInput {
                path: "util.ts".to_string(),
                content: "export const a = 2;\n".to_string(),
            },
        )
        .await
        .unwrap();

        let change = &outcome.file_changes[0];
        assert_eq!(change.before_content.as_deref(), Some("export const a = 1;\n"));
        assert_eq!(change.after_content.as_deref(), Some("export const a = 2;\n"));
        let diff = change.diff_unified.as_deref().unwrap();
        assert!(diff.contains("-export const a = 1;"));
        assert!(diff.contains("+export const a = 2;"));
        assert_ne!(change.before_hash, change.after_hash);
    }

    #[tokio::test]
    async fn patch_applies_or_reports_invalid_input() {
        let (_dir, ws) = workspace_with("a.txt", "one\ntwo\nthree\n").await;
        let diff = unified_diff("one\ntwo\nthree\n", "one\nTWO\nthree\n", "a.txt");
        let outcome = apply_patch(
            &ws,
            PatchInput {
                path: "a.txt".to_string(),
                diff_unified: diff,
            },
        )
        .await
        .unwrap();
        assert_eq!(ws.read_to_string("a.txt").await.unwrap(), "one\nTWO\nthree\n");
        assert_eq!(outcome.file_changes.len(), 1);

        let err = apply_patch(
            &ws,
            PatchInput {
                path: "a.txt".to_string(),
                diff_unified: "garbage".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "tool_invalid_input");
    }

    #[tokio::test]
    async fn delete_and_move_emit_changes() {
        let (_dir, ws) = workspace_with("old.rs", "fn old() {}\n").await;
        let outcome = move_file(
            &ws,
            MoveInput {
                from: "old.rs".to_string(),
                to: "new.rs".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.file_changes[0].file_path, "new.rs");
        assert!(ws.read_to_string("new.rs").await.is_ok());

        let outcome = delete_file(
            &ws,
            DeleteInput {
                path: "new.rs".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.output["deleted"], true);
        assert_eq!(
            outcome.file_changes[0].before_content.as_deref(),
            Some("fn old() {}\n")
        );
        assert!(ws.read_to_string("new.rs").await.is_err());
    }
}
