use std::process::Stdio;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use arbor_workspace::Workspace;

use crate::{ActionOutcome, ToolError};

const STREAM_CAP: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub(crate) struct ShellInput {
    #[serde(default)]
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

/// Shared runner for run_command/run_tests/run_lint/run_build. The command
/// executes under `sh -c` with its cwd clamped inside the workspace.
pub(crate) async fn run_shell(
    ws: &Workspace,
    input: ShellInput,
    cancel: CancellationToken,
) -> Result<ActionOutcome, ToolError> {
    let command_text = input.command.trim().to_string();
    if command_text.is_empty() {
        return Err(ToolError::InvalidInput(
            "command must not be empty".to_string(),
        ));
    }
    let cwd = ws.resolve(input.cwd.as_deref().unwrap_or(""))?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command_text)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ToolError::Io(format!("failed to spawn shell: {err}")))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout_pipe));
    let stderr_task = tokio::spawn(read_capped(stderr_pipe));

    let started = Instant::now();
    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ToolError::Cancelled);
        }
        status = child.wait() => {
            status.map_err(|err| ToolError::Io(format!("wait failed: {err}")))?
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);

    Ok(ActionOutcome::data(json!({
        "command": command_text,
        "exit_code": exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "stdout_truncated": stdout_truncated,
        "stderr_truncated": stderr_truncated,
        "duration_ms": duration_ms,
    })))
}

/// Drain a stream to EOF keeping only the first `STREAM_CAP` bytes.
async fn read_capped(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
) -> (String, bool) {
    let Some(mut stream) = stream else {
        return (String::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < STREAM_CAP {
                    let take = n.min(STREAM_CAP - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}
