use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::json;

use arbor_types::{PromptMessage, TokenUsage};

/// Append one provider interaction to `ai_YYYY-MM-DD.jsonl` under the logs
/// directory. Logging failures are reported but never fail the call.
#[allow(clippy::too_many_arguments)]
pub fn log_interaction(
    logs_dir: Option<&Path>,
    provider: &str,
    model: &str,
    prompt_messages: &[PromptMessage],
    response: Option<&str>,
    error: Option<&str>,
    elapsed_ms: u64,
    usage: Option<TokenUsage>,
) {
    if let Some(dir) = logs_dir {
        let record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "provider": provider,
            "model": model,
            "elapsed_ms": elapsed_ms,
            "prompt_messages": prompt_messages,
            "response": response,
            "error": error,
            "tokens": usage,
        });
        if let Err(err) = append_line(dir, &record.to_string()) {
            tracing::warn!("failed to write interaction log: {err}");
        }
    }

    match error {
        Some(error) => tracing::error!(provider, model, elapsed_ms, "llm call failed: {error}"),
        None => {
            let preview: String = response
                .unwrap_or_default()
                .chars()
                .take(120)
                .collect::<String>()
                .replace('\n', "\\n");
            tracing::info!(
                provider,
                model,
                elapsed_ms,
                response_len = response.map(|r| r.len()).unwrap_or(0),
                "llm call ok: {preview}"
            );
        }
    }
}

fn append_line(dir: &Path, line: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = dir.join(format!("ai_{}.jsonl", Utc::now().format("%Y-%m-%d")));
    let mut handle = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)?;
    writeln!(handle, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::Role;
    use tempfile::tempdir;

    #[test]
    fn writes_one_jsonl_record_per_call() {
        let dir = tempdir().unwrap();
        let messages = vec![PromptMessage::new(Role::User, "hello")];
        log_interaction(
            Some(dir.path()),
            "openai",
            "gpt-4o",
            &messages,
            Some("hi"),
            None,
            42,
            None,
        );
        log_interaction(
            Some(dir.path()),
            "openai",
            "gpt-4o",
            &messages,
            None,
            Some("boom"),
            0,
            None,
        );

        let file = dir
            .path()
            .join(format!("ai_{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["provider"], "openai");
        assert_eq!(first["response"], "hi");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["error"], "boom");
    }
}
