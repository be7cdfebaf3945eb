use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use arbor_providers::ChatClient;
use arbor_types::{ChatMessage, ChatOptions, HistoryConfig, PromptMessage, Role};

const SUMMARY_SYSTEM_PROMPT: &str =
    "Compress the prior conversation turns. Preserve decisions, constraints, and open questions.";
const ELLIPSIS: &str = " … ";

/// The bounded view of a conversation handed to the planner. The run keeps
/// full history; this is derived per LLM call.
#[derive(Debug, Clone)]
pub struct CompactedHistory {
    pub window: Vec<ChatMessage>,
    pub summary: Option<String>,
    pub omitted: usize,
}

impl CompactedHistory {
    /// Window plus the synthetic summary message, ready for prompt assembly.
    pub fn prompt_messages(&self) -> Vec<PromptMessage> {
        let mut out = Vec::with_capacity(self.window.len() + 1);
        if let Some(summary) = &self.summary {
            out.push(PromptMessage::new(
                Role::System,
                format!("Summary of earlier conversation: {summary}"),
            ));
        }
        out.extend(
            self.window
                .iter()
                .map(|m| PromptMessage::new(m.role, m.content.clone())),
        );
        out
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str, max_chars: usize) -> anyhow::Result<String>;
}

/// Summarizer backed by the provider adapter.
pub struct ProviderSummarizer {
    chat: Arc<dyn ChatClient>,
    provider_id: String,
}

impl ProviderSummarizer {
    pub fn new(chat: Arc<dyn ChatClient>, provider_id: impl Into<String>) -> Self {
        Self {
            chat,
            provider_id: provider_id.into(),
        }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, transcript: &str, max_chars: usize) -> anyhow::Result<String> {
        let messages = vec![
            PromptMessage::new(Role::System, SUMMARY_SYSTEM_PROMPT),
            PromptMessage::new(Role::User, transcript.to_string()),
        ];
        let options = ChatOptions {
            temperature: 0.1,
            max_tokens: (max_chars / 2).max(256) as u64,
            ..ChatOptions::default()
        };
        let outcome = self.chat.chat(&self.provider_id, &messages, &options).await?;
        Ok(truncate_chars(outcome.content.trim(), max_chars))
    }
}

/// Derives the planner's bounded history view. Summaries are cached by a hash
/// of the omitted prefix so they are recomputed only when that prefix changes.
#[derive(Clone, Default)]
pub struct HistoryCompactor {
    summary_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl HistoryCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn compact(
        &self,
        messages: &[ChatMessage],
        config: &HistoryConfig,
        summarizer: &dyn Summarizer,
    ) -> CompactedHistory {
        let split = messages.len().saturating_sub(config.turns.max(1));
        let (older, recent) = messages.split_at(split);

        let window: Vec<ChatMessage> = recent
            .iter()
            .map(|message| {
                let mut message = message.clone();
                message.content =
                    truncate_middle(&message.content, config.max_chars_per_message);
                message
            })
            .collect();

        let summary = if config.summary_enabled && !older.is_empty() {
            Some(self.summarize_prefix(older, config, summarizer).await)
        } else {
            None
        };

        CompactedHistory {
            window,
            summary,
            omitted: older.len(),
        }
    }

    async fn summarize_prefix(
        &self,
        older: &[ChatMessage],
        config: &HistoryConfig,
        summarizer: &dyn Summarizer,
    ) -> String {
        let transcript = transcript_of(older);
        let key = prefix_key(&transcript);

        if let Some(cached) = self.summary_cache.read().await.get(&key) {
            return cached.clone();
        }

        let summary = match summarizer
            .summarize(&transcript, config.summary_max_chars)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!("history summarization failed, using plain digest: {err}");
                truncate_chars(&transcript, config.summary_max_chars)
            }
        };

        self.summary_cache
            .write()
            .await
            .insert(key, summary.clone());
        summary
    }
}

fn transcript_of(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role.as_str(), m.content.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn prefix_key(transcript: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(transcript.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keep the first and last `max_chars / 2` characters with an ellipsis marker
/// between them. Char-based so multi-byte text never splits.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars || max_chars == 0 {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text
        .chars()
        .skip(total - half)
        .collect();
    format!("{head}{ELLIPSIS}{tail}")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    impl CountingSummarizer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _transcript: &str, _max_chars: usize) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("earlier turns summary".to_string())
        }
    }

    fn turns(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                ChatMessage::new(role, format!("message {i}"))
            })
            .collect()
    }

    #[tokio::test]
    async fn window_preserves_recent_messages_unchanged() {
        let compactor = HistoryCompactor::new();
        let summarizer = CountingSummarizer::new();
        let messages = turns(10);
        let config = HistoryConfig {
            turns: 4,
            ..HistoryConfig::default()
        };
        let compacted = compactor.compact(&messages, &config, &summarizer).await;
        assert_eq!(compacted.omitted, 6);
        assert_eq!(compacted.window.len(), 4);
        for (got, want) in compacted.window.iter().zip(&messages[6..]) {
            assert_eq!(got.content, want.content);
        }
        assert_eq!(compacted.summary.as_deref(), Some("earlier turns summary"));
    }

    #[tokio::test]
    async fn summary_cached_until_prefix_changes() {
        let compactor = HistoryCompactor::new();
        let summarizer = CountingSummarizer::new();
        let mut messages = turns(8);
        let config = HistoryConfig {
            turns: 2,
            ..HistoryConfig::default()
        };

        compactor.compact(&messages, &config, &summarizer).await;
        compactor.compact(&messages, &config, &summarizer).await;
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

        // Growing the tail shifts the window and changes the prefix.
        messages.push(ChatMessage::new(Role::User, "one more"));
        compactor.compact(&messages, &config, &summarizer).await;
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_summary_when_disabled_or_nothing_omitted() {
        let compactor = HistoryCompactor::new();
        let summarizer = CountingSummarizer::new();

        let few = turns(3);
        let config = HistoryConfig {
            turns: 10,
            ..HistoryConfig::default()
        };
        let compacted = compactor.compact(&few, &config, &summarizer).await;
        assert!(compacted.summary.is_none());
        assert_eq!(compacted.omitted, 0);

        let many = turns(10);
        let disabled = HistoryConfig {
            turns: 2,
            summary_enabled: false,
            ..HistoryConfig::default()
        };
        let compacted = compactor.compact(&many, &disabled, &summarizer).await;
        assert!(compacted.summary.is_none());
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn truncate_middle_keeps_both_ends() {
        let text = "0123456789";
        let out = truncate_middle(text, 6);
        assert_eq!(out, format!("012{ELLIPSIS}789"));
        assert_eq!(truncate_middle("short", 10), "short");
    }

    #[test]
    fn truncate_middle_is_char_safe() {
        let text = "日本語のテキストです".repeat(10);
        let out = truncate_middle(&text, 8);
        assert!(out.contains(ELLIPSIS));
        assert_eq!(out.chars().count(), 8 + ELLIPSIS.chars().count());
    }

    #[tokio::test]
    async fn oversized_window_messages_are_middle_truncated() {
        let compactor = HistoryCompactor::new();
        let summarizer = CountingSummarizer::new();
        let messages = vec![ChatMessage::new(Role::User, "a".repeat(100))];
        let config = HistoryConfig {
            turns: 5,
            max_chars_per_message: 10,
            ..HistoryConfig::default()
        };
        let compacted = compactor.compact(&messages, &config, &summarizer).await;
        let content = &compacted.window[0].content;
        assert!(content.starts_with("aaaaa"));
        assert!(content.ends_with("aaaaa"));
        assert!(content.contains(ELLIPSIS));
    }
}
