use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use arbor_types::{ChatOptions, ChatOutcome, PromptMessage, ProviderInfo, Role};

mod anthropic;
mod interaction_log;
mod openai;
mod retry;

pub use anthropic::AnthropicProvider;
pub use interaction_log::log_interaction;
pub use openai::OpenAiCompatProvider;
pub use retry::backoff_delays;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    RateLimited,
    Timeout,
    BadResponse,
    Transport,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "provider_auth",
            ProviderErrorKind::RateLimited => "provider_rate_limit",
            ProviderErrorKind::Timeout => "provider_timeout",
            ProviderErrorKind::BadResponse => "provider_bad_response",
            ProviderErrorKind::Transport => "provider_transport",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Transport
        );
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }
}

/// One vendor adapter. Implementations receive the fully compiled prompt and
/// must not mutate it.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn chat(
        &self,
        messages: &[PromptMessage],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError>;
}

/// The narrow surface the planner and tools depend on; tests inject scripted
/// fakes behind it.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        provider_id: &str,
        messages: &[PromptMessage],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    logs_dir: Option<PathBuf>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>, logs_dir: Option<PathBuf>) -> Self {
        Self {
            providers,
            logs_dir,
        }
    }

    /// Build from environment. Absent credentials simply omit the provider.
    pub fn from_env(logs_dir: Option<PathBuf>) -> Self {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

        if let Some(api_key) = non_empty_env("OPENAI_API_KEY") {
            providers.push(Arc::new(OpenAiCompatProvider::new(
                "openai",
                "OpenAI",
                non_empty_env("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                Some(api_key),
                non_empty_env("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            )));
        }
        if let Some(api_key) = non_empty_env("ANTHROPIC_API_KEY") {
            providers.push(Arc::new(AnthropicProvider::new(
                api_key,
                non_empty_env("ANTHROPIC_MODEL")
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            )));
        }
        if let Some(base_url) = non_empty_env("CUSTOM_BASE_URL") {
            providers.push(Arc::new(OpenAiCompatProvider::new(
                "custom",
                "Custom",
                base_url,
                non_empty_env("CUSTOM_API_KEY"),
                non_empty_env("CUSTOM_MODEL").unwrap_or_else(|| "custom".to_string()),
            )));
        }

        Self::new(providers, logs_dir)
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    fn select(&self, provider_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(provider) = self
            .providers
            .iter()
            .find(|p| p.info().id == provider_id)
        {
            return Ok(provider.clone());
        }
        self.providers.first().cloned().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::Auth,
                format!("no provider configured for `{provider_id}` and no fallback available"),
            )
        })
    }
}

#[async_trait]
impl ChatClient for ProviderRegistry {
    async fn chat(
        &self,
        provider_id: &str,
        messages: &[PromptMessage],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let provider = self.select(provider_id)?;
        let compiled = compile_messages(messages, options);

        let result = retry::with_backoff(|| provider.chat(&compiled, options)).await;

        let info = provider.info();
        match &result {
            Ok(outcome) => log_interaction(
                self.logs_dir.as_deref(),
                &info.id,
                &info.model,
                &compiled,
                Some(&outcome.content),
                None,
                outcome.elapsed_ms,
                Some(outcome.usage),
            ),
            Err(err) => log_interaction(
                self.logs_dir.as_deref(),
                &info.id,
                &info.model,
                &compiled,
                None,
                Some(&err.to_string()),
                0,
                None,
            ),
        }
        result
    }
}

/// Apply the system-prompt override without touching the caller's slice.
fn compile_messages(messages: &[PromptMessage], options: &ChatOptions) -> Vec<PromptMessage> {
    let mut compiled: Vec<PromptMessage> = messages.to_vec();
    if let Some(system) = &options.system_prompt_override {
        match compiled.iter().position(|m| m.role == Role::System) {
            Some(idx) => compiled[idx].content = system.clone(),
            None => compiled.insert(0, PromptMessage::new(Role::System, system.clone())),
        }
    }
    compiled
}

/// `ceil(utf8_bytes / 4)`, the estimate used when a vendor omits usage.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as u64) + 3) / 4
}

pub fn estimate_prompt_tokens(messages: &[PromptMessage]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{ResponseFormat, TokenSource, TokenUsage};

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "echo".to_string(),
                name: "Echo".to_string(),
                model: "echo-1".to_string(),
            }
        }

        async fn chat(
            &self,
            messages: &[PromptMessage],
            _options: &ChatOptions,
        ) -> Result<ChatOutcome, ProviderError> {
            let content = messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatOutcome {
                provider: "echo".to_string(),
                model: "echo-1".to_string(),
                usage: TokenUsage::new(
                    estimate_prompt_tokens(messages),
                    estimate_tokens(&content),
                    TokenSource::Estimated,
                ),
                prompt_messages: messages.to_vec(),
                elapsed_ms: 1,
                content,
            })
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn compile_replaces_or_inserts_system_message() {
        let options = ChatOptions {
            system_prompt_override: Some("be terse".to_string()),
            ..ChatOptions::default()
        };
        let without = vec![PromptMessage::new(Role::User, "hi")];
        let compiled = compile_messages(&without, &options);
        assert_eq!(compiled[0].role, Role::System);
        assert_eq!(compiled[0].content, "be terse");
        assert_eq!(compiled.len(), 2);

        let with = vec![
            PromptMessage::new(Role::System, "old"),
            PromptMessage::new(Role::User, "hi"),
        ];
        let compiled = compile_messages(&with, &options);
        assert_eq!(compiled[0].content, "be terse");
        assert_eq!(compiled.len(), 2);
        // Caller's messages untouched.
        assert_eq!(with[0].content, "old");
    }

    #[tokio::test]
    async fn registry_falls_back_to_first_provider() {
        let registry = ProviderRegistry::new(vec![Arc::new(EchoProvider)], None);
        let outcome = registry
            .chat(
                "does-not-exist",
                &[PromptMessage::new(Role::User, "ping")],
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.content, "ping");
        assert_eq!(outcome.provider, "echo");
    }

    #[tokio::test]
    async fn empty_registry_reports_configuration_error() {
        let registry = ProviderRegistry::new(Vec::new(), None);
        let err = registry
            .chat(
                "openai",
                &[PromptMessage::new(Role::User, "ping")],
                &ChatOptions {
                    response_format: ResponseFormat::JsonObject,
                    ..ChatOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Auth);
        assert!(!err.retryable);
    }
}
