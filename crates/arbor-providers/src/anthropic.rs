use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use arbor_types::{
    ChatOptions, ChatOutcome, PromptMessage, ProviderInfo, Role, TokenSource, TokenUsage,
};

use crate::openai::{classify_status, classify_transport};
use crate::{estimate_prompt_tokens, estimate_tokens, Provider, ProviderError, ProviderErrorKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.anthropic.com".to_string(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "claude".to_string(),
            name: "Claude".to_string(),
            model: self.model.clone(),
        }
    }

    async fn chat(
        &self,
        messages: &[PromptMessage],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        // The messages API takes the system prompt as a top-level field.
        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let api_messages: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": api_messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(stop) = &options.stop {
            body["stop_sequences"] = json!(stop);
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        let value: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| json!({"raw": text}));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &value));
        }

        let content = value["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::BadResponse,
                    format!("no completion content for model `{}`", self.model),
                )
            })?;

        let usage = match (
            value["usage"]["input_tokens"].as_u64(),
            value["usage"]["output_tokens"].as_u64(),
        ) {
            (Some(input), Some(output)) => TokenUsage::new(input, output, TokenSource::Provider),
            _ => TokenUsage::new(
                estimate_prompt_tokens(messages),
                estimate_tokens(&content),
                TokenSource::Estimated,
            ),
        };

        Ok(ChatOutcome {
            provider: "claude".to_string(),
            model: self.model.clone(),
            content,
            usage,
            prompt_messages: messages.to_vec(),
            elapsed_ms,
        })
    }
}
