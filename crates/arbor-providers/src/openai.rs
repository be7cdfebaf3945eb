use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use arbor_types::{
    ChatOptions, ChatOutcome, PromptMessage, ProviderInfo, ResponseFormat, TokenSource, TokenUsage,
};

use crate::{estimate_prompt_tokens, estimate_tokens, Provider, ProviderError, ProviderErrorKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat-completions adapter shared by the `openai` and `custom` provider ids.
pub struct OpenAiCompatProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            model: self.model.clone(),
        }
    }

    async fn chat(
        &self,
        messages: &[PromptMessage],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if options.response_format == ResponseFormat::JsonObject {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(stop) = &options.stop {
            body["stop"] = json!(stop);
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if self.base_url.contains("openrouter.ai") {
            req = req
                .header("HTTP-Referer", "http://localhost:3000")
                .header("X-Title", "Arbor");
        }

        let started = Instant::now();
        let response = req.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        let value: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| json!({"raw": text}));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &value));
        }
        if let Some(detail) = extract_error_message(&value) {
            return Err(ProviderError::new(ProviderErrorKind::BadResponse, detail));
        }

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::BadResponse,
                    format!(
                        "no completion content for model `{}`",
                        self.model
                    ),
                )
            })?;

        let usage = parse_usage(&value, messages, &content);

        Ok(ChatOutcome {
            provider: self.id.clone(),
            model: self.model.clone(),
            content,
            usage,
            prompt_messages: messages.to_vec(),
            elapsed_ms,
        })
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, format!("request timed out: {err}"))
    } else {
        ProviderError::new(ProviderErrorKind::Transport, format!("transport error: {err}"))
    }
}

pub(crate) fn classify_status(status: u16, body: &Value) -> ProviderError {
    let detail = extract_error_message(body)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    match status {
        401 | 403 => ProviderError::new(ProviderErrorKind::Auth, detail),
        429 => ProviderError::new(ProviderErrorKind::RateLimited, detail),
        408 => ProviderError::new(ProviderErrorKind::Timeout, detail),
        500..=599 => ProviderError::new(ProviderErrorKind::Transport, detail),
        _ => ProviderError::new(ProviderErrorKind::BadResponse, detail),
    }
}

pub(crate) fn extract_error_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
}

fn parse_usage(value: &Value, messages: &[PromptMessage], content: &str) -> TokenUsage {
    let input = value["usage"]["prompt_tokens"].as_u64();
    let output = value["usage"]["completion_tokens"].as_u64();
    match (input, output) {
        (Some(input), Some(output)) => TokenUsage::new(input, output, TokenSource::Provider),
        _ => TokenUsage::new(
            estimate_prompt_tokens(messages),
            estimate_tokens(content),
            TokenSource::Estimated,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::Role;

    #[test]
    fn status_classification_matches_taxonomy() {
        let body = json!({"error": {"message": "nope"}});
        assert_eq!(classify_status(401, &body).kind, ProviderErrorKind::Auth);
        assert_eq!(
            classify_status(429, &body).kind,
            ProviderErrorKind::RateLimited
        );
        assert!(classify_status(429, &body).retryable);
        assert_eq!(
            classify_status(503, &body).kind,
            ProviderErrorKind::Transport
        );
        assert_eq!(
            classify_status(400, &body).kind,
            ProviderErrorKind::BadResponse
        );
        assert!(!classify_status(400, &body).retryable);
        assert_eq!(classify_status(401, &body).message, "nope");
    }

    #[test]
    fn usage_falls_back_to_estimation() {
        let messages = vec![PromptMessage::new(Role::User, "12345678")];
        let value = json!({"choices": []});
        let usage = parse_usage(&value, &messages, "abcd");
        assert_eq!(usage.source, TokenSource::Estimated);
        assert_eq!(usage.input, 2);
        assert_eq!(usage.output, 1);

        let value = json!({"usage": {"prompt_tokens": 11, "completion_tokens": 7}});
        let usage = parse_usage(&value, &messages, "abcd");
        assert_eq!(usage.source, TokenSource::Provider);
        assert_eq!(usage.total, 18);
    }
}
