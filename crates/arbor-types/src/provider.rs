use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A fully compiled message as handed to a vendor API. Non-text parts are
/// serialized to text before this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: f64,
    pub max_tokens: u64,
    pub response_format: ResponseFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 8192,
            response_format: ResponseFormat::Text,
            stop: None,
            system_prompt_override: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Provider,
    Estimated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub source: TokenSource,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, source: TokenSource) -> Self {
        Self {
            input,
            output,
            total: input + output,
            source,
        }
    }
}

/// Transparency metadata for one LLM call, attached to planning events so the
/// UI can show exactly what was sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub provider: String,
    pub model: String,
    pub elapsed_ms: u64,
    pub prompt_messages: Vec<PromptMessage>,
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
    pub prompt_messages: Vec<PromptMessage>,
    pub elapsed_ms: u64,
}

impl ChatOutcome {
    pub fn llm_call(&self) -> LlmCall {
        LlmCall {
            provider: self.provider.clone(),
            model: self.model.clone(),
            elapsed_ms: self.elapsed_ms,
            prompt_messages: self.prompt_messages.clone(),
            tokens: self.usage,
        }
    }
}
