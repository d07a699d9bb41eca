//! Chat-completion backend
//!
//! The engine only needs `chat(messages) -> text`. Every call is stateless:
//! the full context travels in the messages.

use crate::circuit_breaker::CircuitBreaker;
use async_trait::async_trait;
use flowsmith_core::{ChatConfig, FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, instrument};

const TEMPERATURE: f64 = 0.2;

/// A role-tagged chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Reply text plus any reasoning the backend exposed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub thought: String,
}

impl ChatReply {
    /// Split an inline `<think>...</think>` section out of `content`
    pub fn from_content(content: &str) -> Self {
        let (start, end) = match (content.find("<think>"), content.find("</think>")) {
            (Some(s), Some(e)) if e > s => (s, e),
            _ => {
                return Self {
                    content: content.trim().to_string(),
                    thought: String::new(),
                }
            }
        };
        let thought = content[start + "<think>".len()..end].trim().to_string();
        let cleaned = format!("{}{}", &content[..start], &content[end + "</think>".len()..]);
        Self {
            content: cleaned.trim().to_string(),
            thought,
        }
    }
}

/// Chat-completion backend (allows mocking in tests)
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Like [`ChatClient::chat`] but separates reasoning from the answer
    async fn chat_with_thought(&self, messages: &[ChatMessage]) -> Result<ChatReply> {
        let content = self.chat(messages).await?;
        Ok(ChatReply::from_content(&content))
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: String,
}

/// OpenAI-compatible `/chat/completions` client
#[derive(Clone)]
pub struct HttpChatClient {
    endpoint: String,
    model: String,
    api_key: String,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowError::Chat(format!("Failed to build http client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            http,
            breaker: Arc::new(CircuitBreaker::default()),
        })
    }

    /// Build from configuration, reading the API key from the configured variable
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(FlowError::ClientNotConfigured);
        }
        Self::new(
            config.endpoint.clone(),
            config.model.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionMessage> {
        if !self.breaker.can_execute() {
            return Err(FlowError::Chat(format!(
                "circuit breaker is open, retry in {}s",
                self.breaker.time_until_retry() / 1000
            )));
        }

        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: TEMPERATURE,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                FlowError::Chat(format!("Failed to send request: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.breaker.record_failure();
            error!(
                "chat request failed with {} (breaker failures: {})",
                status,
                self.breaker.failure_count()
            );
            return Err(FlowError::Chat(format!(
                "ai request failed: {} {}",
                status,
                body.trim()
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| FlowError::Chat(format!("Failed to parse response: {}", e)))?;
        self.breaker.record_success();

        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| FlowError::Chat("ai response missing choices".to_string()))?;
        debug!(
            "chat response: content_len={} thought_len={}",
            message.content.len(),
            message.reasoning_content.len()
        );
        Ok(message)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    #[instrument(skip(self, messages), fields(model = %self.model, messages = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        Ok(self.complete(messages).await?.content)
    }

    #[instrument(skip(self, messages), fields(model = %self.model, messages = messages.len()))]
    async fn chat_with_thought(&self, messages: &[ChatMessage]) -> Result<ChatReply> {
        let message = self.complete(messages).await?;
        if message.reasoning_content.trim().is_empty() {
            return Ok(ChatReply::from_content(&message.content));
        }
        Ok(ChatReply {
            content: message.content.trim().to_string(),
            thought: message.reasoning_content.trim().to_string(),
        })
    }
}

/// Scripted chat backend for testing
///
/// Replies are consumed in order; once the script is exhausted the fallback
/// reply (if any) is returned forever.
#[derive(Default)]
pub struct MockChatClient {
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()));
        self
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Every message list sent so far
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The user message of every call
    pub fn prompts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|messages| {
                messages
                    .into_iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content)
            })
            .collect()
    }

    fn push(&self, entry: std::result::Result<String, String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(FlowError::Chat(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| FlowError::Chat("no scripted reply left".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_thought() {
        let reply = ChatReply::from_content("<think>plan it</think>\n{\"a\":1}");
        assert_eq!(reply.thought, "plan it");
        assert_eq!(reply.content, "{\"a\":1}");

        let plain = ChatReply::from_content("  hello ");
        assert_eq!(plain.content, "hello");
        assert!(plain.thought.is_empty());
    }

    #[tokio::test]
    async fn test_mock_script_order() {
        let client = MockChatClient::new()
            .with_reply("one")
            .with_error("boom")
            .with_fallback("again");
        let msgs = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];

        assert_eq!(client.chat(&msgs).await.unwrap(), "one");
        assert!(matches!(client.chat(&msgs).await, Err(FlowError::Chat(_))));
        assert_eq!(client.chat(&msgs).await.unwrap(), "again");
        assert_eq!(client.chat(&msgs).await.unwrap(), "again");
        assert_eq!(client.prompts(), vec!["hi"; 4]);
    }

    #[tokio::test]
    async fn test_mock_exhausted_is_error() {
        let client = MockChatClient::new();
        assert!(client.chat(&[ChatMessage::user("x")]).await.is_err());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ChatConfig {
            api_key_env: "FLOWSMITH_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpChatClient::from_config(&config),
            Err(FlowError::ClientNotConfigured)
        ));
    }
}
