//! LLM client contract (§6): a thin chat-completion call, budget-gated
//! per-hour/per-day, falling back to a deterministic template once the
//! budget is exhausted. Grounded on `OpenRouterBridge`'s OpenAI-compatible
//! request/response shapes, generalized behind a trait so the Generator
//! never depends on a concrete provider.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vigil_core::{VigilError, VigilResult};

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// One user/system turn in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// A chat-completion backend. Implemented by `OpenRouterClient` for the real
/// network path and by test doubles for deterministic generator tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, system: &str, messages: &[ChatMessage], temperature: f32) -> VigilResult<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// OpenRouter-backed chat client (OpenAI-compatible `/chat/completions`).
pub struct OpenRouterClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { api_key: api_key.trim().to_string(), model: model.into(), client }
    }

    pub fn from_env(model: impl Into<String>) -> Option<Self> {
        let key = std::env::var("OPENROUTER_API_KEY").ok()?;
        if key.trim().is_empty() {
            return None;
        }
        Some(Self::new(key, model))
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat(&self, system: &str, messages: &[ChatMessage], temperature: f32) -> VigilResult<String> {
        let mut wire = vec![WireMessage { role: "system", content: system }];
        wire.extend(messages.iter().map(|m| WireMessage { role: &m.role, content: &m.content }));

        let body = ChatRequest { model: &self.model, messages: wire, temperature, max_tokens: 512 };
        let url = format!("{OPENROUTER_API_BASE}/chat/completions");

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::TransientRemote { endpoint: "openrouter.chat".to_string(), detail: e.to_string() })?;

        if res.status().as_u16() == 429 || res.status().is_server_error() {
            return Err(VigilError::TransientRemote { endpoint: "openrouter.chat".to_string(), detail: res.status().to_string() });
        }
        if !res.status().is_success() {
            let status = res.status();
            let detail = res.text().await.unwrap_or_default();
            return Err(VigilError::PersistentRemote { endpoint: "openrouter.chat".to_string(), detail: format!("{status}: {detail}") });
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: "openrouter.chat".to_string(), detail: e.to_string() })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| VigilError::PersistentRemote { endpoint: "openrouter.chat".to_string(), detail: "empty choices".to_string() })
    }
}

/// Wraps an `LlmClient` with a rolling per-hour/per-day call budget (§6).
/// Once exhausted, `chat` returns `Ok` with a deterministic template instead
/// of erroring, so the Generator always produces *something*.
pub struct BudgetedLlmClient<C: LlmClient> {
    inner: C,
    per_hour: u32,
    per_day: u32,
    calls: Mutex<VecDeque<DateTime<Utc>>>,
}

impl<C: LlmClient> BudgetedLlmClient<C> {
    pub fn new(inner: C, per_hour: u32, per_day: u32) -> Self {
        Self { inner, per_hour, per_day, calls: Mutex::new(VecDeque::new()) }
    }

    async fn budget_remaining(&self) -> bool {
        let now = Utc::now();
        let mut calls = self.calls.lock().await;
        while calls.front().map(|t| now - *t > chrono::Duration::days(1)).unwrap_or(false) {
            calls.pop_front();
        }
        let last_hour = calls.iter().filter(|t| now - **t <= chrono::Duration::hours(1)).count() as u32;
        let last_day = calls.len() as u32;
        last_hour < self.per_hour && last_day < self.per_day
    }

    async fn record_call(&self) {
        self.calls.lock().await.push_back(Utc::now());
    }

    /// Runs `system`/`messages` through the budget gate; on exhaustion, calls
    /// `fallback` instead of touching the network.
    pub async fn chat_or_fallback(&self, system: &str, messages: &[ChatMessage], temperature: f32, fallback: impl FnOnce() -> String) -> String {
        if !self.budget_remaining().await {
            tracing::warn!("llm_budget_exhausted");
            return fallback();
        }
        self.record_call().await;
        match self.inner.chat(system, messages, temperature).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "llm_call_failed_using_fallback");
                fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn chat(&self, _system: &str, messages: &[ChatMessage], _temperature: f32) -> VigilResult<String> {
            Ok(messages.last().map(|m| m.content.clone()).unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn falls_back_once_hourly_budget_is_exhausted() {
        let budgeted = BudgetedLlmClient::new(EchoClient, 1, 10);
        let first = budgeted.chat_or_fallback("sys", &[ChatMessage::user("a")], 0.5, || "fallback".to_string()).await;
        let second = budgeted.chat_or_fallback("sys", &[ChatMessage::user("b")], 0.5, || "fallback".to_string()).await;
        assert_eq!(first, "a");
        assert_eq!(second, "fallback");
    }
}
