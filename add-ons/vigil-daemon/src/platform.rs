//! Fallback platform/LLM backends so the daemon starts and ticks cleanly
//! with no credentials configured, rather than failing every job.

use std::collections::HashMap;

use async_trait::async_trait;
use vigil_core::{VigilError, VigilResult};
use vigil_generator::{ChatMessage, LlmClient, OpenRouterClient};
use vigil_publisher::{RawPlatformClient, WriteRequest};

/// A `RawPlatformClient` with no credentials: every read returns an empty
/// result and every write is rejected, so perception/analytics jobs degrade
/// to no-ops instead of panicking when a platform has no token configured.
pub struct OfflinePlatformClient {
    platform: String,
}

impl OfflinePlatformClient {
    pub fn new(platform: impl Into<String>) -> Self {
        Self { platform: platform.into() }
    }
}

#[async_trait]
impl RawPlatformClient for OfflinePlatformClient {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn send(&self, _req: &WriteRequest) -> VigilResult<String> {
        Err(VigilError::PersistentRemote { endpoint: self.platform.clone(), detail: "no credentials configured".to_string() })
    }

    async fn upload_media(&self, _path: &str, _media_type: &str) -> VigilResult<String> {
        Err(VigilError::PersistentRemote { endpoint: self.platform.clone(), detail: "no credentials configured".to_string() })
    }

    async fn get_mentions(&self, _since_id: Option<&str>, _max_results: u32) -> VigilResult<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    async fn get_home_timeline(&self, _limit: u32, _pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    async fn get_trending_topics(&self, _limit: u32) -> VigilResult<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    async fn get_user_tweets(&self, _username: &str, _limit: u32, _pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    async fn metrics_for(&self, _ids: &[String]) -> VigilResult<HashMap<String, serde_json::Value>> {
        Ok(HashMap::new())
    }
}

/// Selects between a real OpenRouter backend and a disabled stub, so
/// `Generator<ConfiguredLlm>` has one concrete type regardless of whether
/// `OPENROUTER_API_KEY` is set at startup.
pub enum ConfiguredLlm {
    OpenRouter(OpenRouterClient),
    Disabled,
}

#[async_trait]
impl LlmClient for ConfiguredLlm {
    async fn chat(&self, system: &str, messages: &[ChatMessage], temperature: f32) -> VigilResult<String> {
        match self {
            ConfiguredLlm::OpenRouter(client) => client.chat(system, messages, temperature).await,
            ConfiguredLlm::Disabled => {
                Err(VigilError::PersistentRemote { endpoint: "llm".to_string(), detail: "no LLM backend configured".to_string() })
            }
        }
    }
}
