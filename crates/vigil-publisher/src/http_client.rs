//! A generic REST `RawPlatformClient` (§6 "Outbound to social platform"):
//! one bearer-token HTTP client wired per configured platform, reusing the
//! OpenAI-compatible-bridge shape (`reqwest::Client` with a fixed timeout,
//! `Authorization: Bearer` header, JSON bodies) for the non-LLM write/read
//! surface instead. Concrete platforms differ only in `base_url` and token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use vigil_core::{VigilError, VigilResult};

use crate::{RawPlatformClient, WriteRequest};

/// `base_url` + bearer token for one platform (e.g. `https://api.x.com/2`).
/// Endpoint paths below follow the `POST /posts`, `GET /mentions`, etc.
/// convention common across social APIs; adapters for a platform with a
/// different path scheme would implement `RawPlatformClient` directly
/// instead of going through this generic client.
pub struct HttpPlatformClient {
    platform: String,
    base_url: String,
    bearer_token: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreatePostBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_ids: &'a [String],
}

impl HttpPlatformClient {
    pub fn new(platform: impl Into<String>, base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(15)).build().unwrap_or_else(|_| reqwest::Client::new());
        Self { platform: platform.into(), base_url: base_url.into(), bearer_token: bearer_token.into(), client }
    }

    /// Reads `VIGIL__PLATFORMS__{PLATFORM}__{BASE_URL,TOKEN}` env vars,
    /// matching the `config::Environment::with_prefix("VIGIL").separator("__")`
    /// convention `RuntimeConfig::load` already uses.
    pub fn from_env(platform: &str) -> Option<Self> {
        let upper = platform.to_uppercase();
        let base_url = std::env::var(format!("VIGIL__PLATFORMS__{upper}__BASE_URL")).ok()?;
        let token = std::env::var(format!("VIGIL__PLATFORMS__{upper}__TOKEN")).ok()?;
        Some(Self::new(platform, base_url, token))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn classify_status(&self, endpoint: &str, status: reqwest::StatusCode) -> VigilError {
        if status.as_u16() == 429 || status.is_server_error() {
            VigilError::TransientRemote { endpoint: endpoint.to_string(), detail: status.to_string() }
        } else {
            VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: status.to_string() }
        }
    }
}

#[async_trait]
impl RawPlatformClient for HttpPlatformClient {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn send(&self, req: &WriteRequest) -> VigilResult<String> {
        let endpoint = "create-post";
        let body = CreatePostBody {
            text: &req.content,
            in_reply_to: req.in_reply_to.as_deref(),
            quote_to: req.quote_to.as_deref(),
            media_ids: &req.media_ids,
        };
        let res = self
            .client
            .post(self.endpoint("/posts"))
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::TransientRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        if !res.status().is_success() {
            return Err(self.classify_status(endpoint, res.status()));
        }
        let parsed: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        parsed
            .get("id")
            .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_u64().map(|n| n.to_string())))
            .ok_or_else(|| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: "response missing id".to_string() })
    }

    async fn upload_media(&self, path: &str, media_type: &str) -> VigilResult<String> {
        let endpoint = "upload-media";
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        let part = reqwest::multipart::Part::bytes(bytes).mime_str(media_type).map_err(|e| VigilError::PersistentRemote {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })?;
        let form = reqwest::multipart::Form::new().part("media", part);
        let res = self
            .client
            .post(self.endpoint("/media"))
            .bearer_auth(&self.bearer_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VigilError::TransientRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        if !res.status().is_success() {
            return Err(self.classify_status(endpoint, res.status()));
        }
        let parsed: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        parsed
            .get("media_id")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: "response missing media_id".to_string() })
    }

    async fn get_mentions(&self, since_id: Option<&str>, max_results: u32) -> VigilResult<Vec<serde_json::Value>> {
        let endpoint = "get-mentions";
        let mut query = vec![("max_results".to_string(), max_results.to_string())];
        if let Some(id) = since_id {
            query.push(("since_id".to_string(), id.to_string()));
        }
        self.get_list(endpoint, "/mentions", &query).await
    }

    async fn get_home_timeline(&self, limit: u32, pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
        let endpoint = "get-home-timeline";
        let mut query = vec![("limit".to_string(), limit.to_string())];
        if let Some(token) = pagination_token {
            query.push(("pagination_token".to_string(), token.to_string()));
        }
        self.get_list(endpoint, "/timeline", &query).await
    }

    async fn get_trending_topics(&self, limit: u32) -> VigilResult<Vec<serde_json::Value>> {
        let endpoint = "get-trending-topics";
        self.get_list(endpoint, "/trends", &[("limit".to_string(), limit.to_string())]).await
    }

    async fn get_user_tweets(&self, username: &str, limit: u32, pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
        let endpoint = "get-user-tweets";
        let mut query = vec![("username".to_string(), username.to_string()), ("limit".to_string(), limit.to_string())];
        if let Some(token) = pagination_token {
            query.push(("pagination_token".to_string(), token.to_string()));
        }
        self.get_list(endpoint, "/users/tweets", &query).await
    }

    async fn metrics_for(&self, ids: &[String]) -> VigilResult<HashMap<String, serde_json::Value>> {
        let endpoint = "metrics-for";
        let res = self
            .client
            .get(self.endpoint("/metrics"))
            .bearer_auth(&self.bearer_token)
            .query(&[("ids", ids.join(","))])
            .send()
            .await
            .map_err(|e| VigilError::TransientRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        if !res.status().is_success() {
            return Err(self.classify_status(endpoint, res.status()));
        }
        res.json()
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: e.to_string() })
    }
}

impl HttpPlatformClient {
    async fn get_list(&self, endpoint: &str, path: &str, query: &[(String, String)]) -> VigilResult<Vec<serde_json::Value>> {
        let res = self
            .client
            .get(self.endpoint(path))
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await
            .map_err(|e| VigilError::TransientRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        if !res.status().is_success() {
            return Err(self.classify_status(endpoint, res.status()));
        }
        let parsed: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VigilError::PersistentRemote { endpoint: endpoint.to_string(), detail: e.to_string() })?;
        Ok(parsed.get("data").and_then(|v| v.as_array()).cloned().unwrap_or_default())
    }
}
