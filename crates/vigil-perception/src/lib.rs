//! Perception ingest (§4.9): pulls mentions, timeline, trends, and
//! whitelisted voices, keeps its own cursors, and writes exactly one
//! `SensedEvent` per tick even when individual sources fail.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;
use vigil_core::{Persistence, SensedEvent, VigilError, VigilResult};
use vigil_crisis::sentiment::analyze_sentiment;
use vigil_publisher::RawPlatformClient;

/// Seed data the original loaded from YAML; here it's whatever the daemon
/// wires in from `config/vigil.toml`'s `[perception]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerceptionSeed {
    #[serde(default)]
    pub whitelisted_voices: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl PerceptionSeed {
    pub fn load(path: impl AsRef<Path>) -> PerceptionSeed {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_default(),
            Err(_) => PerceptionSeed::default(),
        }
    }
}

/// Cursors owned by the service, never the event (§3 SensedEvent note).
#[derive(Debug, Clone, Default)]
struct Cursors {
    mentions_since_id: Option<String>,
    timeline_token: Option<String>,
    voice_cursors: HashMap<String, String>,
}

/// Crisis-relevant signal derived from the mentions source (§4.9 last line).
#[derive(Debug, Clone, Copy, Default)]
pub struct MentionSignal {
    pub velocity: f64,
    pub sentiment: f64,
    pub authority: f64,
}

/// A mention-derived account candidate for value-first DM targeting
/// (§4.3 DM target selection), grounded on `_get_qualified_accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCandidate {
    pub id: String,
    pub username: String,
    pub authority_weight: f64,
    pub follower_count: u64,
}

pub struct PerceptionService {
    client: Box<dyn RawPlatformClient>,
    seed: PerceptionSeed,
    cursors: RwLock<Cursors>,
    accounts: RwLock<Vec<AccountCandidate>>,
}

impl PerceptionService {
    pub fn new(client: Box<dyn RawPlatformClient>, seed: PerceptionSeed) -> Self {
        Self { client, seed, cursors: RwLock::new(Cursors::default()), accounts: RwLock::new(Vec::new()) }
    }

    /// Accounts seen in the most recent ingest, sorted by authority and
    /// follower count, filtered to `min_authority` and capped at `max_count`
    /// (§4.3 "DM target selection": authority_weight >= 0.75).
    pub async fn priority_accounts(&self, min_authority: f64, max_count: usize) -> Vec<AccountCandidate> {
        let accounts = self.accounts.read().await;
        let mut qualified: Vec<AccountCandidate> =
            accounts.iter().filter(|a| a.authority_weight >= min_authority).cloned().collect();
        qualified.sort_by(|a, b| {
            b.authority_weight
                .partial_cmp(&a.authority_weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.follower_count.cmp(&a.follower_count))
        });
        qualified.truncate(max_count);
        qualified
    }

    /// Runs one ingest pass across all sources, isolating per-source errors
    /// (§7 Perception-source), and persists exactly one SensedEvent.
    pub async fn ingest(&self, persistence: &dyn Persistence) -> VigilResult<(SensedEvent, MentionSignal)> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut payload = serde_json::Map::new();

        let mentions = self.fetch_mentions().await;
        let signal = mention_signal(&mentions);
        counts.insert("x_mentions".to_string(), mentions.len() as u64);
        *self.accounts.write().await = account_candidates(&mentions);

        let timeline = self.fetch_timeline().await;
        counts.insert("x_timeline".to_string(), timeline.len() as u64);

        let trends = self.fetch_trends().await;
        counts.insert("x_trends".to_string(), trends.len() as u64);

        let voice_updates = self.fetch_voices().await;
        let voice_update_count: u64 = voice_updates.values().map(|v| v.len() as u64).sum();
        counts.insert("x_voice_updates".to_string(), voice_update_count);

        counts.insert("voices".to_string(), self.seed.whitelisted_voices.len() as u64);
        counts.insert("keywords".to_string(), self.seed.keywords.len() as u64);

        let signals: u64 = counts.values().sum();
        counts.insert("signals".to_string(), signals);

        payload.insert(
            "whitelisted_voices".to_string(),
            serde_json::Value::Array(self.seed.whitelisted_voices.iter().take(25).map(|v| serde_json::Value::String(v.clone())).collect()),
        );
        payload.insert(
            "keywords".to_string(),
            serde_json::Value::Array(self.seed.keywords.iter().take(25).map(|v| serde_json::Value::String(v.clone())).collect()),
        );
        payload.insert(
            "x".to_string(),
            serde_json::json!({
                "mentions": mentions,
                "home_timeline": timeline,
                "trending_topics": trends,
            }),
        );
        payload.insert("voices".to_string(), serde_json::to_value(&voice_updates).unwrap_or(serde_json::Value::Null));

        let event = SensedEvent {
            id: Uuid::new_v4(),
            source: "perception".to_string(),
            kind: "ingest".to_string(),
            payload: serde_json::Value::Object(payload),
            counts,
            created_at: Utc::now(),
        };

        persistence
            .append_sensed_event(event.clone())
            .await
            .map_err(|e| VigilError::Persistence(e.to_string()))?;

        Ok((event, signal))
    }

    async fn fetch_mentions(&self) -> Vec<serde_json::Value> {
        let since_id = { self.cursors.read().await.mentions_since_id.clone() };
        match self.client.get_mentions(since_id.as_deref(), 50).await {
            Ok(items) => {
                if let Some(max_id) = max_numeric_id(&items, since_id.as_deref()) {
                    self.cursors.write().await.mentions_since_id = Some(max_id);
                }
                items
            }
            Err(e) => {
                warn!(source = "mentions", error = %e, "perception_source_failed");
                vec![]
            }
        }
    }

    async fn fetch_timeline(&self) -> Vec<serde_json::Value> {
        let token = { self.cursors.read().await.timeline_token.clone() };
        match self.client.get_home_timeline(50, token.as_deref()).await {
            Ok(items) => items,
            Err(e) => {
                warn!(source = "timeline", error = %e, "perception_source_failed");
                vec![]
            }
        }
    }

    async fn fetch_trends(&self) -> Vec<serde_json::Value> {
        match self.client.get_trending_topics(10).await {
            Ok(items) => items,
            Err(e) => {
                warn!(source = "trends", error = %e, "perception_source_failed");
                vec![]
            }
        }
    }

    async fn fetch_voices(&self) -> HashMap<String, Vec<serde_json::Value>> {
        let mut out = HashMap::new();
        for voice in &self.seed.whitelisted_voices {
            let token = { self.cursors.read().await.voice_cursors.get(voice).cloned() };
            match self.client.get_user_tweets(voice, 10, token.as_deref()).await {
                Ok(items) => {
                    if let Some(max_id) = max_numeric_id(&items, token.as_deref()) {
                        self.cursors.write().await.voice_cursors.insert(voice.clone(), max_id);
                    }
                    out.insert(voice.clone(), items);
                }
                Err(e) => {
                    warn!(source = "voice", voice, error = %e, "perception_source_failed");
                    out.insert(voice.clone(), vec![]);
                }
            }
        }
        out
    }

    /// Explicitly clears a cursor (§4.9 step 4: "cursors set to NULL ... are
    /// explicitly cleared"), used by admin tooling to force a full re-pull.
    pub async fn clear_cursor(&self, which: &str) {
        let mut cursors = self.cursors.write().await;
        match which {
            "mentions" => cursors.mentions_since_id = None,
            "timeline" => cursors.timeline_token = None,
            voice => {
                cursors.voice_cursors.remove(voice);
            }
        }
    }
}

/// P13: `since_id` only ever moves forward; numeric comparison when both
/// sides parse as integers, lexicographic otherwise.
fn max_numeric_id(items: &[serde_json::Value], prior: Option<&str>) -> Option<String> {
    let mut best: Option<String> = prior.map(|s| s.to_string());
    for item in items {
        if let Some(id) = item.get("id").and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_u64().map(|n| n.to_string()))) {
            best = Some(match &best {
                Some(cur) => max_cursor(cur, &id),
                None => id,
            });
        }
    }
    best
}

fn max_cursor(a: &str, b: &str) -> String {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => if y > x { b.to_string() } else { a.to_string() },
        _ => if b > a { b.to_string() } else { a.to_string() },
    }
}

/// §4.9: velocity = mention count, sentiment = mean per-text sentiment,
/// authority = max of hinted follower/verified indicators.
fn mention_signal(mentions: &[serde_json::Value]) -> MentionSignal {
    if mentions.is_empty() {
        return MentionSignal::default();
    }
    let velocity = mentions.len() as f64;
    let sentiment_sum: f64 = mentions
        .iter()
        .map(|m| m.get("text").and_then(|v| v.as_str()).map(|t| analyze_sentiment(t).score).unwrap_or(0.0))
        .sum();
    let sentiment = sentiment_sum / mentions.len() as f64;
    let authority = mentions
        .iter()
        .map(|m| {
            let verified = m.get("verified").and_then(|v| v.as_bool()).unwrap_or(false);
            let followers = m.get("followers").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let normalized_followers = (followers / 10_000.0).min(5.0);
            if verified {
                (normalized_followers + 1.0).max(1.0)
            } else {
                normalized_followers
            }
        })
        .fold(0.0_f64, f64::max);
    MentionSignal { velocity, sentiment, authority }
}

/// Derives DM-targetable accounts from a batch of mention payloads, same
/// authority heuristic `mention_signal` uses per-mention.
fn account_candidates(mentions: &[serde_json::Value]) -> Vec<AccountCandidate> {
    mentions
        .iter()
        .filter_map(|m| {
            let username = m.get("username").and_then(|v| v.as_str())?.to_string();
            let verified = m.get("verified").and_then(|v| v.as_bool()).unwrap_or(false);
            let followers = m.get("followers").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let normalized_followers = (followers / 10_000.0).min(5.0);
            let authority_weight = if verified { (normalized_followers + 1.0).max(1.0) } else { normalized_followers };
            let id = m
                .get("id")
                .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_u64().map(|n| n.to_string())))
                .unwrap_or_else(|| username.clone());
            Some(AccountCandidate { id, username, authority_weight, follower_count: followers as u64 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubClient;

    #[async_trait]
    impl RawPlatformClient for StubClient {
        fn platform(&self) -> &str {
            "x"
        }
        async fn send(&self, _req: &vigil_publisher::WriteRequest) -> VigilResult<String> {
            Ok("id".into())
        }
        async fn upload_media(&self, _path: &str, _media_type: &str) -> VigilResult<String> {
            Ok("m".into())
        }
        async fn get_mentions(&self, _since_id: Option<&str>, _max_results: u32) -> VigilResult<Vec<serde_json::Value>> {
            Ok(vec![
                serde_json::json!({"id": "10", "text": "this is a great success", "verified": true, "followers": 50000.0}),
                serde_json::json!({"id": "12", "text": "terrible bad failure", "verified": false, "followers": 100.0}),
            ])
        }
        async fn get_home_timeline(&self, _limit: u32, _pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
            Ok(vec![])
        }
        async fn get_trending_topics(&self, _limit: u32) -> VigilResult<Vec<serde_json::Value>> {
            Ok(vec![])
        }
        async fn get_user_tweets(&self, _username: &str, _limit: u32, _pagination_token: Option<&str>) -> VigilResult<Vec<serde_json::Value>> {
            Ok(vec![])
        }
        async fn metrics_for(&self, _ids: &[String]) -> VigilResult<HashMap<String, serde_json::Value>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn ingest_persists_exactly_one_event_and_derives_signal() {
        let svc = PerceptionService::new(Box::new(StubClient), PerceptionSeed::default());
        let store = vigil_core::InMemoryPersistence::new();
        let (event, signal) = svc.ingest(&store).await.unwrap();
        assert_eq!(event.source, "perception");
        assert_eq!(signal.velocity, 2.0);
        let events = store.recent_sensed_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn mentions_cursor_only_moves_forward() {
        let svc = PerceptionService::new(Box::new(StubClient), PerceptionSeed::default());
        svc.fetch_mentions().await;
        let cursor = svc.cursors.read().await.mentions_since_id.clone();
        assert_eq!(cursor, Some("12".to_string()));
    }

    #[test]
    fn max_cursor_compares_numerically_when_possible() {
        assert_eq!(max_cursor("9", "10"), "10");
        assert_eq!(max_cursor("b", "a"), "b");
    }
}
