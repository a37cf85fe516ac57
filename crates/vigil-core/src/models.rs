//! Domain entities (§3). These are semantic types, not storage types — the
//! `Persistence` contract (see `persistence.rs`) is responsible for mapping
//! them onto whatever physical schema a concrete store chooses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Action type / post kind (Glossary)
// ---------------------------------------------------------------------------

/// One of the six action types the Selector can choose (Glossary: "Action type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    PostProposal,
    ReplyMentions,
    SearchEngage,
    PostThread,
    SendValueDm,
    Rest,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::PostProposal,
        ActionType::ReplyMentions,
        ActionType::SearchEngage,
        ActionType::PostThread,
        ActionType::SendValueDm,
        ActionType::Rest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::PostProposal => "POST_PROPOSAL",
            ActionType::ReplyMentions => "REPLY_MENTIONS",
            ActionType::SearchEngage => "SEARCH_ENGAGE",
            ActionType::PostThread => "POST_THREAD",
            ActionType::SendValueDm => "SEND_VALUE_DM",
            ActionType::Rest => "REST",
        }
    }

    /// True for actions that produce generated content (everything but REST).
    pub fn is_content_producing(&self) -> bool {
        !matches!(self, ActionType::Rest)
    }
}

/// Kind of a single post/segment (§3 Post.kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Proposal,
    Reply,
    Quote,
    ThreadRoot,
    ThreadSegment,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Proposal => "proposal",
            PostKind::Reply => "reply",
            PostKind::Quote => "quote",
            PostKind::ThreadRoot => "thread_root",
            PostKind::ThreadSegment => "thread_segment",
        }
    }
}

// ---------------------------------------------------------------------------
// Persona (§3, §4.1)
// ---------------------------------------------------------------------------

/// The single validated persona document (§3). Immutable once versioned;
/// `vigil-persona::PersonaStore` owns all mutation paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    pub version: u64,
    pub hash: String,
    pub handle: String,
    pub mission: String,
    pub beliefs: Vec<String>,
    pub doctrine: Vec<String>,
    pub tone_rules: HashMap<String, String>,
    pub content_mix: HashMap<String, f64>,
    pub templates: HashMap<String, String>,
    pub guardrails: Vec<String>,
    pub intensity_settings: IntensitySettings,
}

/// Drive weights + min/max bounds used by the Selector's intensity policy (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntensitySettings {
    pub curiosity: f64,
    pub novelty: f64,
    pub impact: f64,
    pub stability: f64,
    #[serde(default = "default_min_intensity")]
    pub min_intensity: i32,
    #[serde(default = "default_max_intensity")]
    pub max_intensity: i32,
}

fn default_min_intensity() -> i32 {
    0
}
fn default_max_intensity() -> i32 {
    5
}

impl Default for IntensitySettings {
    fn default() -> Self {
        Self {
            curiosity: 0.25,
            novelty: 0.25,
            impact: 0.25,
            stability: 0.25,
            min_intensity: 0,
            max_intensity: 5,
        }
    }
}

/// A single immutable historical version of the Persona (§4.1 atomic write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaVersion {
    pub version: u64,
    pub hash: String,
    pub actor: String,
    pub payload: Persona,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Post / engagement (§3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Engagement {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
}

impl Engagement {
    /// §4.6 engagement_proxy = 1*likes + 2*reposts + 1.5*replies + 1.5*quotes.
    pub fn engagement_proxy(&self) -> f64 {
        self.likes as f64 + 2.0 * self.reposts as f64 + 1.5 * self.replies as f64 + 1.5 * self.quotes as f64
    }
}

/// A published (or drafted-and-rejected) unit of content (§3 Post).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub platform: String,
    pub kind: PostKind,
    pub text: String,
    pub topic: String,
    pub hour_bin: u8,
    pub cta_variant: String,
    pub intensity: i32,
    pub ref_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub engagement: Engagement,
    pub authority_score: f64,
    /// Non-null once Analytics computes it (§4.6); triggers ArmSelection.reward_j write.
    pub j_score: Option<f64>,
}

impl Post {
    pub fn canonical_hash(&self) -> String {
        crate::hash::canonical_hash_of(&self.text)
    }
}

// ---------------------------------------------------------------------------
// ArmSelection (§3, §4.7)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSelection {
    pub id: Uuid,
    pub post_id: Option<Uuid>,
    pub post_type: ActionType,
    pub topic: String,
    pub hour_bin: u8,
    pub cta_variant: String,
    pub intensity: i32,
    pub sampled_prob: f64,
    pub reward_j: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SensedEvent (§3, §4.9)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensedEvent {
    pub id: Uuid,
    pub source: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub counts: HashMap<String, u64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StructuredOutcome (§3, §4.6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredOutcome {
    PilotAcceptance { post_id: Uuid, detail: String },
    ArtifactFork { post_id: Uuid, platform: Option<String> },
    CoalitionPartner { post_id: Uuid, partner: String },
    Citation { post_id: Uuid, url: String },
    HelpfulnessFeedback { post_id: Uuid, channel: String, rating: u8, comment: Option<String> },
}

// ---------------------------------------------------------------------------
// Redirect / FollowersSnapshot / ImprovementNote (§3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redirect {
    pub id: Uuid,
    pub label: String,
    pub target_url: String,
    pub utm: Option<String>,
    pub clicks: u64,
    pub revenue: f64,
}

impl Redirect {
    /// `clicks` is monotonic non-decreasing (§3 invariant); returns false if the
    /// caller tried to move it backward.
    pub fn record_click(&mut self, revenue_per_click: f64) {
        self.clicks += 1;
        self.revenue += revenue_per_click;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FollowersSnapshot {
    pub ts: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementNote {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CircuitBreakerState (§3, §4.8)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub reset_secs: u64,
}

impl CircuitBreakerState {
    pub fn new(threshold: u32, reset_secs: u64) -> Self {
        Self { failures: 0, last_failure: None, threshold, reset_secs }
    }

    /// P6: once opened, refuses writes until `now - last_failure >= reset_timeout`.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.failures < self.threshold {
            return false;
        }
        match self.last_failure {
            Some(last) => (now - last).num_seconds() < self.reset_secs as i64,
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures += 1;
        self.last_failure = Some(now);
    }
}

// ---------------------------------------------------------------------------
// CrisisState (§3, §4.5)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrisisMetrics {
    pub sentiment: f64,
    pub velocity: f64,
    pub authority: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrisisState {
    pub active: bool,
    pub reason: Option<String>,
    pub last_signal: f64,
    pub metrics: CrisisMetrics,
    pub receipts_validated: bool,
}

impl Default for CrisisState {
    fn default() -> Self {
        Self {
            active: false,
            reason: None,
            last_signal: 0.0,
            metrics: CrisisMetrics::default(),
            receipts_validated: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tagged outcome (Design Notes §9): Success/Skipped/Deferred/Rejected
// ---------------------------------------------------------------------------

/// A uniform tagged result for publish attempts, gate verdicts, and job
/// outcomes, replacing nullable/boolean fields per the Design Notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Skipped { reason: String },
    Deferred { retry_at: DateTime<Utc> },
    Rejected { gate: String, detail: String },
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engagement_proxy_weights_match_spec() {
        let e = Engagement { likes: 10, reposts: 2, replies: 4, quotes: 0 };
        assert_eq!(e.engagement_proxy(), 10.0 + 4.0 + 6.0);
    }

    #[test]
    fn circuit_breaker_opens_at_threshold_and_resets_after_timeout() {
        let now = Utc::now();
        let mut cb = CircuitBreakerState::new(3, 60);
        for _ in 0..2 {
            cb.record_failure(now);
        }
        assert!(!cb.is_open(now));
        cb.record_failure(now);
        assert!(cb.is_open(now));
        let later = now + chrono::Duration::seconds(61);
        assert!(!cb.is_open(later));
    }

    #[test]
    fn redirect_clicks_are_monotonic() {
        let mut r = Redirect {
            id: Uuid::new_v4(),
            label: "l".into(),
            target_url: "https://example.com".into(),
            utm: None,
            clicks: 0,
            revenue: 0.0,
        };
        r.record_click(0.05);
        r.record_click(0.05);
        assert_eq!(r.clicks, 2);
        assert!((r.revenue - 0.10).abs() < 1e-9);
    }
}
