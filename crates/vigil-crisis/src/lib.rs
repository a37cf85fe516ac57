//! Crisis detection (§4.5). A lightweight state machine gates every
//! non-REST action on the single aggregated
//! `signal = max(0,-sentiment)*velocity*authority` formula; `text_indicates_crisis`
//! is a pure per-text classifier feeding that aggregate's sentiment input
//! (§4.5 "Keyword trigger": a hit marks a crisis signal for that text, but
//! the state transition still runs through the aggregated signal, not a
//! second ungated path), without any network calls of its own.

pub mod sentiment;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use vigil_core::{ActionType, CrisisMetrics, CrisisState, RuntimeConfig};

/// Keyword watch list; any hit forces crisis mode regardless of sentiment
/// (the keyword and sentiment checks are independent triggers, not a
/// conjunction — requiring both would miss urgent issues).
pub const CRISIS_KEYWORDS: &[&str] =
    &["crisis", "scandal", "emergency", "bankrupt", "fail", "collapse", "fraud", "default", "lawsuit", "investigation"];

/// Text-level check: keyword hit or sentiment below threshold.
pub fn text_indicates_crisis(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    if CRISIS_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return true;
    }
    sentiment::analyze_sentiment(text).score < -0.5
}

/// §4.5 signal formula: `max(0, -sentiment) * velocity * authority`. Only
/// negative sentiment contributes; a calm or positive mean sentiment yields 0.
pub fn crisis_signal(sentiment: f64, velocity: f64, authority: f64) -> f64 {
    (-sentiment).max(0.0) * velocity * authority
}

/// Owns the live `CrisisState` and transitions it in response to perception
/// signals or explicit text checks. `guard` is the single choke point every
/// action-producing job must call before writing.
pub struct CrisisService {
    state: RwLock<CrisisState>,
    signal_threshold: f64,
    resume_threshold: f64,
}

impl CrisisService {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            state: RwLock::new(CrisisState::default()),
            signal_threshold: config.crisis_signal_threshold,
            resume_threshold: config.crisis_resume_threshold,
        }
    }

    pub async fn state(&self) -> CrisisState {
        self.state.read().await.clone()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.active
    }

    /// Feeds a fresh (sentiment, velocity, authority) reading from perception
    /// and transitions PAUSED/NORMAL using hysteresis: enters at
    /// `signal_threshold`, only resumes once the signal drops to
    /// `resume_threshold` or below (prevents flapping at the boundary).
    pub async fn observe(&self, metrics: CrisisMetrics) {
        let signal = crisis_signal(metrics.sentiment, metrics.velocity, metrics.authority);
        let mut state = self.state.write().await;
        state.metrics = metrics;
        state.last_signal = signal;

        if !state.active && signal >= self.signal_threshold {
            state.active = true;
            state.reason = Some(format!("signal {signal:.2} >= threshold {:.2}", self.signal_threshold));
            state.receipts_validated = false;
            warn!(signal, reason = ?state.reason, "crisis_state=PAUSED");
            info!("calm_statement=Holding fire until signals stabilize");
        } else if state.active && signal <= self.resume_threshold && state.receipts_validated {
            // P8: resumption requires both a calm signal AND a validated,
            // non-dry-run calming receipt — signal alone cannot clear the pause.
            state.active = false;
            state.reason = None;
            info!(signal, "crisis_state=NORMAL");
        }
    }

    /// Marks that a calming receipt was validated on some platform (Open
    /// Question #2: unconstrained by platform), allowing non-REST actions
    /// once the signal also drops below `resume_threshold`.
    pub async fn record_calming_receipt(&self) {
        let mut state = self.state.write().await;
        state.receipts_validated = true;
    }

    /// §4.5/§4.3: every non-REST action is blocked while crisis is active.
    pub async fn guard(&self, action: ActionType) -> bool {
        if action == ActionType::Rest {
            return true;
        }
        let state = self.state.read().await;
        if state.active {
            info!(action = action.as_str(), "crisis_guard_blocked");
            false
        } else {
            true
        }
    }

    pub async fn activate(&self, reason: String) {
        let mut state = self.state.write().await;
        if !state.active {
            warn!(reason = %reason, "crisis_state=PAUSED");
        }
        state.active = true;
        state.reason = Some(reason);
        state.receipts_validated = false;
        let _ = Utc::now();
    }

    pub async fn resolve(&self, reason: &str) {
        let mut state = self.state.write().await;
        if state.active {
            info!(reason, "crisis_state=NORMAL");
        }
        state.active = false;
        state.reason = None;
    }
}

pub fn shared(config: &RuntimeConfig) -> Arc<CrisisService> {
    Arc::new(CrisisService::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_triggers_regardless_of_sentiment() {
        assert!(text_indicates_crisis("we are facing a lawsuit over this"));
    }

    #[test]
    fn very_negative_sentiment_triggers_without_keywords() {
        assert!(text_indicates_crisis("this is bad terrible horrible negative"));
    }

    #[test]
    fn neutral_text_does_not_trigger() {
        assert!(!text_indicates_crisis("shipping a small update today"));
    }

    #[test]
    fn signal_ignores_positive_sentiment() {
        assert_eq!(crisis_signal(0.5, 10.0, 1.0), 0.0);
    }

    #[tokio::test]
    async fn observe_enters_and_exits_with_hysteresis() {
        let cfg = RuntimeConfig::default();
        let svc = CrisisService::new(&cfg);
        assert!(!svc.is_paused().await);

        svc.observe(CrisisMetrics { sentiment: -0.9, velocity: 20.0, authority: 1.0 }).await;
        assert!(svc.is_paused().await);

        // Mid-range signal should not resume yet.
        svc.observe(CrisisMetrics { sentiment: -0.9, velocity: 8.0, authority: 1.0 }).await;
        assert!(svc.is_paused().await);

        svc.record_calming_receipt().await;
        svc.observe(CrisisMetrics { sentiment: 0.0, velocity: 0.0, authority: 1.0 }).await;
        assert!(!svc.is_paused().await);
    }

    /// P8: a calm signal alone must never clear the pause without a
    /// validated non-dry-run calming receipt.
    #[tokio::test]
    async fn observe_does_not_resume_without_a_validated_calming_receipt() {
        let cfg = RuntimeConfig::default();
        let svc = CrisisService::new(&cfg);

        svc.observe(CrisisMetrics { sentiment: -0.9, velocity: 20.0, authority: 1.0 }).await;
        assert!(svc.is_paused().await);

        svc.observe(CrisisMetrics { sentiment: 0.0, velocity: 0.0, authority: 1.0 }).await;
        assert!(svc.is_paused().await, "signal dropping alone must not resume without a calming receipt");

        svc.record_calming_receipt().await;
        svc.observe(CrisisMetrics { sentiment: 0.0, velocity: 0.0, authority: 1.0 }).await;
        assert!(!svc.is_paused().await);
    }

    #[tokio::test]
    async fn guard_blocks_everything_but_rest_while_active() {
        let cfg = RuntimeConfig::default();
        let svc = CrisisService::new(&cfg);
        svc.activate("manual test".to_string()).await;
        assert!(!svc.guard(ActionType::PostProposal).await);
        assert!(svc.guard(ActionType::Rest).await);
    }
}
