//! Thompson-sampling bandit (§4.7) over action arms, plus the reward
//! normalizer that turns a raw J-score into the `[0,1]` reward the bandit
//! posteriors expect.

pub mod optimizer;

pub use optimizer::{ArmOptimizer, ArmPick};

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Beta;
use tokio::sync::RwLock;

/// Per-arm Beta(α,β) posterior plus a pull counter (Glossary: "Arm").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArmState {
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
}

impl Default for ArmState {
    fn default() -> Self {
        Self { alpha: 2.0, beta: 2.0, pulls: 0 }
    }
}

impl ArmState {
    /// Deterministic point estimate used by tests and by any caller that
    /// wants a reproducible "most-likely-best" arm without sampling.
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// Beta-Bernoulli Thompson sampler keyed by an arbitrary arm key (callers
/// encode `(post_type, topic, hour_bin, cta_variant, intensity)` into a
/// string via `arm_key`).
pub struct ThompsonBandit {
    state: RwLock<HashMap<String, ArmState>>,
    epsilon: f64,
    recent_decisions: RwLock<VecDeque<String>>,
}

impl ThompsonBandit {
    pub fn new(epsilon: f64) -> Self {
        Self { state: RwLock::new(HashMap::new()), epsilon, recent_decisions: RwLock::new(VecDeque::with_capacity(10)) }
    }

    /// Samples each candidate's posterior and returns the argmax; with
    /// probability `epsilon` explores uniformly at random instead. New arms
    /// are seeded with the default Beta(2,2) prior on first sight.
    pub async fn select(&self, candidates: &[String]) -> String {
        if candidates.is_empty() {
            return "POST_PROPOSAL".to_string();
        }

        {
            let mut state = self.state.write().await;
            for arm in candidates {
                state.entry(arm.clone()).or_insert_with(ArmState::default);
            }
        }

        let explore = rand::thread_rng().gen_bool(self.epsilon.clamp(0.0, 1.0));
        let chosen = if explore {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            candidates[idx].clone()
        } else {
            let state = self.state.read().await;
            let mut rng = rand::thread_rng();
            let mut best: Option<(String, f64)> = None;
            for arm in candidates {
                let s = state.get(arm).copied().unwrap_or_default();
                let sample = sample_beta(&mut rng, s.alpha, s.beta);
                if best.as_ref().map(|(_, b)| sample > *b).unwrap_or(true) {
                    best = Some((arm.clone(), sample));
                }
            }
            best.map(|(arm, _)| arm).unwrap_or_else(|| candidates[0].clone())
        };

        let mut recent = self.recent_decisions.write().await;
        if recent.len() == 10 {
            recent.pop_front();
        }
        recent.push_back(chosen.clone());

        chosen
    }

    /// P11: `alpha' = alpha + r`, `beta' = beta + (1-r)`, `pulls' = pulls+1`,
    /// with `r` clamped into `[0,1]` first.
    pub async fn record_outcome(&self, arm: &str, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let mut state = self.state.write().await;
        let entry = state.entry(arm.to_string()).or_insert_with(ArmState::default);
        entry.alpha += reward;
        entry.beta += 1.0 - reward;
        entry.pulls += 1;
    }

    pub async fn state_of(&self, arm: &str) -> ArmState {
        self.state.read().await.get(arm).copied().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> HashMap<String, ArmState> {
        self.state.read().await.clone()
    }

    pub async fn recent_decisions(&self) -> Vec<String> {
        self.recent_decisions.read().await.iter().cloned().collect()
    }
}

/// Draws one Beta(alpha,beta) sample, falling back to a uniform draw if the
/// parameters are degenerate. Exposed beyond this crate so the Selector can
/// combine a fresh per-action-type Thompson sample with its own scoring
/// weights (§4.3 "the bandit samples one action type from the weighted
/// eligible set").
pub fn sample_beta(rng: &mut impl Rng, alpha: f64, beta: f64) -> f64 {
    use rand::distributions::Distribution;
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.gen_range(0.0..1.0),
    }
}

/// Encodes the arm tuple (Glossary: "Arm") into the bandit's string key.
pub fn arm_key(post_type: &str, topic: &str, hour_bin: u8, cta_variant: &str, intensity: i32) -> String {
    format!("{post_type}|{topic}|{hour_bin}|{cta_variant}|{intensity}")
}

/// Rolling-window percentile normalizer (Design Notes: "retain the rolling
/// window as a simple sorted buffer of ≤100 floats"). Converts a raw J-score
/// into a `[0,1]` reward relative to recent history.
pub struct RewardNormalizer {
    window: RwLock<VecDeque<f64>>,
    cap: usize,
}

impl RewardNormalizer {
    pub fn new(cap: usize) -> Self {
        Self { window: RwLock::new(VecDeque::with_capacity(cap)), cap }
    }

    /// Inserts `value`, evicting the oldest entry once over `cap`, then
    /// returns `value`'s percentile rank within the (post-insert) window.
    pub async fn normalize(&self, value: f64) -> f64 {
        let mut window = self.window.write().await;
        if window.len() >= self.cap {
            window.pop_front();
        }
        window.push_back(value);

        if window.len() == 1 {
            return 0.5;
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = sorted.iter().filter(|&&v| v <= value).count();
        rank as f64 / sorted.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_outcome_matches_p11_update_rule() {
        let bandit = ThompsonBandit::new(0.0);
        bandit.record_outcome("POST_PROPOSAL", 0.0).await;
        bandit.record_outcome("REPLY_MENTIONS", 1.0).await;
        let a = bandit.state_of("POST_PROPOSAL").await;
        let b = bandit.state_of("REPLY_MENTIONS").await;
        assert!((a.mean() - 0.4).abs() < 1e-9);
        assert!((b.mean() - 0.6).abs() < 1e-9);
        assert_eq!(a.pulls, 1);
    }

    #[tokio::test]
    async fn reward_is_clamped_into_unit_interval() {
        let bandit = ThompsonBandit::new(0.0);
        bandit.record_outcome("X", 5.0).await;
        let s = bandit.state_of("X").await;
        assert_eq!(s.alpha, 3.0);
        assert_eq!(s.beta, 2.0);
    }

    #[tokio::test]
    async fn zero_epsilon_never_explores_randomly() {
        let bandit = ThompsonBandit::new(0.0);
        let candidates = vec!["A".to_string(), "B".to_string()];
        for _ in 0..5 {
            let chosen = bandit.select(&candidates).await;
            assert!(candidates.contains(&chosen));
        }
    }

    #[tokio::test]
    async fn normalizer_ranks_new_maximum_at_top() {
        let norm = RewardNormalizer::new(100);
        for v in [0.1, 0.2, 0.3, 0.4] {
            norm.normalize(v).await;
        }
        let rank = norm.normalize(1.0).await;
        assert_eq!(rank, 1.0);
    }

    #[test]
    fn arm_key_is_stable_for_equal_tuples() {
        assert_eq!(arm_key("POST_PROPOSAL", "ai", 9, "link", 2), arm_key("POST_PROPOSAL", "ai", 9, "link", 2));
    }
}
