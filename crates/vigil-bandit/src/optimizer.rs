//! The "Optimizer" half of §4.7: samples the `(topic, hour_bin, cta_variant,
//! intensity)` arm tuple one dimension at a time, independently, the way
//! `ThompsonBandit` samples a single action-type arm. Each dimension keeps
//! its own Beta(2,2)-seeded posterior table; a pick's `sampled_prob` is the
//! product of the four per-dimension samples, matching "returns the product
//! of sampled probs as `sampled_prob`".

use std::collections::HashMap;
use std::hash::Hash;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{sample_beta, ArmState};

/// One full arm pick plus the combined probability the optimizer assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmPick {
    pub topic: String,
    pub hour_bin: u8,
    pub cta_variant: String,
    pub intensity: i32,
    pub sampled_prob: f64,
}

/// Per-dimension Thompson sampler over `(topic, hour_bin, cta_variant,
/// intensity)`. Distinct from `ThompsonBandit`, which samples a single
/// top-level action-type arm; the Selector uses both (§4.3 "Arm pick").
pub struct ArmOptimizer {
    topic: RwLock<HashMap<String, ArmState>>,
    hour_bin: RwLock<HashMap<u8, ArmState>>,
    cta_variant: RwLock<HashMap<String, ArmState>>,
    intensity: RwLock<HashMap<i32, ArmState>>,
    epsilon: f64,
}

impl ArmOptimizer {
    pub fn new(epsilon: f64) -> Self {
        Self {
            topic: RwLock::new(HashMap::new()),
            hour_bin: RwLock::new(HashMap::new()),
            cta_variant: RwLock::new(HashMap::new()),
            intensity: RwLock::new(HashMap::new()),
            epsilon,
        }
    }

    /// Samples each dimension independently and combines them into one pick.
    /// Any candidate list that is empty falls back to a single default value
    /// for that dimension so a pick is always returned.
    pub async fn sample_arm(&self, topics: &[String], hour_bins: &[u8], cta_variants: &[String], intensities: &[i32]) -> ArmPick {
        let (topic, p_topic) = sample_dimension(&self.topic, &fallback(topics, "general".to_string()), self.epsilon).await;
        let (hour_bin, p_hour) = sample_dimension(&self.hour_bin, &fallback(hour_bins, 12u8), self.epsilon).await;
        let (cta_variant, p_cta) = sample_dimension(&self.cta_variant, &fallback(cta_variants, "default".to_string()), self.epsilon).await;
        let (intensity, p_intensity) = sample_dimension(&self.intensity, &fallback(intensities, 1i32), self.epsilon).await;

        ArmPick { topic, hour_bin, cta_variant, intensity, sampled_prob: p_topic * p_hour * p_cta * p_intensity }
    }

    /// Folds one reward measurement into every dimension's posterior for the
    /// arm it came from (§4.7 "Reward conversion").
    pub async fn record_outcome(&self, pick: &ArmPick, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        update(&self.topic, &pick.topic, reward).await;
        update(&self.hour_bin, &pick.hour_bin, reward).await;
        update(&self.cta_variant, &pick.cta_variant, reward).await;
        update(&self.intensity, &pick.intensity, reward).await;
    }

    pub async fn topic_state(&self, topic: &str) -> ArmState {
        self.topic.read().await.get(topic).copied().unwrap_or_default()
    }

    pub async fn intensity_state(&self, intensity: i32) -> ArmState {
        self.intensity.read().await.get(&intensity).copied().unwrap_or_default()
    }
}

fn fallback<T: Clone>(candidates: &[T], default: T) -> Vec<T> {
    if candidates.is_empty() {
        vec![default]
    } else {
        candidates.to_vec()
    }
}

async fn sample_dimension<K: Clone + Eq + Hash>(state: &RwLock<HashMap<K, ArmState>>, candidates: &[K], epsilon: f64) -> (K, f64) {
    {
        let mut s = state.write().await;
        for c in candidates {
            s.entry(c.clone()).or_insert_with(ArmState::default);
        }
    }

    let mut rng = rand::thread_rng();
    if rng.gen_bool(epsilon.clamp(0.0, 1.0)) {
        let idx = rng.gen_range(0..candidates.len());
        let chosen = candidates[idx].clone();
        let s = state.read().await;
        let st = s.get(&chosen).copied().unwrap_or_default();
        return (chosen, sample_beta(&mut rng, st.alpha, st.beta));
    }

    let s = state.read().await;
    let mut best: Option<(K, f64)> = None;
    for c in candidates {
        let st = s.get(c).copied().unwrap_or_default();
        let p = sample_beta(&mut rng, st.alpha, st.beta);
        if best.as_ref().map(|(_, b)| p > *b).unwrap_or(true) {
            best = Some((c.clone(), p));
        }
    }
    best.unwrap_or_else(|| (candidates[0].clone(), 0.5))
}

async fn update<K: Eq + Hash + Clone>(state: &RwLock<HashMap<K, ArmState>>, key: &K, reward: f64) {
    let mut s = state.write().await;
    let entry = s.entry(key.clone()).or_insert_with(ArmState::default);
    entry.alpha += reward;
    entry.beta += 1.0 - reward;
    entry.pulls += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_arm_falls_back_on_empty_candidate_lists() {
        let opt = ArmOptimizer::new(0.0);
        let pick = opt.sample_arm(&[], &[], &[], &[]).await;
        assert_eq!(pick.topic, "general");
        assert_eq!(pick.hour_bin, 12);
        assert_eq!(pick.cta_variant, "default");
        assert_eq!(pick.intensity, 1);
    }

    #[tokio::test]
    async fn record_outcome_updates_every_dimension() {
        let opt = ArmOptimizer::new(0.0);
        let pick = ArmPick { topic: "ai".into(), hour_bin: 9, cta_variant: "link".into(), intensity: 2, sampled_prob: 0.5 };
        opt.record_outcome(&pick, 1.0).await;
        let topic_state = opt.topic_state("ai").await;
        let intensity_state = opt.intensity_state(2).await;
        assert_eq!(topic_state.alpha, 3.0);
        assert_eq!(intensity_state.alpha, 3.0);
    }

    #[tokio::test]
    async fn sampled_prob_is_product_of_four_dimensions() {
        let opt = ArmOptimizer::new(0.0);
        let pick = opt.sample_arm(&["ai".to_string()], &[9u8], &["link".to_string()], &[2i32]).await;
        assert!(pick.sampled_prob >= 0.0 && pick.sampled_prob <= 1.0);
        assert_eq!(pick.topic, "ai");
        assert_eq!(pick.hour_bin, 9);
    }
}
