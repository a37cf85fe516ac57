//! Fame/authority/revenue/impact metrics and both the per-post and global
//! J-score (§4.6).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{GoalWeights, ImpactConfig, Post, Redirect, StructuredOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct FameScore {
    pub fame_score: f64,
    pub engagement_proxy: f64,
    pub follower_delta: f64,
    pub engagement_z: f64,
    pub follower_z: f64,
}

fn simple_z_score(value: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        return 0.0;
    }
    (value - mean) / std
}

/// Fame Score = z(engagement_proxy) + z(follower_delta), over the given window.
pub fn fame_score(posts: &[Post], follower_delta: f64, engagement_z_mean: f64, engagement_z_std: f64, followers_z_mean: f64, followers_z_std: f64) -> FameScore {
    if posts.is_empty() {
        return FameScore::default();
    }
    let engagement_proxy: f64 = posts.iter().map(|p| p.engagement.engagement_proxy()).sum();
    let engagement_z = simple_z_score(engagement_proxy, engagement_z_mean, engagement_z_std);
    let follower_z = simple_z_score(follower_delta, followers_z_mean, followers_z_std);
    FameScore {
        fame_score: round2(engagement_z + follower_z),
        engagement_proxy,
        follower_delta,
        engagement_z: round2(engagement_z),
        follower_z: round2(follower_z),
    }
}

/// Revenue/day = sum(clicks * revenue_per_click) across all redirects.
pub fn revenue_per_day(redirects: &[Redirect], revenue_per_click: f64) -> f64 {
    round2(redirects.iter().map(|r| r.clicks as f64 * revenue_per_click).sum())
}

/// Sum of per-post authority scores, normalized and capped at 100.
pub fn authority_signals(posts: &[Post]) -> f64 {
    let total: f64 = posts.iter().map(|p| p.authority_score).sum();
    round2((total / 10.0).min(100.0).max(0.0))
}

/// Per-post authority heuristic from raw engagement counts: retweet/like
/// ratio (capped at 10) plus a reply-engagement boost above 5 replies
/// (capped at 5).
pub fn compute_authority_score(likes: u64, reposts: u64, replies: u64) -> f64 {
    let mut score = if likes > 0 { (reposts as f64 / likes as f64 * 10.0).min(10.0) } else { 0.0 };
    if replies > 5 {
        score += (replies as f64 * 0.5).min(5.0);
    }
    score
}

/// penalty = rate_limit_count*2 + violation_count*5 (§4.6: rate-limit
/// strikes and ethics/mute/block violations over the window).
pub fn penalty_score(rate_limit_count: u64, violation_count: u64) -> f64 {
    (rate_limit_count as f64) * 2.0 + (violation_count as f64) * 5.0
}

/// Optional hints passed alongside generated text so an extracted outcome
/// can carry a more specific label than the raw keyword match (§4.6
/// structured-outcome extraction). All fields are best-effort; absent hints
/// fall back to generic labels.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext<'a> {
    pub topic: Option<&'a str>,
    pub partner: Option<&'a str>,
    pub channel: Option<&'a str>,
}

static CITATION_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").unwrap());

/// Bare `http(s)://` URLs appearing in `text`, in order of appearance.
pub fn extract_citations_from_text(text: &str) -> Vec<String> {
    CITATION_URL.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Heuristically derives structured outcomes from freshly generated or
/// observed text (§4.6): pilot acceptance, artifact forks, coalition
/// partners, citation URLs, and positive-acknowledgement helpfulness
/// feedback. Each hit is tagged with `post_id` so it composes with
/// `Persistence::append_structured_outcome`.
pub fn extract_structured_outcomes(text: &str, post_id: Uuid, ctx: &ExtractionContext<'_>) -> Vec<StructuredOutcome> {
    let lowered = text.to_lowercase();
    let mut outcomes = Vec::new();

    if lowered.contains("pilot accepted") || lowered.contains("signed the pilot") {
        outcomes.push(StructuredOutcome::PilotAcceptance {
            post_id,
            detail: ctx.topic.unwrap_or("pilot").to_string(),
        });
    }

    if lowered.contains("fork") || lowered.contains("clone") {
        outcomes.push(StructuredOutcome::ArtifactFork {
            post_id,
            platform: lowered.contains("github").then(|| "github".to_string()),
        });
    }

    if lowered.contains("coalition") || lowered.contains("partner") || lowered.contains("ally") {
        outcomes.push(StructuredOutcome::CoalitionPartner {
            post_id,
            partner: ctx.partner.or(ctx.topic).unwrap_or("partner").to_string(),
        });
    }

    for url in extract_citations_from_text(text) {
        outcomes.push(StructuredOutcome::Citation { post_id, url });
    }

    const ACKNOWLEDGEMENTS: [&str; 4] = ["thank you", "appreciate", "super helpful", "that helps"];
    if ACKNOWLEDGEMENTS.iter().any(|kw| lowered.contains(kw)) {
        outcomes.push(StructuredOutcome::HelpfulnessFeedback {
            post_id,
            channel: ctx.channel.unwrap_or("x").to_string(),
            rating: 5,
            comment: Some("positive acknowledgement detected".to_string()),
        });
    }

    outcomes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactComponent {
    pub count: u64,
    pub normalized: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactScoreResult {
    pub impact_score: f64,
    pub components: HashMap<String, ImpactComponent>,
}

/// Counts structured outcomes by variant within the analytics window
/// (§3 StructuredOutcome, §4.6 Impact score).
pub fn tally_structured_outcomes(outcomes: &[StructuredOutcome]) -> (u64, u64, u64, u64, Vec<u8>) {
    let (mut pilots, mut forks, mut partners, mut citations) = (0u64, 0u64, 0u64, 0u64);
    let mut ratings = Vec::new();
    for outcome in outcomes {
        match outcome {
            StructuredOutcome::PilotAcceptance { .. } => pilots += 1,
            StructuredOutcome::ArtifactFork { .. } => forks += 1,
            StructuredOutcome::CoalitionPartner { .. } => partners += 1,
            StructuredOutcome::Citation { .. } => citations += 1,
            StructuredOutcome::HelpfulnessFeedback { rating, .. } => ratings.push(*rating),
        }
    }
    (pilots, forks, partners, citations, ratings)
}

/// Weighted, target-normalized impact score over structured outcomes.
pub fn impact_score(config: &ImpactConfig, pilots: u64, forks: u64, partners: u64, citations: u64, helpfulness_ratings: &[u8]) -> ImpactScoreResult {
    let target = |key: &str| -> f64 { config.targets.get(key).copied().unwrap_or(1.0).max(1.0) };
    let helpfulness_avg = if helpfulness_ratings.is_empty() {
        0.0
    } else {
        helpfulness_ratings.iter().map(|r| *r as f64).sum::<f64>() / helpfulness_ratings.len() as f64
    };

    let mut normalized = HashMap::new();
    normalized.insert("pilots".to_string(), (pilots as f64 / target("pilots")).min(1.0));
    normalized.insert("artifacts".to_string(), (forks as f64 / target("artifacts")).min(1.0));
    normalized.insert("coalitions".to_string(), (partners as f64 / target("coalitions")).min(1.0));
    normalized.insert("citations".to_string(), (citations as f64 / target("citations")).min(1.0));
    normalized.insert(
        "helpfulness".to_string(),
        if helpfulness_ratings.is_empty() { 0.0 } else { (helpfulness_avg / target("helpfulness")).min(1.0) },
    );

    let weighted_sum: f64 = config.weights.iter().map(|(k, w)| w * normalized.get(k).copied().unwrap_or(0.0)).sum();

    let mut components = HashMap::new();
    components.insert("pilots".to_string(), ImpactComponent { count: pilots, normalized: normalized["pilots"] });
    components.insert("artifacts".to_string(), ImpactComponent { count: forks, normalized: normalized["artifacts"] });
    components.insert("coalitions".to_string(), ImpactComponent { count: partners, normalized: normalized["coalitions"] });
    components.insert("citations".to_string(), ImpactComponent { count: citations, normalized: normalized["citations"] });
    components.insert(
        "helpfulness".to_string(),
        ImpactComponent { count: helpfulness_ratings.len() as u64, normalized: normalized["helpfulness"] },
    );

    ImpactScoreResult { impact_score: round2(weighted_sum * 100.0), components }
}

/// P12: per-post J-score is always in `[0,1]`; penalty only ever reduces it.
/// Engagement and mission alignment are weighted evenly, then the goal
/// mode's `lambda` scales a normalized penalty subtracted from the total.
pub fn per_post_j_score(engagement_proxy: f64, mission_alignment: f64, goal_weights: &GoalWeights, penalty: f64) -> f64 {
    let engagement_component = (engagement_proxy / 100.0).min(1.0).max(0.0);
    let mission_component = mission_alignment.clamp(0.0, 1.0);
    let raw = 0.5 * engagement_component + 0.5 * mission_component;
    let penalty_normalized = (penalty / 10.0).clamp(0.0, 1.0);
    round3((raw - goal_weights.lambda * penalty_normalized).max(0.0))
}

/// Global composite J-score across goal dimensions. `alpha` weights impact,
/// `beta` weights revenue, `gamma` weights the reputation composite
/// (authority and fame averaged), `lambda` weights the penalty subtraction.
/// When `impact` falls below `impact_weekly_floor`, the revenue weight is
/// halved before renormalizing (Design Notes §9 #1: numeric defaults are
/// configuration, not hardcoded constants).
pub fn global_j_score(
    impact: f64,
    revenue: f64,
    authority: f64,
    fame: f64,
    penalty: f64,
    goal_weights: &GoalWeights,
    impact_weekly_floor: f64,
) -> f64 {
    let mut weights = [
        ("impact", goal_weights.alpha),
        ("revenue", goal_weights.beta),
        ("reputation", goal_weights.gamma),
    ];
    if impact < impact_weekly_floor {
        weights[1].1 *= 0.5;
    }
    let total_weight: f64 = weights.iter().map(|(_, w)| w).sum::<f64>().max(f64::EPSILON);

    let impact_norm = (impact / impact_weekly_floor.max(1.0)).clamp(0.0, 1.0);
    let revenue_norm = (revenue / 100.0).clamp(0.0, 1.0);
    let reputation_norm = ((authority / 100.0).clamp(0.0, 1.0) + (fame / 100.0).clamp(0.0, 1.0)) / 2.0;

    let weighted: f64 = (weights[0].1 * impact_norm + weights[1].1 * revenue_norm + weights[2].1 * reputation_norm) / total_weight;
    let penalty_normalized = (penalty / 10.0).clamp(0.0, 1.0);

    round3((weighted - goal_weights.lambda * penalty_normalized).max(0.0))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vigil_core::{Engagement, PostKind};

    fn post(likes: u64, reposts: u64, replies: u64) -> Post {
        Post {
            id: Uuid::new_v4(),
            platform: "x".into(),
            kind: PostKind::Proposal,
            text: "t".into(),
            topic: "ai".into(),
            hour_bin: 9,
            cta_variant: "none".into(),
            intensity: 1,
            ref_id: None,
            created_at: chrono::Utc::now(),
            engagement: Engagement { likes, reposts, replies, quotes: 0 },
            authority_score: 2.0,
            j_score: None,
        }
    }

    #[test]
    fn per_post_j_score_stays_within_unit_interval() {
        let weights = GoalWeights { alpha: 0.4, beta: 0.3, gamma: 0.2, lambda: 0.1 };
        let score = per_post_j_score(500.0, 1.5, &weights, 0.0);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn penalty_only_reduces_j_score() {
        let weights = GoalWeights { alpha: 0.4, beta: 0.3, gamma: 0.2, lambda: 0.1 };
        let without_penalty = per_post_j_score(50.0, 0.5, &weights, 0.0);
        let with_penalty = per_post_j_score(50.0, 0.5, &weights, 10.0);
        assert!(with_penalty <= without_penalty);
    }

    #[test]
    fn revenue_per_day_multiplies_clicks() {
        let redirects = vec![Redirect { id: Uuid::new_v4(), label: "l".into(), target_url: "u".into(), utm: None, clicks: 20, revenue: 0.0 }];
        assert_eq!(revenue_per_day(&redirects, 0.05), 1.0);
    }

    #[test]
    fn fame_score_is_sum_of_two_z_scores() {
        let posts = vec![post(50, 10, 5)];
        let result = fame_score(&posts, 10.0, 100.0, 50.0, 10.0, 20.0);
        assert_eq!(result.follower_z, 0.0);
    }

    #[test]
    fn impact_score_caps_each_component_at_target() {
        let config = ImpactConfig::default();
        let result = impact_score(&config, 100, 0, 0, 0, &[]);
        assert_eq!(result.components["pilots"].normalized, 1.0);
    }

    #[test]
    fn extraction_detects_pilot_acceptance() {
        let ctx = ExtractionContext { topic: Some("referrals"), ..Default::default() };
        let outcomes = extract_structured_outcomes("The team signed the pilot this morning.", Uuid::new_v4(), &ctx);
        assert!(matches!(outcomes[0], StructuredOutcome::PilotAcceptance { .. }));
    }

    #[test]
    fn extraction_flags_github_fork() {
        let outcomes = extract_structured_outcomes("Someone forked our repo on GitHub overnight.", Uuid::new_v4(), &ExtractionContext::default());
        assert!(matches!(&outcomes[0], StructuredOutcome::ArtifactFork { platform: Some(p), .. } if p == "github"));
    }

    #[test]
    fn extraction_pulls_every_citation_url() {
        let text = "See https://example.org/a and https://example.org/b for receipts.";
        let outcomes = extract_structured_outcomes(text, Uuid::new_v4(), &ExtractionContext::default());
        let citations = outcomes.iter().filter(|o| matches!(o, StructuredOutcome::Citation { .. })).count();
        assert_eq!(citations, 2);
    }

    #[test]
    fn extraction_detects_helpfulness_acknowledgement() {
        let outcomes = extract_structured_outcomes("Thank you, that helps a lot!", Uuid::new_v4(), &ExtractionContext::default());
        assert!(matches!(outcomes[0], StructuredOutcome::HelpfulnessFeedback { rating: 5, .. }));
    }

    #[test]
    fn extraction_is_empty_for_plain_text() {
        let outcomes = extract_structured_outcomes("Just an ordinary status update.", Uuid::new_v4(), &ExtractionContext::default());
        assert!(outcomes.is_empty());
    }
}
