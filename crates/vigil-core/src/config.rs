//! Runtime configuration (§6). Loaded from `config/vigil.toml` (if present)
//! and overridden by `VIGIL__*` environment variables: defaults, then file,
//! then environment, lowest to highest precedence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Goal mode driving the analytics weighting (§6, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GoalMode {
    #[default]
    Fame,
    Monetize,
    Impact,
    Authority,
    Revenue,
}

impl GoalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalMode::Fame => "FAME",
            GoalMode::Monetize => "MONETIZE",
            GoalMode::Impact => "IMPACT",
            GoalMode::Authority => "AUTHORITY",
            GoalMode::Revenue => "REVENUE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "FAME" => Some(GoalMode::Fame),
            "MONETIZE" => Some(GoalMode::Monetize),
            "IMPACT" => Some(GoalMode::Impact),
            "AUTHORITY" => Some(GoalMode::Authority),
            "REVENUE" => Some(GoalMode::Revenue),
            _ => None,
        }
    }
}

/// Per-mode goal weights {alpha, beta, gamma, lambda} (§6 GOAL_WEIGHTS).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GoalWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub lambda: f64,
}

impl Default for GoalWeights {
    fn default() -> Self {
        Self { alpha: 0.4, beta: 0.3, gamma: 0.2, lambda: 0.1 }
    }
}

/// Quiet hours window, inclusive, wraps midnight (§4.3 eligibility filter 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { start_hour: 23, end_hour: 6 }
    }
}

impl QuietHours {
    /// True when `hour` (0..23) falls inside the window, accounting for midnight wraparound.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour <= self.end_hour
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

/// Per-platform configuration (enable flag, routing weight).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub enabled: bool,
    pub weight: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { enabled: true, weight: 1.0 }
    }
}

/// Routing mode for the Multiplexer (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformMode {
    #[default]
    Broadcast,
    Single,
    Weighted,
}

impl PlatformMode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "single" => PlatformMode::Single,
            "weighted" => PlatformMode::Weighted,
            _ => PlatformMode::Broadcast,
        }
    }
}

/// Impact-score signal weights and per-signal targets (§4.6 "Impact score").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactConfig {
    pub weekly_floor: f64,
    pub weights: HashMap<String, f64>,
    pub targets: HashMap<String, f64>,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert("pilots".to_string(), 0.3);
        weights.insert("artifacts".to_string(), 0.2);
        weights.insert("coalitions".to_string(), 0.2);
        weights.insert("citations".to_string(), 0.15);
        weights.insert("helpfulness".to_string(), 0.15);
        let mut targets = HashMap::new();
        targets.insert("pilots".to_string(), 3.0);
        targets.insert("artifacts".to_string(), 5.0);
        targets.insert("coalitions".to_string(), 2.0);
        targets.insert("citations".to_string(), 10.0);
        targets.insert("helpfulness".to_string(), 5.0);
        Self { weekly_floor: 20.0, weights, targets }
    }
}

/// One row of the §4.2 job table: an interval range in minutes plus additive
/// jitter. `min_minutes == max_minutes` encodes a fixed cadence (e.g.
/// `perception_ingest` at a flat 15 minutes); daily/weekly jobs are driven by
/// `RuntimeConfig::daily_job_hour`/`weekly_plan_weekday` instead and carry
/// `min_minutes = max_minutes = 0` here as a placeholder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobCadence {
    pub min_minutes: u64,
    pub max_minutes: u64,
    pub jitter_minutes: f64,
}

impl JobCadence {
    pub const fn fixed(minutes: u64, jitter_minutes: f64) -> Self {
        Self { min_minutes: minutes, max_minutes: minutes, jitter_minutes }
    }

    pub const fn range(min_minutes: u64, max_minutes: u64, jitter_minutes: f64) -> Self {
        Self { min_minutes, max_minutes, jitter_minutes }
    }
}

/// Names of the twelve jobs from §4.2, used as keys into
/// `RuntimeConfig::jobs` and as the Scheduler's job registry.
pub const JOB_NAMES: &[&str] = &[
    "post_proposal",
    "reply_mentions",
    "search_engage",
    "post_thread",
    "value_dm",
    "perception_ingest",
    "crisis_watch",
    "analytics_pull",
    "kpi_rollup",
    "follower_snapshot",
    "nightly_reflection",
    "weekly_plan",
];

fn default_job_cadences() -> HashMap<String, JobCadence> {
    let mut jobs = HashMap::new();
    jobs.insert("post_proposal".to_string(), JobCadence::range(45, 90, 5.0));
    jobs.insert("reply_mentions".to_string(), JobCadence::range(12, 25, 2.0));
    jobs.insert("search_engage".to_string(), JobCadence::range(25, 45, 3.0));
    jobs.insert("post_thread".to_string(), JobCadence::range(240, 360, 7.0));
    jobs.insert("value_dm".to_string(), JobCadence::range(180, 300, 6.0));
    jobs.insert("perception_ingest".to_string(), JobCadence::fixed(15, 1.0));
    jobs.insert("crisis_watch".to_string(), JobCadence::fixed(5, 0.5));
    jobs.insert("analytics_pull".to_string(), JobCadence::range(35, 60, 5.0));
    jobs.insert("kpi_rollup".to_string(), JobCadence::range(60, 90, 10.0));
    jobs.insert("follower_snapshot".to_string(), JobCadence::fixed(0, 0.0));
    jobs.insert("nightly_reflection".to_string(), JobCadence::fixed(0, 0.0));
    jobs.insert("weekly_plan".to_string(), JobCadence::fixed(0, 0.0));
    jobs
}

/// Top-level runtime configuration; one instance shared (read-only after
/// load, except for `LIVE` and `GOAL_MODE` which the out-of-scope dashboard
/// may flip at runtime through a shared handle owned by the daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// LIVE: global boolean; false => every adapter write is a dry run.
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub goal_mode: GoalMode,
    #[serde(default)]
    pub goal_weights: HashMap<String, GoalWeights>,
    #[serde(default)]
    pub quiet_hours: QuietHours,

    #[serde(default = "default_true")]
    pub adaptive_intensity: bool,
    #[serde(default = "default_min_level")]
    pub min_level: i32,
    #[serde(default = "default_max_level")]
    pub max_level: i32,
    #[serde(default = "default_true")]
    pub ragebait_guard: bool,

    #[serde(default = "default_evidence_whitelist")]
    pub evidence_whitelist: Vec<String>,

    #[serde(default)]
    pub platforms: HashMap<String, PlatformConfig>,
    #[serde(default)]
    pub platform_mode: PlatformMode,

    #[serde(default)]
    pub impact: ImpactConfig,

    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_signal_threshold")]
    pub crisis_signal_threshold: f64,
    #[serde(default = "default_resume_threshold")]
    pub crisis_resume_threshold: f64,
    /// Open Question #2: left unconstrained by default — any platform's
    /// non-dry-run calming receipt satisfies resumption.
    #[serde(default)]
    pub crisis_calming_platform: Option<String>,

    #[serde(default = "default_revenue_per_click")]
    pub revenue_per_click: f64,
    #[serde(default = "default_engagement_mean")]
    pub engagement_z_mean: f64,
    #[serde(default = "default_engagement_std")]
    pub engagement_z_std: f64,
    #[serde(default = "default_followers_mean")]
    pub followers_z_mean: f64,
    #[serde(default = "default_followers_std")]
    pub followers_z_std: f64,

    #[serde(default = "default_improvement_notes_cap")]
    pub improvement_notes_cap: usize,

    #[serde(default = "default_platform_char_limit")]
    pub default_platform_char_limit: usize,

    /// §4.2 job cadence table, keyed by name from `JOB_NAMES`.
    #[serde(default = "default_job_cadences")]
    pub jobs: HashMap<String, JobCadence>,
    /// Hour-of-day (0..23, local to the daemon's clock) `follower_snapshot`
    /// and `nightly_reflection` fire at.
    #[serde(default = "default_follower_snapshot_hour")]
    pub follower_snapshot_hour: u8,
    #[serde(default = "default_nightly_reflection_hour")]
    pub nightly_reflection_hour: u8,
    /// `weekly_plan` fires Sunday (`chrono::Weekday::Sun`) at this hour.
    #[serde(default = "default_weekly_plan_hour")]
    pub weekly_plan_hour: u8,
    /// Bounded grace window the Scheduler allows in-flight jobs to finish
    /// within on shutdown before force-abort (§4.2, "Cancellation").
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// §4.7 "epsilon-greedy exploration floor" shared by `ThompsonBandit` and
    /// `ArmOptimizer`.
    #[serde(default = "default_bandit_epsilon")]
    pub bandit_epsilon: f64,
    /// §4.4 LLM call budget (per-hour/per-day) the Generator's
    /// `BudgetedLlmClient` enforces before falling back to a template.
    #[serde(default = "default_llm_calls_per_hour")]
    pub llm_calls_per_hour: u32,
    #[serde(default = "default_llm_calls_per_day")]
    pub llm_calls_per_day: u32,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

fn default_true() -> bool {
    true
}
fn default_min_level() -> i32 {
    0
}
fn default_max_level() -> i32 {
    5
}
fn default_evidence_whitelist() -> Vec<String> {
    vec![
        ".gov".into(),
        ".edu".into(),
        "reuters.com".into(),
        "apnews.com".into(),
        "bbc.co.uk".into(),
    ]
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_secs() -> u64 {
    300
}
fn default_max_write_attempts() -> u32 {
    5
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_signal_threshold() -> f64 {
    12.0
}
fn default_resume_threshold() -> f64 {
    6.0
}
fn default_revenue_per_click() -> f64 {
    0.05
}
fn default_engagement_mean() -> f64 {
    100.0
}
fn default_engagement_std() -> f64 {
    50.0
}
fn default_followers_mean() -> f64 {
    10.0
}
fn default_followers_std() -> f64 {
    20.0
}
fn default_improvement_notes_cap() -> usize {
    100
}
fn default_platform_char_limit() -> usize {
    280
}
fn default_follower_snapshot_hour() -> u8 {
    4
}
fn default_nightly_reflection_hour() -> u8 {
    2
}
fn default_weekly_plan_hour() -> u8 {
    5
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_bandit_epsilon() -> f64 {
    0.1
}
fn default_llm_calls_per_hour() -> u32 {
    20
}
fn default_llm_calls_per_day() -> u32 {
    200
}
fn default_llm_model() -> String {
    "meta-llama/llama-3.3-70b-instruct".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut goal_weights = HashMap::new();
        goal_weights.insert("FAME".to_string(), GoalWeights { alpha: 0.5, beta: 0.2, gamma: 0.2, lambda: 0.1 });
        goal_weights.insert("MONETIZE".to_string(), GoalWeights { alpha: 0.15, beta: 0.55, gamma: 0.15, lambda: 0.15 });
        goal_weights.insert("IMPACT".to_string(), GoalWeights { alpha: 0.15, beta: 0.15, gamma: 0.6, lambda: 0.1 });
        goal_weights.insert("AUTHORITY".to_string(), GoalWeights { alpha: 0.3, beta: 0.1, gamma: 0.3, lambda: 0.3 });
        goal_weights.insert("REVENUE".to_string(), GoalWeights { alpha: 0.1, beta: 0.7, gamma: 0.1, lambda: 0.1 });

        let mut platforms = HashMap::new();
        platforms.insert("x".to_string(), PlatformConfig { enabled: true, weight: 1.0 });
        platforms.insert("linkedin".to_string(), PlatformConfig { enabled: false, weight: 0.5 });
        platforms.insert("mastodon".to_string(), PlatformConfig { enabled: false, weight: 0.5 });

        Self {
            live: false,
            goal_mode: GoalMode::default(),
            goal_weights,
            quiet_hours: QuietHours::default(),
            adaptive_intensity: true,
            min_level: 0,
            max_level: 5,
            ragebait_guard: true,
            evidence_whitelist: default_evidence_whitelist(),
            platforms,
            platform_mode: PlatformMode::default(),
            impact: ImpactConfig::default(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_secs: default_breaker_reset_secs(),
            max_write_attempts: default_max_write_attempts(),
            max_backoff_secs: default_max_backoff_secs(),
            crisis_signal_threshold: default_signal_threshold(),
            crisis_resume_threshold: default_resume_threshold(),
            crisis_calming_platform: None,
            revenue_per_click: default_revenue_per_click(),
            engagement_z_mean: default_engagement_mean(),
            engagement_z_std: default_engagement_std(),
            followers_z_mean: default_followers_mean(),
            followers_z_std: default_followers_std(),
            improvement_notes_cap: default_improvement_notes_cap(),
            default_platform_char_limit: default_platform_char_limit(),
            jobs: default_job_cadences(),
            follower_snapshot_hour: default_follower_snapshot_hour(),
            nightly_reflection_hour: default_nightly_reflection_hour(),
            weekly_plan_hour: default_weekly_plan_hour(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            bandit_epsilon: default_bandit_epsilon(),
            llm_calls_per_hour: default_llm_calls_per_hour(),
            llm_calls_per_day: default_llm_calls_per_day(),
            llm_model: default_llm_model(),
        }
    }
}

impl RuntimeConfig {
    /// Load config from file and environment. Precedence: defaults < `config/vigil.toml` < `VIGIL__*` env.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "config/vigil".to_string());
        let defaults = RuntimeConfig::default();
        let defaults_json = serde_json::to_value(&defaults).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = config::Config::builder();
        if let serde_json::Value::Object(map) = defaults_json {
            for (k, v) in map {
                builder = builder.set_default(&k, json_to_config_value(v))?;
            }
        }

        let path = std::path::Path::new(&config_path);
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }

        let built = builder
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn goal_weights_for(&self, mode: GoalMode) -> GoalWeights {
        self.goal_weights
            .get(mode.as_str())
            .copied()
            .unwrap_or_default()
    }

    pub fn platform(&self, name: &str) -> PlatformConfig {
        self.platforms.get(name).cloned().unwrap_or_default()
    }

    pub fn job_cadence(&self, name: &str) -> JobCadence {
        self.jobs.get(name).copied().unwrap_or(JobCadence::fixed(60, 5.0))
    }
}

fn json_to_config_value(v: serde_json::Value) -> config::Value {
    match v {
        serde_json::Value::Null => config::Value::from(Option::<String>::None),
        serde_json::Value::Bool(b) => config::Value::from(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                config::Value::from(i)
            } else {
                config::Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => config::Value::from(s),
        serde_json::Value::Array(arr) => {
            config::Value::from(arr.into_iter().map(json_to_config_value).collect::<Vec<_>>())
        }
        serde_json::Value::Object(map) => {
            let out: HashMap<String, config::Value> =
                map.into_iter().map(|(k, v)| (k, json_to_config_value(v))).collect();
            config::Value::from(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_five_goal_modes() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.goal_weights.len(), 5);
    }

    #[test]
    fn quiet_hours_wraps_midnight() {
        let qh = QuietHours { start_hour: 23, end_hour: 6 };
        assert!(qh.contains(23));
        assert!(qh.contains(0));
        assert!(qh.contains(6));
        assert!(!qh.contains(12));
    }

    #[test]
    fn platform_mode_parses_case_insensitively() {
        assert_eq!(PlatformMode::from_str("Weighted"), PlatformMode::Weighted);
        assert_eq!(PlatformMode::from_str("bogus"), PlatformMode::Broadcast);
    }

    #[test]
    fn default_config_has_all_twelve_jobs() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.jobs.len(), JOB_NAMES.len());
        for name in JOB_NAMES {
            assert!(cfg.jobs.contains_key(*name), "missing cadence for {name}");
        }
    }

    #[test]
    fn unknown_job_falls_back_to_a_default_cadence() {
        let cfg = RuntimeConfig::default();
        let cadence = cfg.job_cadence("not_a_real_job");
        assert_eq!(cadence.min_minutes, 60);
    }
}
