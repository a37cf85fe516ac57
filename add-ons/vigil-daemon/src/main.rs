//! Vigil daemon: wires every `vigil-*` crate into the twelve scheduled jobs
//! of §4.2 and runs them until `Ctrl-C`, with a dotenv+tracing bootstrap and
//! a `Scheduler` that runs one task per job name until shutdown is
//! requested.

mod jobs;
mod platform;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_bandit::{ArmOptimizer, RewardNormalizer, ThompsonBandit};
use vigil_core::{
    ActionType, InMemoryPersistence, Persistence, Persona, PlatformConfig, RuntimeConfig, SledPersistence,
    VigilError, VigilResult, JOB_NAMES,
};
use vigil_crisis::CrisisService;
use vigil_generator::{BudgetedLlmClient, Generator, OpenRouterClient};
use vigil_perception::{PerceptionSeed, PerceptionService};
use vigil_persona::PersonaStore;
use vigil_publisher::{HttpPlatformClient, Multiplexer, PlatformAdapter, PlatformWriter};
use vigil_scheduler::Scheduler;
use vigil_selector::Selector;

use platform::{ConfiguredLlm, OfflinePlatformClient};

/// Everything a job tick needs; cheap to clone since every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub persistence: Arc<dyn Persistence>,
    pub persona: Arc<PersonaStore>,
    pub crisis: Arc<CrisisService>,
    pub selector: Arc<Selector>,
    pub reward_normalizer: Arc<RewardNormalizer>,
    pub generator: Arc<Generator<ConfiguredLlm>>,
    pub multiplexer: Arc<Multiplexer>,
    pub perception: Arc<PerceptionService>,
    pub metrics_client: Arc<dyn vigil_publisher::RawPlatformClient>,
    pub last_action: Arc<RwLock<HashMap<ActionType, chrono::DateTime<chrono::Utc>>>>,
    pub recently_dmed: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// §4.3 intensity policy's "previous successful intensity" input: the
    /// intensity of the last non-dry-run publish per action type.
    pub last_successful_intensity: Arc<RwLock<HashMap<ActionType, i32>>>,
}

fn seed_persona() -> Persona {
    let mut content_mix = HashMap::new();
    content_mix.insert("proposals".to_string(), 0.5);
    content_mix.insert("elite_replies".to_string(), 0.3);
    content_mix.insert("summaries".to_string(), 0.2);
    let mut tone_rules = HashMap::new();
    tone_rules.insert("register".to_string(), "direct, evidence-led, no hype".to_string());
    Persona {
        version: 0,
        hash: String::new(),
        handle: "vigil".to_string(),
        mission: "Build public trust in well-evidenced, accountable automation.".to_string(),
        beliefs: vec![
            "Claims need receipts before they need an audience.".to_string(),
            "A rollback plan is part of the pitch, not an afterthought.".to_string(),
        ],
        doctrine: vec!["observe".to_string(), "propose".to_string(), "pilot".to_string(), "report".to_string()],
        tone_rules,
        content_mix,
        templates: HashMap::new(),
        guardrails: vec!["never promise guaranteed outcomes".to_string(), "always name a fallback".to_string()],
        intensity_settings: vigil_core::IntensitySettings {
            curiosity: 0.25,
            novelty: 0.25,
            impact: 0.25,
            stability: 0.25,
            min_intensity: 0,
            max_intensity: 5,
        },
    }
}

/// Picks the platform perception/analytics pull from: the first configured,
/// enabled platform, preferring `x` when it's present and enabled.
fn primary_platform(config: &RuntimeConfig) -> String {
    if config.platforms.get("x").map(PlatformConfig::clone).map(|p| p.enabled).unwrap_or(false) {
        return "x".to_string();
    }
    config
        .platforms
        .iter()
        .find(|(_, p)| p.enabled)
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "x".to_string())
}

fn build_raw_client(platform: &str) -> Box<dyn vigil_publisher::RawPlatformClient> {
    match HttpPlatformClient::from_env(platform) {
        Some(client) => Box::new(client),
        None => Box::new(OfflinePlatformClient::new(platform)),
    }
}

async fn build_persistence(config: &RuntimeConfig) -> VigilResult<Arc<dyn Persistence>> {
    match std::env::var("VIGIL_DB_PATH") {
        Ok(path) => {
            tracing::info!(path, "opening sled persistence");
            let store = SledPersistence::open(&path)?;
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::info!("VIGIL_DB_PATH not set; using in-memory persistence (not durable across restarts)");
            let _ = config;
            Ok(Arc::new(InMemoryPersistence::new()))
        }
    }
}

async fn build_state() -> VigilResult<AppState> {
    let config = Arc::new(RuntimeConfig::load()?);
    let persistence = build_persistence(&config).await?;

    let persona_path = std::env::var("VIGIL_PERSONA_PATH").unwrap_or_else(|_| "config/persona.json".to_string());
    let persona = Arc::new(PersonaStore::load(persona_path, persistence.clone(), seed_persona()).await?);

    let crisis = vigil_crisis::shared(&config);

    let bandit = Arc::new(ThompsonBandit::new(config.bandit_epsilon));
    let optimizer = Arc::new(ArmOptimizer::new(config.bandit_epsilon));
    let selector = Arc::new(Selector::new(bandit, optimizer));
    let reward_normalizer = Arc::new(RewardNormalizer::new(200));

    let llm_backend = match OpenRouterClient::from_env(config.llm_model.clone()) {
        Some(client) => {
            tracing::info!(model = %config.llm_model, "LLM backend: OpenRouter");
            ConfiguredLlm::OpenRouter(client)
        }
        None => {
            tracing::warn!("OPENROUTER_API_KEY not set; generation falls back to deterministic templates");
            ConfiguredLlm::Disabled
        }
    };
    let budgeted = BudgetedLlmClient::new(llm_backend, config.llm_calls_per_hour, config.llm_calls_per_day);
    let generator = Arc::new(Generator::new(persona.clone(), budgeted, (*config).clone()));

    let live = Arc::new(AtomicBool::new(config.live));
    let mut adapters: HashMap<String, Arc<dyn PlatformWriter>> = HashMap::new();
    let mut weights: HashMap<String, f64> = HashMap::new();
    for (name, platform_config) in &config.platforms {
        if !platform_config.enabled {
            continue;
        }
        weights.insert(name.clone(), platform_config.weight);
        match HttpPlatformClient::from_env(name) {
            Some(client) => {
                let adapter = PlatformAdapter::new(client, live.clone(), &config);
                adapters.insert(name.clone(), Arc::new(adapter));
            }
            None => {
                tracing::warn!(platform = %name, "no credentials in environment; platform stays dry-run only");
                let adapter = PlatformAdapter::new(OfflinePlatformClient::new(name), live.clone(), &config);
                adapters.insert(name.clone(), Arc::new(adapter));
            }
        }
    }
    let multiplexer = Arc::new(Multiplexer::new(adapters, config.platform_mode, weights));

    let primary = primary_platform(&config);
    let perception_seed_path = std::env::var("VIGIL_PERCEPTION_SEED_PATH").unwrap_or_else(|_| "config/perception.toml".to_string());
    let perception = Arc::new(PerceptionService::new(build_raw_client(&primary), PerceptionSeed::load(perception_seed_path)));
    let metrics_client: Arc<dyn vigil_publisher::RawPlatformClient> = build_raw_client(&primary).into();

    Ok(AppState {
        config,
        persistence,
        persona,
        crisis,
        selector,
        reward_normalizer,
        generator,
        multiplexer,
        perception,
        metrics_client,
        last_action: Arc::new(RwLock::new(HashMap::new())),
        recently_dmed: Arc::new(RwLock::new(HashMap::new())),
        last_successful_intensity: Arc::new(RwLock::new(HashMap::new())),
    })
}

#[tokio::main]
async fn main() -> VigilResult<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vigil-daemon] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = build_state().await?;
    tracing::info!(
        live = state.config.live,
        goal_mode = state.config.goal_mode.as_str(),
        platforms = ?state.multiplexer.enabled_platforms(),
        "vigil daemon started"
    );

    let scheduler = Arc::new(Scheduler::new((*state.config).clone()));
    let mut handles = Vec::with_capacity(JOB_NAMES.len());

    for &name in JOB_NAMES {
        let scheduler = scheduler.clone();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .run_job(name, move || {
                    let state = state.clone();
                    async move { jobs::run(name, state).await }
                })
                .await;
        }));
    }

    tokio::signal::ctrl_c().await.map_err(|e| VigilError::Invariant(format!("failed to listen for ctrl-c: {e}")))?;
    tracing::info!("ctrl-c received; requesting graceful shutdown");
    scheduler.request_shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("vigil daemon stopped");
    Ok(())
}
