//! Shared domain types, configuration, the persistence contract, canonical
//! hashing, and the error taxonomy. Every other `vigil-*` crate depends on
//! this one; it depends on nothing in the workspace.

pub mod config;
pub mod error;
pub mod hash;
pub mod models;
pub mod persistence;

pub use config::{
    GoalMode, GoalWeights, ImpactConfig, JobCadence, PlatformConfig, PlatformMode, QuietHours, RuntimeConfig,
    JOB_NAMES,
};
pub use error::{VigilError, VigilResult};
pub use hash::{canonical_hash, canonical_hash_of};
pub use models::{
    ActionType, ArmSelection, CircuitBreakerState, CrisisMetrics, CrisisState, Engagement, FollowersSnapshot,
    ImprovementNote, IntensitySettings, Outcome, Persona, PersonaVersion, Post, PostKind, Redirect, SensedEvent,
    StructuredOutcome,
};
pub use persistence::{InMemoryPersistence, Persistence, SledPersistence};
