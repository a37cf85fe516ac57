//! Error taxonomy (§7). Each variant is matched by the daemon to decide
//! retry/log/skip behavior.

use thiserror::Error;

/// Top-level error for the Vigil core and its calling crates.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Transient-remote: platform rate-limit, remote timeout, 5xx. Caller should
    /// retry with backoff; repeated occurrences count toward a circuit breaker.
    #[error("transient remote failure on {endpoint}: {detail}")]
    TransientRemote { endpoint: String, detail: String },

    /// Persistent-remote: 4xx other than rate-limit, invalid credentials. Do not retry.
    #[error("persistent remote failure on {endpoint}: {detail}")]
    PersistentRemote { endpoint: String, detail: String },

    /// Gate-rejected content (ethics/completeness/cadence/receipts/duplicate).
    #[error("content rejected by gate '{gate}': {detail}")]
    GateRejected { gate: String, detail: String },

    /// Persona document failed validation; previous version keeps serving.
    #[error("persona invalid: {0}")]
    PersonaInvalid(String),

    /// A perception source failed; the remaining sources still produce a SensedEvent.
    #[error("perception source '{source}' failed: {detail}")]
    PerceptionSource { source: String, detail: String },

    /// Crisis guard denied an action; not a failure, but surfaced as a typed outcome.
    #[error("action blocked by crisis guard: {0}")]
    CrisisBlocked(String),

    /// Persistence-layer failure (contract violation aside).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for invariant violations surfaced during development/testing.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<config::ConfigError> for VigilError {
    fn from(e: config::ConfigError) -> Self {
        VigilError::Config(e.to_string())
    }
}

pub type VigilResult<T> = Result<T, VigilError>;
