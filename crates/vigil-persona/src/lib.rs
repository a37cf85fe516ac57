//! Persona Store (§4.1): the single validated source of truth for the
//! persona document. All mutation goes through `PersonaStore::update`, which
//! validates, atomically writes the on-disk copy, and appends an immutable
//! `PersonaVersion` row so `rollback`/`versions`/`diff` have history to work
//! with. Hot-reload detection (mtime + content hash) mirrors the
//! watch-and-reload shape of a hot-reload manager, generalized from recompiling
//! a skill to reloading a validated document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tokio::sync::RwLock;
use vigil_core::{
    canonical_hash_of, ImprovementNote, Outcome, Persistence, Persona, PersonaVersion, VigilError, VigilResult,
};

/// Validates a persona document against §3's structural invariants. Returns
/// the first violation found; callers surface this as `VigilError::PersonaInvalid`.
pub fn validate_persona(persona: &Persona) -> Result<(), String> {
    if persona.handle.is_empty() || persona.handle.len() > 15 {
        return Err(format!(
            "handle must be 1-15 characters, got {} ('{}')",
            persona.handle.len(),
            persona.handle
        ));
    }
    if !persona.handle.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("handle must be alphanumeric, got '{}'", persona.handle));
    }
    if persona.beliefs.is_empty() {
        return Err("beliefs must not be empty".to_string());
    }
    if persona.beliefs.iter().any(|b| b.trim().is_empty()) {
        return Err("beliefs must not contain empty entries".to_string());
    }
    if persona.mission.trim().is_empty() {
        return Err("mission must not be empty".to_string());
    }
    let mix_sum: f64 = persona.content_mix.values().sum();
    if persona.content_mix.is_empty() || !(0.95..=1.05).contains(&mix_sum) {
        return Err(format!("content_mix must sum to ~1.0, got {mix_sum}"));
    }
    if persona.intensity_settings.min_intensity > persona.intensity_settings.max_intensity {
        return Err("intensity_settings.min_intensity must be <= max_intensity".to_string());
    }
    Ok(())
}

/// Base directive prepended to every system prompt, ahead of the
/// persona-specific identity block (§4.1 "base directive").
const BASE_DIRECTIVE: &str = "You are an autonomous social-media agent operating under a single validated persona. Stay in character; never break the gates described in your guardrails.";

/// Builds the system prompt handed to the Generator's LLM client (§4.1
/// BuildSystemPrompt: base directive, identity block, beliefs, doctrine
/// joined by " -> ", tone rules, templates, guardrails, last <=5
/// improvement notes, content-mix percentages). Deterministic given a
/// persona and note set, so two runs against the same version and notes
/// hash to the same prompt. `recent_notes` should already be capped to 5 by
/// the caller (`PersonaStore::build_system_prompt` enforces this).
pub fn build_system_prompt(persona: &Persona, recent_notes: &[ImprovementNote]) -> String {
    let mut out = String::new();
    out.push_str(BASE_DIRECTIVE);
    out.push_str("\n\n");
    out.push_str(&format!("You are {} (persona v{}).\n\n", persona.handle, persona.version));
    out.push_str(&format!("Mission: {}\n\n", persona.mission));

    if !persona.beliefs.is_empty() {
        out.push_str("Beliefs:\n");
        for b in &persona.beliefs {
            out.push_str(&format!("- {b}\n"));
        }
        out.push('\n');
    }
    if !persona.doctrine.is_empty() {
        out.push_str(&format!("Doctrine: {}\n\n", persona.doctrine.join(" -> ")));
    }
    if !persona.tone_rules.is_empty() {
        out.push_str("Tone rules:\n");
        let mut keys: Vec<&String> = persona.tone_rules.keys().collect();
        keys.sort();
        for k in keys {
            out.push_str(&format!("- {k}: {}\n", persona.tone_rules[k]));
        }
        out.push('\n');
    }
    if !persona.templates.is_empty() {
        out.push_str("Templates:\n");
        let mut keys: Vec<&String> = persona.templates.keys().collect();
        keys.sort();
        for k in keys {
            out.push_str(&format!("- {k}: {}\n", persona.templates[k]));
        }
        out.push('\n');
    }
    if !persona.guardrails.is_empty() {
        out.push_str("Guardrails (never violate):\n");
        for g in &persona.guardrails {
            out.push_str(&format!("- {g}\n"));
        }
        out.push('\n');
    }
    if !recent_notes.is_empty() {
        out.push_str("Recent improvement notes:\n");
        for note in recent_notes.iter().take(5) {
            out.push_str(&format!("- {}\n", note.text));
        }
        out.push('\n');
    }

    let mut mix_keys: Vec<&String> = persona.content_mix.keys().collect();
    mix_keys.sort();
    if !mix_keys.is_empty() {
        out.push_str("Content mix:\n");
        for k in mix_keys {
            out.push_str(&format!("- {k}: {:.0}%\n", persona.content_mix[k] * 100.0));
        }
    }

    out
}

/// Line-oriented diff between two personas, used by `preview` and `rollback`
/// audit notes. Not a general-purpose diff — just enough to show which
/// top-level fields moved.
pub fn diff_personas(old: &Persona, new: &Persona) -> Vec<String> {
    let mut lines = Vec::new();
    if old.handle != new.handle {
        lines.push(format!("handle: '{}' -> '{}'", old.handle, new.handle));
    }
    if old.mission != new.mission {
        lines.push(format!("mission: '{}' -> '{}'", old.mission, new.mission));
    }
    if old.beliefs != new.beliefs {
        lines.push(format!("beliefs: {:?} -> {:?}", old.beliefs, new.beliefs));
    }
    if old.doctrine != new.doctrine {
        lines.push(format!("doctrine: {:?} -> {:?}", old.doctrine, new.doctrine));
    }
    if old.content_mix != new.content_mix {
        lines.push(format!("content_mix: {:?} -> {:?}", old.content_mix, new.content_mix));
    }
    if old.guardrails != new.guardrails {
        lines.push(format!("guardrails: {:?} -> {:?}", old.guardrails, new.guardrails));
    }
    if old.intensity_settings != new.intensity_settings {
        lines.push("intensity_settings changed".to_string());
    }
    lines
}

struct FileState {
    mtime: Option<SystemTime>,
    hash: String,
}

/// Owns the single live `Persona` document plus its on-disk mirror. The
/// previous version always keeps serving if a write fails validation (§7
/// "Persona document failed validation").
pub struct PersonaStore {
    path: PathBuf,
    persistence: Arc<dyn Persistence>,
    current: RwLock<Persona>,
    file_state: RwLock<FileState>,
}

impl PersonaStore {
    /// Loads the persona from `path` if present, otherwise seeds version 1
    /// from `seed` and writes it out. Always validates before accepting.
    pub async fn load(path: impl AsRef<Path>, persistence: Arc<dyn Persistence>, seed: Persona) -> VigilResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (persona, mtime) = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| VigilError::Persistence(format!("reading persona file: {e}")))?;
            let persona: Persona = serde_json::from_str(&raw)
                .map_err(|e| VigilError::PersonaInvalid(format!("malformed persona file: {e}")))?;
            let mtime = tokio::fs::metadata(&path).await.ok().and_then(|m| m.modified().ok());
            (persona, mtime)
        } else {
            (seed, None)
        };

        validate_persona(&persona).map_err(VigilError::PersonaInvalid)?;

        let store = Self {
            path,
            persistence,
            current: RwLock::new(persona.clone()),
            file_state: RwLock::new(FileState { mtime, hash: canonical_hash_of(&persona) }),
        };

        if !store.path.exists() {
            store.write_current_to_disk(&persona).await?;
        }
        store
            .persistence
            .append_persona_version(PersonaVersion {
                version: persona.version,
                hash: persona.hash.clone(),
                actor: "bootstrap".to_string(),
                payload: persona,
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| VigilError::Persistence(e.to_string()))?;

        Ok(store)
    }

    pub async fn current(&self) -> Persona {
        self.current.read().await.clone()
    }

    /// Convenience wrapper around the free `build_system_prompt`: fetches the
    /// live persona plus its last <=5 improvement notes and concatenates them
    /// deterministically (§4.1 BuildSystemPrompt).
    pub async fn build_system_prompt(&self) -> VigilResult<String> {
        let persona = self.current().await;
        let notes = self.persistence.recent_improvement_notes(5).await?;
        Ok(build_system_prompt(&persona, &notes))
    }

    /// Validates `candidate` without committing it; returns the diff against
    /// the live persona. Used by the dashboard-style external collaborator
    /// before it calls `update` (§4.1 Preview()).
    pub async fn preview(&self, candidate: &Persona) -> VigilResult<Vec<String>> {
        validate_persona(candidate).map_err(VigilError::PersonaInvalid)?;
        let current = self.current.read().await;
        Ok(diff_personas(&current, candidate))
    }

    /// Validates, assigns the next version number and hash, writes the new
    /// file atomically, and appends the version row. On validation failure
    /// the previous version keeps serving and no row is written.
    pub async fn update(&self, mut candidate: Persona, actor: &str) -> VigilResult<Outcome<Persona>> {
        if let Err(reason) = validate_persona(&candidate) {
            return Ok(Outcome::Rejected { gate: "persona_validation".to_string(), detail: reason });
        }

        let mut current = self.current.write().await;
        candidate.version = current.version + 1;
        candidate.hash = canonical_hash_of(&candidate);

        self.write_current_to_disk(&candidate).await?;
        self.persistence
            .append_persona_version(PersonaVersion {
                version: candidate.version,
                hash: candidate.hash.clone(),
                actor: actor.to_string(),
                payload: candidate.clone(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| VigilError::Persistence(e.to_string()))?;

        *current = candidate.clone();
        let mut state = self.file_state.write().await;
        state.hash = candidate.hash.clone();
        state.mtime = tokio::fs::metadata(&self.path).await.ok().and_then(|m| m.modified().ok());

        Ok(Outcome::Success(candidate))
    }

    /// Reinstates a prior version's payload as a brand new version (history
    /// is append-only; rollback never rewrites it), tagged with `actor`.
    pub async fn rollback(&self, version: u64, actor: &str) -> VigilResult<Outcome<Persona>> {
        let versions = self
            .persistence
            .persona_versions()
            .await
            .map_err(|e| VigilError::Persistence(e.to_string()))?;
        let target = versions.into_iter().find(|v| v.version == version);
        match target {
            Some(v) => self.update(v.payload, &format!("{actor}:rollback_from_v{version}")).await,
            None => Ok(Outcome::Skipped { reason: format!("no such persona version: {version}") }),
        }
    }

    pub async fn versions(&self) -> VigilResult<Vec<PersonaVersion>> {
        self.persistence.persona_versions().await.map_err(|e| VigilError::Persistence(e.to_string()))
    }

    pub async fn diff(&self, a_version: u64, b_version: u64) -> VigilResult<Vec<String>> {
        let versions = self.versions().await?;
        let a = versions.iter().find(|v| v.version == a_version);
        let b = versions.iter().find(|v| v.version == b_version);
        match (a, b) {
            (Some(a), Some(b)) => Ok(diff_personas(&a.payload, &b.payload)),
            _ => Ok(vec!["one or both versions not found".to_string()]),
        }
    }

    /// Checks whether the on-disk file changed since the last load/write
    /// (mtime fast-path, content hash as the authoritative check) and, if so,
    /// validates and adopts it as a new version tagged `"hot-reload"`.
    pub async fn check_hot_reload(&self) -> VigilResult<Outcome<Persona>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(_) => return Ok(Outcome::Skipped { reason: "persona file missing".to_string() }),
        };
        let mtime = meta.modified().ok();
        {
            let state = self.file_state.read().await;
            if mtime == state.mtime {
                return Ok(Outcome::Skipped { reason: "unchanged".to_string() });
            }
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| VigilError::Persistence(format!("reading persona file: {e}")))?;
        let candidate: Persona = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => return Ok(Outcome::Rejected { gate: "persona_parse".to_string(), detail: e.to_string() }),
        };

        let hash = canonical_hash_of(&candidate);
        {
            let state = self.file_state.read().await;
            if hash == state.hash {
                let mut state = self.file_state.write().await;
                state.mtime = mtime;
                return Ok(Outcome::Skipped { reason: "content unchanged".to_string() });
            }
        }

        self.update(candidate, "hot-reload").await
    }

    async fn write_current_to_disk(&self, persona: &Persona) -> VigilResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VigilError::Persistence(format!("creating persona dir: {e}")))?;
        }
        let body = serde_json::to_vec_pretty(persona)
            .map_err(|e| VigilError::Persistence(format!("serializing persona: {e}")))?;

        let tmp_path_clone = tmp_path.clone();
        let body_clone = body.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path_clone)?;
            file.write_all(&body_clone)?;
            file.sync_all()
        })
        .await
        .map_err(|e| VigilError::Persistence(format!("persona write task join: {e}")))?
        .map_err(|e| VigilError::Persistence(format!("writing persona tmp file: {e}")))?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| VigilError::Persistence(format!("renaming persona file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vigil_core::{IntensitySettings, InMemoryPersistence};

    fn sample_persona() -> Persona {
        let mut content_mix = HashMap::new();
        content_mix.insert("proposal".to_string(), 0.6);
        content_mix.insert("reply".to_string(), 0.4);
        Persona {
            version: 1,
            hash: String::new(),
            handle: "vigilbot".to_string(),
            mission: "ship useful things".to_string(),
            beliefs: vec!["clarity beats cleverness".to_string()],
            doctrine: vec![],
            tone_rules: HashMap::new(),
            content_mix,
            templates: HashMap::new(),
            guardrails: vec!["never doxx".to_string()],
            intensity_settings: IntensitySettings::default(),
        }
    }

    #[test]
    fn rejects_handle_over_fifteen_chars() {
        let mut p = sample_persona();
        p.handle = "a".repeat(16);
        assert!(validate_persona(&p).is_err());
    }

    #[test]
    fn rejects_content_mix_that_does_not_sum_to_one() {
        let mut p = sample_persona();
        p.content_mix.insert("proposal".to_string(), 0.1);
        assert!(validate_persona(&p).is_err());
    }

    #[test]
    fn accepts_well_formed_persona() {
        assert!(validate_persona(&sample_persona()).is_ok());
    }

    #[tokio::test]
    async fn update_rejects_invalid_and_keeps_previous_version() {
        let dir = std::env::temp_dir().join(format!("vigil-persona-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("persona.json");
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let store = PersonaStore::load(&path, persistence, sample_persona()).await.unwrap();

        let mut bad = sample_persona();
        bad.beliefs.clear();
        let outcome = store.update(bad, "test").await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(store.current().await.version, 1);

        let mut good = sample_persona();
        good.mission = "ship even more useful things".to_string();
        let outcome = store.update(good, "test").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(store.current().await.version, 2);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn rollback_reinstates_payload_as_new_version() {
        let dir = std::env::temp_dir().join(format!("vigil-persona-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("persona.json");
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let store = PersonaStore::load(&path, persistence, sample_persona()).await.unwrap();

        let mut v2 = sample_persona();
        v2.mission = "a different mission".to_string();
        store.update(v2, "test").await.unwrap();
        assert_eq!(store.current().await.version, 2);

        let outcome = store.rollback(1, "admin").await.unwrap();
        assert!(outcome.is_success());
        let current = store.current().await;
        assert_eq!(current.version, 3);
        assert_eq!(current.mission, "ship useful things");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
