//! Persistence contract (§2, §3 "Persistence (contract)"). Append-only
//! tables for every entity in §3. Only the contract is specified here — the
//! physical schema is an external collaborator (§1); `InMemoryPersistence`
//! exists so the rest of the workspace and its tests do not depend on any
//! particular engine.

use crate::error::VigilResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Append-only persistence surface. All methods that "append" never mutate a
/// prior row in place (Posts' engagement/j_score are the one exception the
/// spec calls out as overwritable). Implementations MUST be safe to call
/// concurrently from independent job runs (§5: "each job must read its own
/// inputs fresh from persistence at start").
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append_post(&self, post: Post) -> VigilResult<()>;
    async fn update_post_engagement(&self, id: Uuid, engagement: Engagement) -> VigilResult<()>;
    async fn update_post_j_score(&self, id: Uuid, j_score: f64) -> VigilResult<()>;
    async fn get_post(&self, id: Uuid) -> VigilResult<Option<Post>>;
    async fn recent_posts(&self, since: DateTime<Utc>) -> VigilResult<Vec<Post>>;

    async fn append_arm_selection(&self, arm: ArmSelection) -> VigilResult<()>;
    async fn record_reward(&self, post_id: Uuid, reward_j: f64) -> VigilResult<()>;
    async fn recent_arm_selections(&self, limit: usize) -> VigilResult<Vec<ArmSelection>>;

    async fn append_sensed_event(&self, event: SensedEvent) -> VigilResult<()>;
    async fn recent_sensed_events(&self, limit: usize) -> VigilResult<Vec<SensedEvent>>;

    async fn append_structured_outcome(&self, outcome: StructuredOutcome) -> VigilResult<()>;
    async fn recent_structured_outcomes(&self, since: DateTime<Utc>) -> VigilResult<Vec<StructuredOutcome>>;

    async fn append_persona_version(&self, version: PersonaVersion) -> VigilResult<()>;
    async fn persona_versions(&self) -> VigilResult<Vec<PersonaVersion>>;

    async fn upsert_redirect(&self, redirect: Redirect) -> VigilResult<()>;
    async fn get_redirect(&self, id: Uuid) -> VigilResult<Option<Redirect>>;
    async fn all_redirects(&self) -> VigilResult<Vec<Redirect>>;

    async fn append_followers_snapshot(&self, snapshot: FollowersSnapshot) -> VigilResult<()>;
    async fn recent_followers_snapshots(&self, limit: usize) -> VigilResult<Vec<FollowersSnapshot>>;

    async fn append_improvement_note(&self, note: ImprovementNote, cap: usize) -> VigilResult<()>;
    async fn recent_improvement_notes(&self, limit: usize) -> VigilResult<Vec<ImprovementNote>>;
}

/// Reference in-memory implementation of the persistence contract. Used by
/// unit/integration tests across the workspace and as the default store for
/// the daemon when no durable backend is configured.
#[derive(Default)]
pub struct InMemoryPersistence {
    posts: DashMap<Uuid, Post>,
    post_order: DashMap<u64, Uuid>,
    post_seq: AtomicU64,

    arm_selections: DashMap<Uuid, ArmSelection>,
    arm_order: DashMap<u64, Uuid>,
    arm_seq: AtomicU64,

    sensed_events: DashMap<u64, SensedEvent>,
    sensed_seq: AtomicU64,

    structured_outcomes: DashMap<u64, StructuredOutcome>,
    outcome_seq: AtomicU64,

    persona_versions: DashMap<u64, PersonaVersion>,

    redirects: DashMap<Uuid, Redirect>,

    followers: DashMap<u64, FollowersSnapshot>,
    followers_seq: AtomicU64,

    improvement_notes: DashMap<u64, ImprovementNote>,
    notes_seq: AtomicU64,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn append_post(&self, post: Post) -> VigilResult<()> {
        let seq = self.post_seq.fetch_add(1, Ordering::SeqCst);
        self.post_order.insert(seq, post.id);
        self.posts.insert(post.id, post);
        Ok(())
    }

    async fn update_post_engagement(&self, id: Uuid, engagement: Engagement) -> VigilResult<()> {
        if let Some(mut post) = self.posts.get_mut(&id) {
            post.engagement = engagement;
        }
        Ok(())
    }

    async fn update_post_j_score(&self, id: Uuid, j_score: f64) -> VigilResult<()> {
        if let Some(mut post) = self.posts.get_mut(&id) {
            post.j_score = Some(j_score);
        }
        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> VigilResult<Option<Post>> {
        Ok(self.posts.get(&id).map(|p| p.clone()))
    }

    async fn recent_posts(&self, since: DateTime<Utc>) -> VigilResult<Vec<Post>> {
        let mut out: Vec<Post> = self
            .posts
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| p.created_at >= since)
            .collect();
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }

    async fn append_arm_selection(&self, arm: ArmSelection) -> VigilResult<()> {
        let seq = self.arm_seq.fetch_add(1, Ordering::SeqCst);
        self.arm_order.insert(seq, arm.id);
        self.arm_selections.insert(arm.id, arm);
        Ok(())
    }

    async fn record_reward(&self, post_id: Uuid, reward_j: f64) -> VigilResult<()> {
        for mut entry in self.arm_selections.iter_mut() {
            if entry.post_id == Some(post_id) && entry.reward_j.is_none() {
                entry.reward_j = Some(reward_j);
                break;
            }
        }
        Ok(())
    }

    async fn recent_arm_selections(&self, limit: usize) -> VigilResult<Vec<ArmSelection>> {
        let mut keys: Vec<u64> = self.arm_order.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        let mut out: Vec<ArmSelection> = keys
            .into_iter()
            .rev()
            .take(limit)
            .filter_map(|k| self.arm_order.get(&k).and_then(|id| self.arm_selections.get(&id).map(|a| a.clone())))
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn append_sensed_event(&self, event: SensedEvent) -> VigilResult<()> {
        let seq = self.sensed_seq.fetch_add(1, Ordering::SeqCst);
        self.sensed_events.insert(seq, event);
        Ok(())
    }

    async fn recent_sensed_events(&self, limit: usize) -> VigilResult<Vec<SensedEvent>> {
        let mut keys: Vec<u64> = self.sensed_events.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        let out: Vec<SensedEvent> = keys
            .into_iter()
            .rev()
            .take(limit)
            .filter_map(|k| self.sensed_events.get(&k).map(|e| e.clone()))
            .collect();
        Ok(out)
    }

    async fn append_structured_outcome(&self, outcome: StructuredOutcome) -> VigilResult<()> {
        let seq = self.outcome_seq.fetch_add(1, Ordering::SeqCst);
        self.structured_outcomes.insert(seq, outcome);
        Ok(())
    }

    async fn recent_structured_outcomes(&self, since: DateTime<Utc>) -> VigilResult<Vec<StructuredOutcome>> {
        // Structured outcomes carry no timestamp of their own (§3); callers
        // filter by the referenced post's created_at when needed. Here we
        // simply return everything recorded — the window is applied by Analytics
        // against the owning Post.
        let _ = since;
        Ok(self.structured_outcomes.iter().map(|e| e.value().clone()).collect())
    }

    async fn append_persona_version(&self, version: PersonaVersion) -> VigilResult<()> {
        self.persona_versions.insert(version.version, version);
        Ok(())
    }

    async fn persona_versions(&self) -> VigilResult<Vec<PersonaVersion>> {
        let mut out: Vec<PersonaVersion> = self.persona_versions.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|v| v.version);
        Ok(out)
    }

    async fn upsert_redirect(&self, redirect: Redirect) -> VigilResult<()> {
        self.redirects.insert(redirect.id, redirect);
        Ok(())
    }

    async fn get_redirect(&self, id: Uuid) -> VigilResult<Option<Redirect>> {
        Ok(self.redirects.get(&id).map(|r| r.clone()))
    }

    async fn all_redirects(&self) -> VigilResult<Vec<Redirect>> {
        Ok(self.redirects.iter().map(|e| e.value().clone()).collect())
    }

    async fn append_followers_snapshot(&self, snapshot: FollowersSnapshot) -> VigilResult<()> {
        let seq = self.followers_seq.fetch_add(1, Ordering::SeqCst);
        self.followers.insert(seq, snapshot);
        Ok(())
    }

    async fn recent_followers_snapshots(&self, limit: usize) -> VigilResult<Vec<FollowersSnapshot>> {
        let mut keys: Vec<u64> = self.followers.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        let out: Vec<FollowersSnapshot> = keys
            .into_iter()
            .rev()
            .take(limit)
            .filter_map(|k| self.followers.get(&k).map(|s| *s))
            .collect();
        Ok(out)
    }

    async fn append_improvement_note(&self, note: ImprovementNote, cap: usize) -> VigilResult<()> {
        let seq = self.notes_seq.fetch_add(1, Ordering::SeqCst);
        self.improvement_notes.insert(seq, note);
        // Capped ring (§3 ImprovementNote): drop oldest first once over cap.
        let mut keys: Vec<u64> = self.improvement_notes.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        while keys.len() > cap {
            let oldest = keys.remove(0);
            self.improvement_notes.remove(&oldest);
        }
        Ok(())
    }

    async fn recent_improvement_notes(&self, limit: usize) -> VigilResult<Vec<ImprovementNote>> {
        let mut keys: Vec<u64> = self.improvement_notes.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        let out: Vec<ImprovementNote> = keys
            .into_iter()
            .rev()
            .take(limit)
            .filter_map(|k| self.improvement_notes.get(&k).map(|n| n.clone()))
            .collect();
        Ok(out.into_iter().rev().collect())
    }
}

/// `sled`-backed implementation of the persistence contract, used by the
/// daemon when a durable store is configured. One `sled::Tree` per table,
/// mirroring the knowledge store's one-tree-per-slot layout; sequence
/// numbers are `u64` big-endian keys so tree iteration returns rows in
/// insertion order. Calls are synchronous `sled` operations run directly on
/// the async task, not dispatched through `spawn_blocking` — `sled`'s own
/// I/O is non-blocking-safe for the latencies this workload needs.
pub struct SledPersistence {
    db: sled::Db,
    posts: sled::Tree,
    post_log: sled::Tree,
    arm_selections: sled::Tree,
    arm_log: sled::Tree,
    sensed_events: sled::Tree,
    structured_outcomes: sled::Tree,
    persona_versions: sled::Tree,
    redirects: sled::Tree,
    followers: sled::Tree,
    improvement_notes: sled::Tree,
}

const TREE_POSTS: &str = "posts";
const TREE_POST_LOG: &str = "post_log";
const TREE_ARM_SELECTIONS: &str = "arm_selections";
const TREE_ARM_LOG: &str = "arm_log";
const TREE_SENSED_EVENTS: &str = "sensed_events";
const TREE_STRUCTURED_OUTCOMES: &str = "structured_outcomes";
const TREE_PERSONA_VERSIONS: &str = "persona_versions";
const TREE_REDIRECTS: &str = "redirects";
const TREE_FOLLOWERS: &str = "followers";
const TREE_IMPROVEMENT_NOTES: &str = "improvement_notes";

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn to_bytes<T: serde::Serialize>(value: &T) -> VigilResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| crate::error::VigilError::Persistence(e.to_string()))
}

fn from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> VigilResult<T> {
    serde_json::from_slice(bytes).map_err(|e| crate::error::VigilError::Persistence(e.to_string()))
}

fn sled_err(e: sled::Error) -> crate::error::VigilError {
    crate::error::VigilError::Persistence(e.to_string())
}

impl SledPersistence {
    /// Opens (creating if absent) a `sled` database rooted at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> VigilResult<Self> {
        let db = sled::open(path).map_err(sled_err)?;
        Ok(Self {
            posts: db.open_tree(TREE_POSTS).map_err(sled_err)?,
            post_log: db.open_tree(TREE_POST_LOG).map_err(sled_err)?,
            arm_selections: db.open_tree(TREE_ARM_SELECTIONS).map_err(sled_err)?,
            arm_log: db.open_tree(TREE_ARM_LOG).map_err(sled_err)?,
            sensed_events: db.open_tree(TREE_SENSED_EVENTS).map_err(sled_err)?,
            structured_outcomes: db.open_tree(TREE_STRUCTURED_OUTCOMES).map_err(sled_err)?,
            persona_versions: db.open_tree(TREE_PERSONA_VERSIONS).map_err(sled_err)?,
            redirects: db.open_tree(TREE_REDIRECTS).map_err(sled_err)?,
            followers: db.open_tree(TREE_FOLLOWERS).map_err(sled_err)?,
            improvement_notes: db.open_tree(TREE_IMPROVEMENT_NOTES).map_err(sled_err)?,
            db,
        })
    }

    /// Flushes all trees to disk. The daemon calls this on a timer and
    /// before shutdown; individual writes are not fsynced eagerly.
    pub async fn flush(&self) -> VigilResult<()> {
        self.db.flush_async().await.map_err(sled_err)?;
        Ok(())
    }

    fn next_seq(&self, tree: &sled::Tree) -> VigilResult<u64> {
        let counter = tree.generate_id().map_err(sled_err)?;
        Ok(counter)
    }

    fn recent<T: serde::de::DeserializeOwned>(tree: &sled::Tree, limit: usize) -> VigilResult<Vec<T>> {
        let mut out = Vec::with_capacity(limit);
        for row in tree.iter().rev().take(limit) {
            let (_, value) = row.map_err(sled_err)?;
            out.push(from_bytes(&value)?);
        }
        out.reverse();
        Ok(out)
    }
}

#[async_trait]
impl Persistence for SledPersistence {
    async fn append_post(&self, post: Post) -> VigilResult<()> {
        let seq = self.next_seq(&self.post_log)?;
        let bytes = to_bytes(&post)?;
        self.posts.insert(post.id.as_bytes(), bytes.clone()).map_err(sled_err)?;
        self.post_log.insert(seq_key(seq), post.id.as_bytes().to_vec()).map_err(sled_err)?;
        Ok(())
    }

    async fn update_post_engagement(&self, id: Uuid, engagement: Engagement) -> VigilResult<()> {
        if let Some(bytes) = self.posts.get(id.as_bytes()).map_err(sled_err)? {
            let mut post: Post = from_bytes(&bytes)?;
            post.engagement = engagement;
            self.posts.insert(id.as_bytes(), to_bytes(&post)?).map_err(sled_err)?;
        }
        Ok(())
    }

    async fn update_post_j_score(&self, id: Uuid, j_score: f64) -> VigilResult<()> {
        if let Some(bytes) = self.posts.get(id.as_bytes()).map_err(sled_err)? {
            let mut post: Post = from_bytes(&bytes)?;
            post.j_score = Some(j_score);
            self.posts.insert(id.as_bytes(), to_bytes(&post)?).map_err(sled_err)?;
        }
        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> VigilResult<Option<Post>> {
        match self.posts.get(id.as_bytes()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn recent_posts(&self, since: DateTime<Utc>) -> VigilResult<Vec<Post>> {
        let mut out = Vec::new();
        for row in self.post_log.iter() {
            let (_, id_bytes) = row.map_err(sled_err)?;
            if let Some(post_bytes) = self.posts.get(&id_bytes).map_err(sled_err)? {
                let post: Post = from_bytes(&post_bytes)?;
                if post.created_at >= since {
                    out.push(post);
                }
            }
        }
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }

    async fn append_arm_selection(&self, arm: ArmSelection) -> VigilResult<()> {
        let seq = self.next_seq(&self.arm_log)?;
        self.arm_selections.insert(arm.id.as_bytes(), to_bytes(&arm)?).map_err(sled_err)?;
        self.arm_log.insert(seq_key(seq), arm.id.as_bytes().to_vec()).map_err(sled_err)?;
        Ok(())
    }

    async fn record_reward(&self, post_id: Uuid, reward_j: f64) -> VigilResult<()> {
        for row in self.arm_selections.iter() {
            let (key, bytes) = row.map_err(sled_err)?;
            let mut arm: ArmSelection = from_bytes(&bytes)?;
            if arm.post_id == Some(post_id) && arm.reward_j.is_none() {
                arm.reward_j = Some(reward_j);
                self.arm_selections.insert(key, to_bytes(&arm)?).map_err(sled_err)?;
                break;
            }
        }
        Ok(())
    }

    async fn recent_arm_selections(&self, limit: usize) -> VigilResult<Vec<ArmSelection>> {
        let mut out = Vec::new();
        for row in self.arm_log.iter().rev().take(limit) {
            let (_, id_bytes) = row.map_err(sled_err)?;
            if let Some(bytes) = self.arm_selections.get(&id_bytes).map_err(sled_err)? {
                out.push(from_bytes(&bytes)?);
            }
        }
        out.reverse();
        Ok(out)
    }

    async fn append_sensed_event(&self, event: SensedEvent) -> VigilResult<()> {
        let seq = self.next_seq(&self.sensed_events)?;
        self.sensed_events.insert(seq_key(seq), to_bytes(&event)?).map_err(sled_err)?;
        Ok(())
    }

    async fn recent_sensed_events(&self, limit: usize) -> VigilResult<Vec<SensedEvent>> {
        Self::recent(&self.sensed_events, limit)
    }

    async fn append_structured_outcome(&self, outcome: StructuredOutcome) -> VigilResult<()> {
        let seq = self.next_seq(&self.structured_outcomes)?;
        self.structured_outcomes.insert(seq_key(seq), to_bytes(&outcome)?).map_err(sled_err)?;
        Ok(())
    }

    async fn recent_structured_outcomes(&self, since: DateTime<Utc>) -> VigilResult<Vec<StructuredOutcome>> {
        let _ = since;
        let mut out = Vec::new();
        for row in self.structured_outcomes.iter() {
            let (_, bytes) = row.map_err(sled_err)?;
            out.push(from_bytes(&bytes)?);
        }
        Ok(out)
    }

    async fn append_persona_version(&self, version: PersonaVersion) -> VigilResult<()> {
        self.persona_versions.insert(seq_key(version.version), to_bytes(&version)?).map_err(sled_err)?;
        Ok(())
    }

    async fn persona_versions(&self) -> VigilResult<Vec<PersonaVersion>> {
        let mut out = Vec::new();
        for row in self.persona_versions.iter() {
            let (_, bytes) = row.map_err(sled_err)?;
            out.push(from_bytes(&bytes)?);
        }
        out.sort_by_key(|v: &PersonaVersion| v.version);
        Ok(out)
    }

    async fn upsert_redirect(&self, redirect: Redirect) -> VigilResult<()> {
        self.redirects.insert(redirect.id.as_bytes(), to_bytes(&redirect)?).map_err(sled_err)?;
        Ok(())
    }

    async fn get_redirect(&self, id: Uuid) -> VigilResult<Option<Redirect>> {
        match self.redirects.get(id.as_bytes()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn all_redirects(&self) -> VigilResult<Vec<Redirect>> {
        let mut out = Vec::new();
        for row in self.redirects.iter() {
            let (_, bytes) = row.map_err(sled_err)?;
            out.push(from_bytes(&bytes)?);
        }
        Ok(out)
    }

    async fn append_followers_snapshot(&self, snapshot: FollowersSnapshot) -> VigilResult<()> {
        let seq = self.next_seq(&self.followers)?;
        self.followers.insert(seq_key(seq), to_bytes(&snapshot)?).map_err(sled_err)?;
        Ok(())
    }

    async fn recent_followers_snapshots(&self, limit: usize) -> VigilResult<Vec<FollowersSnapshot>> {
        Self::recent(&self.followers, limit)
    }

    async fn append_improvement_note(&self, note: ImprovementNote, cap: usize) -> VigilResult<()> {
        let seq = self.next_seq(&self.improvement_notes)?;
        self.improvement_notes.insert(seq_key(seq), to_bytes(&note)?).map_err(sled_err)?;
        while self.improvement_notes.len() > cap {
            if let Some((key, _)) = self.improvement_notes.iter().next().transpose().map_err(sled_err)? {
                self.improvement_notes.remove(&key).map_err(sled_err)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn recent_improvement_notes(&self, limit: usize) -> VigilResult<Vec<ImprovementNote>> {
        Self::recent(&self.improvement_notes, limit)
    }
}

#[cfg(test)]
mod sled_tests {
    use super::*;

    fn open_temp() -> SledPersistence {
        let dir = std::env::temp_dir().join(format!("vigil-sled-test-{}", Uuid::new_v4()));
        SledPersistence::open(dir).unwrap()
    }

    #[tokio::test]
    async fn post_round_trips_through_sled() {
        let store = open_temp();
        let post = Post {
            id: Uuid::new_v4(),
            platform: "x".to_string(),
            kind: PostKind::Proposal,
            text: "hello".to_string(),
            topic: "ai".to_string(),
            hour_bin: 9,
            cta_variant: "default".to_string(),
            intensity: 1,
            ref_id: None,
            created_at: Utc::now(),
            engagement: Engagement::default(),
            authority_score: 0.0,
            j_score: None,
        };
        store.append_post(post.clone()).await.unwrap();
        let fetched = store.get_post(post.id).await.unwrap().unwrap();
        assert_eq!(fetched.text, "hello");

        store.update_post_j_score(post.id, 0.42).await.unwrap();
        let fetched = store.get_post(post.id).await.unwrap().unwrap();
        assert_eq!(fetched.j_score, Some(0.42));
    }

    #[tokio::test]
    async fn improvement_notes_ring_drops_oldest_first_in_sled() {
        let store = open_temp();
        for i in 0..5 {
            store
                .append_improvement_note(
                    ImprovementNote { id: Uuid::new_v4(), text: format!("note-{i}"), created_at: Utc::now() },
                    3,
                )
                .await
                .unwrap();
        }
        let notes = store.recent_improvement_notes(10).await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[2].text, "note-4");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn improvement_notes_ring_drops_oldest_first() {
        let store = InMemoryPersistence::new();
        for i in 0..5 {
            store
                .append_improvement_note(
                    ImprovementNote { id: Uuid::new_v4(), text: format!("note-{i}"), created_at: Utc::now() },
                    3,
                )
                .await
                .unwrap();
        }
        let notes = store.recent_improvement_notes(10).await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].text, "note-2");
        assert_eq!(notes[2].text, "note-4");
    }

    #[tokio::test]
    async fn redirect_round_trips() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();
        store
            .upsert_redirect(Redirect { id, label: "l".into(), target_url: "https://x.test".into(), utm: None, clicks: 0, revenue: 0.0 })
            .await
            .unwrap();
        let fetched = store.get_redirect(id).await.unwrap().unwrap();
        assert_eq!(fetched.label, "l");
    }
}
