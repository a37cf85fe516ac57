//! One tick function per §4.2 job name, dispatched by name from `main`'s
//! per-job `Scheduler::run_job` task. Each content-producing job follows the
//! same shape: eligibility check, `Selector::select` for the arm pick,
//! `Generator::make_*`, then `publish_and_record`.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use tracing::{info, warn};
use uuid::Uuid;
use vigil_analytics::{self as analytics, ExtractionContext};
use vigil_bandit::ArmPick;
use vigil_core::{
    canonical_hash_of, ActionType, ArmSelection, CrisisMetrics, Engagement, FollowersSnapshot, ImprovementNote, Outcome,
    Persistence, Post, PostKind, VigilResult,
};
use vigil_generator::GeneratedContent;
use vigil_publisher::WriteRequest;
use vigil_selector::{eligible_actions, intensity_policy, min_interval_from_config, select_dm_targets, SignalSnapshot};

use crate::AppState;

/// Dispatches one tick of `name` (one of `vigil_core::JOB_NAMES`) against `state`.
pub async fn run(name: &str, state: AppState) -> VigilResult<()> {
    match name {
        "post_proposal" => tick_post_proposal(state).await,
        "reply_mentions" => tick_reply_mentions(state).await,
        "search_engage" => tick_search_engage(state).await,
        "post_thread" => tick_post_thread(state).await,
        "value_dm" => tick_value_dm(state).await,
        "perception_ingest" => tick_perception_ingest(state).await,
        "crisis_watch" => tick_crisis_watch(state).await,
        "analytics_pull" => tick_analytics_pull(state).await,
        "kpi_rollup" => tick_kpi_rollup(state).await,
        "follower_snapshot" => tick_follower_snapshot(state).await,
        "nightly_reflection" => tick_nightly_reflection(state).await,
        "weekly_plan" => tick_weekly_plan(state).await,
        other => {
            warn!(job = other, "unknown job name, skipping");
            Ok(())
        }
    }
}

/// Builds the §4.3 "signal snapshot" (recent avg J, penalty, authority,
/// crisis signal) the intensity policy adjusts from, reading the last 24h of
/// posts and the live crisis signal rather than any job-local state.
async fn current_signal_snapshot(state: &AppState) -> VigilResult<SignalSnapshot> {
    let posts = state.persistence.recent_posts(Utc::now() - ChronoDuration::hours(24)).await?;
    let scored: Vec<f64> = posts.iter().filter_map(|p| p.j_score).collect();
    let recent_avg_j = if scored.is_empty() { 0.5 } else { scored.iter().sum::<f64>() / scored.len() as f64 };
    let authority = analytics::authority_signals(&posts);
    let crisis_signal = state.crisis.state().await.last_signal;
    Ok(SignalSnapshot { recent_avg_j, penalty: 0.0, authority, crisis_signal })
}

/// Short-circuits a content-producing job to a no-op unless `action` is both
/// crisis-unblocked and eligible this tick; returns the arm pick otherwise,
/// with its intensity re-clamped through the §4.3 intensity policy.
async fn decide(state: &AppState, action: ActionType) -> VigilResult<Option<ArmPick>> {
    if !state.crisis.guard(action).await {
        return Ok(None);
    }
    let persona = state.persona.current().await;
    let now = Utc::now();
    let crisis_active = state.crisis.is_paused().await;
    let last_action = state.last_action.read().await.clone();
    let eligible = match eligible_actions(&state.config.quiet_hours, now.hour() as u8, crisis_active, now, &last_action, |a| {
        min_interval_from_config(&state.config, a)
    }) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };
    if !eligible.contains(&action) {
        return Ok(None);
    }
    let decision = state.selector.select(&persona, &[action]).await;
    if decision.action != action {
        return Ok(None);
    }
    let Some(mut arm) = decision.arm else { return Ok(None) };

    let previous_successful = state.last_successful_intensity.read().await.get(&action).copied();
    let signals = current_signal_snapshot(state).await?;
    arm.intensity = intensity_policy(previous_successful, &persona.intensity_settings, signals, crisis_active, state.config.crisis_signal_threshold);
    Ok(Some(arm))
}

async fn recent_texts(state: &AppState) -> VigilResult<Vec<String>> {
    let posts = state.persistence.recent_posts(Utc::now() - ChronoDuration::hours(24)).await?;
    Ok(posts.into_iter().map(|p| p.text).collect())
}

/// Publishes `content` across the multiplexer, persisting one `Post` row per
/// successful platform receipt, one `ArmSelection` row (reward applied later
/// by `kpi_rollup`), and any structured outcomes the text itself implies.
async fn publish_and_record(
    state: &AppState,
    action: ActionType,
    kind: PostKind,
    content: GeneratedContent,
    arm: Option<ArmPick>,
    in_reply_to: Option<String>,
    quote_to: Option<String>,
) -> VigilResult<()> {
    let hour_bin = arm.as_ref().map(|a| a.hour_bin).unwrap_or_else(|| Utc::now().hour() as u8);
    let cta_variant = arm.as_ref().map(|a| a.cta_variant.clone()).unwrap_or_else(|| "none".to_string());
    let sampled_prob = arm.as_ref().map(|a| a.sampled_prob).unwrap_or(1.0);

    let req = WriteRequest {
        content: content.content.clone(),
        kind: kind.as_str().to_string(),
        in_reply_to,
        quote_to,
        media_ids: Vec::new(),
        idempotency_key: content.hash.clone(),
        intensity: content.intensity,
    };
    let receipts = state.multiplexer.publish(req).await;

    let mut first_post_id = None;
    for (platform, result) in receipts {
        match result {
            Ok(Outcome::Success(receipt)) => {
                let post = Post {
                    id: Uuid::new_v4(),
                    platform,
                    kind,
                    text: content.content.clone(),
                    topic: content.topic.clone(),
                    hour_bin,
                    cta_variant: cta_variant.clone(),
                    intensity: content.intensity,
                    ref_id: None,
                    created_at: Utc::now(),
                    engagement: Engagement::default(),
                    authority_score: 0.0,
                    j_score: None,
                };
                let post_id = post.id;
                state.persistence.append_post(post).await?;
                if first_post_id.is_none() {
                    first_post_id = Some(post_id);
                }
                if !receipt.dry_run {
                    state.last_successful_intensity.write().await.insert(action, content.intensity);
                    let ctx = ExtractionContext { topic: Some(&content.topic), partner: None, channel: Some(&receipt.platform) };
                    for outcome in analytics::extract_structured_outcomes(&content.content, post_id, &ctx) {
                        state.persistence.append_structured_outcome(outcome).await?;
                    }
                }
            }
            Ok(Outcome::Rejected { gate, detail }) => warn!(gate, detail, "publish_rejected"),
            Ok(Outcome::Skipped { reason }) => info!(reason, "publish_skipped"),
            Ok(Outcome::Deferred { .. }) => info!("publish_deferred"),
            Err(e) => warn!(error = %e, "publish_failed"),
        }
    }

    state.last_action.write().await.insert(action, Utc::now());

    if let Some(arm) = arm {
        state
            .persistence
            .append_arm_selection(ArmSelection {
                id: Uuid::new_v4(),
                post_id: first_post_id,
                post_type: action,
                topic: content.topic,
                hour_bin,
                cta_variant,
                intensity: content.intensity,
                sampled_prob,
                reward_j: None,
                created_at: Utc::now(),
            })
            .await?;
    }

    Ok(())
}

async fn tick_post_proposal(state: AppState) -> VigilResult<()> {
    let Some(arm) = decide(&state, ActionType::PostProposal).await? else { return Ok(()) };
    let recent = recent_texts(&state).await?;
    match state.generator.make_proposal(&arm.topic, arm.intensity, &recent).await? {
        Outcome::Success(content) => publish_and_record(&state, ActionType::PostProposal, PostKind::Proposal, content, Some(arm), None, None).await,
        Outcome::Rejected { gate, detail } => {
            warn!(gate, detail, "post_proposal_rejected");
            Ok(())
        }
        Outcome::Skipped { reason } => {
            info!(reason, "post_proposal_skipped");
            Ok(())
        }
        Outcome::Deferred { .. } => Ok(()),
    }
}

/// Uses the latest perception `SensedEvent`'s `x.mentions` payload as the
/// reply queue (perception owns the only live mentions cursor; the daemon
/// never calls `get_mentions` directly).
async fn latest_mentions(state: &AppState) -> VigilResult<Vec<serde_json::Value>> {
    let events = state.persistence.recent_sensed_events(1).await?;
    Ok(events
        .first()
        .and_then(|e| e.payload.get("x"))
        .and_then(|x| x.get("mentions"))
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default())
}

async fn tick_reply_mentions(state: AppState) -> VigilResult<()> {
    let Some(arm) = decide(&state, ActionType::ReplyMentions).await? else { return Ok(()) };
    let mentions = latest_mentions(&state).await?;
    if mentions.is_empty() {
        return Ok(());
    }
    let recent = recent_texts(&state).await?;

    for mention in mentions.iter().take(3) {
        let Some(text) = mention.get("text").and_then(|v| v.as_str()) else { continue };
        let author = mention.get("username").and_then(|v| v.as_str()).unwrap_or("unknown");
        let mention_id = mention
            .get("id")
            .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_u64().map(|n| n.to_string())));
        match state.generator.make_reply(text, author, arm.intensity, &recent).await? {
            Outcome::Success(content) => {
                publish_and_record(&state, ActionType::ReplyMentions, PostKind::Reply, content, Some(arm.clone()), mention_id, None).await?
            }
            Outcome::Rejected { gate, detail } => warn!(gate, detail, "reply_rejected"),
            Outcome::Skipped { reason } => info!(reason, "reply_skipped"),
            Outcome::Deferred { .. } => {}
        }
    }
    Ok(())
}

/// Quote-engages the top trending topic from the latest perception sweep.
async fn tick_search_engage(state: AppState) -> VigilResult<()> {
    let Some(arm) = decide(&state, ActionType::SearchEngage).await? else { return Ok(()) };
    let events = state.persistence.recent_sensed_events(1).await?;
    let trends = events
        .first()
        .and_then(|e| e.payload.get("x"))
        .and_then(|x| x.get("trending_topics"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();

    let Some(trend_text) = trends.first().and_then(|t| t.get("text").and_then(|v| v.as_str()).or_else(|| t.as_str())) else {
        info!("search_engage_no_trends");
        return Ok(());
    };

    let recent = recent_texts(&state).await?;
    match state.generator.make_quote(trend_text, arm.intensity, &recent).await? {
        Outcome::Success(content) => publish_and_record(&state, ActionType::SearchEngage, PostKind::Quote, content, Some(arm), None, None).await,
        Outcome::Rejected { gate, detail } => {
            warn!(gate, detail, "search_engage_rejected");
            Ok(())
        }
        Outcome::Skipped { reason } => {
            info!(reason, "search_engage_skipped");
            Ok(())
        }
        Outcome::Deferred { .. } => Ok(()),
    }
}

async fn tick_post_thread(state: AppState) -> VigilResult<()> {
    let Some(arm) = decide(&state, ActionType::PostThread).await? else { return Ok(()) };
    let recent = recent_texts(&state).await?;
    match state.generator.make_thread(&arm.topic, arm.intensity, 3, &recent).await? {
        Outcome::Success(thread) => {
            publish_and_record(&state, ActionType::PostThread, PostKind::ThreadRoot, thread.root, Some(arm.clone()), None, None).await?;
            for segment in thread.segments {
                publish_and_record(&state, ActionType::PostThread, PostKind::ThreadSegment, segment, Some(arm.clone()), None, None).await?;
            }
            Ok(())
        }
        Outcome::Rejected { gate, detail } => {
            warn!(gate, detail, "post_thread_rejected");
            Ok(())
        }
        Outcome::Skipped { reason } => {
            info!(reason, "post_thread_skipped");
            Ok(())
        }
        Outcome::Deferred { .. } => Ok(()),
    }
}

async fn tick_value_dm(state: AppState) -> VigilResult<()> {
    let Some(arm) = decide(&state, ActionType::SendValueDm).await? else { return Ok(()) };
    let candidates = state.perception.priority_accounts(0.75, 25).await;
    let recently_dmed = state.recently_dmed.read().await.clone();
    let targets = select_dm_targets(&candidates, &recently_dmed, Utc::now(), 3);
    if targets.is_empty() {
        return Ok(());
    }

    let recent = recent_texts(&state).await?;
    let thread = state.generator.make_thread(&arm.topic, arm.intensity, 1, &recent).await?;
    let Outcome::Success(thread) = thread else {
        info!("value_dm_generation_not_successful");
        return Ok(());
    };

    for target in targets {
        let req = WriteRequest {
            content: thread.dm_copy.clone(),
            kind: "dm".to_string(),
            in_reply_to: None,
            quote_to: None,
            media_ids: Vec::new(),
            idempotency_key: format!("{}:{}", canonical_hash_of(&thread.dm_copy), target.id),
            intensity: arm.intensity,
        };
        let receipts = state.multiplexer.publish(req).await;
        let delivered = receipts.values().any(|r| matches!(r, Ok(Outcome::Success(receipt)) if !receipt.dry_run));
        if delivered {
            state.recently_dmed.write().await.insert(target.id.clone(), Utc::now());
        }
    }
    state.last_action.write().await.insert(ActionType::SendValueDm, Utc::now());
    Ok(())
}

async fn tick_perception_ingest(state: AppState) -> VigilResult<()> {
    let (_event, signal) = state.perception.ingest(state.persistence.as_ref()).await?;
    state
        .crisis
        .observe(CrisisMetrics { sentiment: signal.sentiment, velocity: signal.velocity, authority: signal.authority })
        .await;
    Ok(())
}

/// While the crisis guard is active, generates and publishes a short calming
/// statement; a non-dry-run receipt is recorded as the validated calming
/// receipt §4.5/P8 requires before `observe` is allowed to resume normal
/// posting.
async fn tick_crisis_watch(state: AppState) -> VigilResult<()> {
    if !state.crisis.is_paused().await {
        return Ok(());
    }
    let persona = state.persona.current().await;
    let recent = recent_texts(&state).await?;
    let outcome = state
        .generator
        .make_proposal("crisis_response", persona.intensity_settings.min_intensity, &recent)
        .await?;
    let Outcome::Success(content) = outcome else {
        info!("crisis_watch_calming_statement_not_ready");
        return Ok(());
    };

    let target_platform = state.config.crisis_calming_platform.clone();
    let req = WriteRequest {
        content: content.content,
        kind: "proposal".to_string(),
        in_reply_to: None,
        quote_to: None,
        media_ids: Vec::new(),
        idempotency_key: content.hash,
        intensity: content.intensity,
    };
    let receipts = state.multiplexer.publish(req).await;
    let validated = receipts.iter().any(|(platform, result)| {
        target_platform.as_deref().map(|tp| tp == platform).unwrap_or(true)
            && matches!(result, Ok(Outcome::Success(receipt)) if !receipt.dry_run)
    });
    if validated {
        state.crisis.record_calming_receipt().await;
        info!("crisis_calming_receipt_recorded");
    }
    Ok(())
}

/// Refreshes engagement for unscored posts and derives each one's per-post
/// J-score (P12). Mission alignment is a coarse per-kind heuristic: the
/// ethics/completeness gates already enforce a stricter bar on proposals
/// than on replies, so proposals start from a higher alignment floor.
async fn tick_analytics_pull(state: AppState) -> VigilResult<()> {
    let posts = state.persistence.recent_posts(Utc::now() - ChronoDuration::hours(24)).await?;
    let pending: Vec<_> = posts.into_iter().filter(|p| p.j_score.is_none()).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = pending.iter().map(|p| p.id.to_string()).collect();
    let metrics = state.metrics_client.metrics_for(&ids).await.unwrap_or_default();
    let goal_weights = state.config.goal_weights_for(state.config.goal_mode);

    for post in pending {
        let engagement = metrics
            .get(&post.id.to_string())
            .map(|v| Engagement {
                likes: v.get("likes").and_then(|x| x.as_u64()).unwrap_or(0),
                reposts: v.get("reposts").and_then(|x| x.as_u64()).unwrap_or(0),
                replies: v.get("replies").and_then(|x| x.as_u64()).unwrap_or(0),
                quotes: v.get("quotes").and_then(|x| x.as_u64()).unwrap_or(0),
            })
            .unwrap_or_default();
        state.persistence.update_post_engagement(post.id, engagement.clone()).await?;

        let mission_alignment = if post.kind == PostKind::Proposal { 0.8 } else { 0.6 };
        let j_score = analytics::per_post_j_score(engagement.engagement_proxy(), mission_alignment, &goal_weights, 0.0);
        state.persistence.update_post_j_score(post.id, j_score).await?;

        let ctx = ExtractionContext { topic: Some(&post.topic), partner: None, channel: Some(&post.platform) };
        for outcome in analytics::extract_structured_outcomes(&post.text, post.id, &ctx) {
            state.persistence.append_structured_outcome(outcome).await?;
        }
    }
    Ok(())
}

/// Feeds every freshly-scored `ArmSelection` back into the bandit/optimizer
/// (§4.7 reward conversion via `RewardNormalizer`), then logs the current
/// global J-score across the last 7 days.
async fn tick_kpi_rollup(state: AppState) -> VigilResult<()> {
    let pending = state.persistence.recent_arm_selections(200).await?;
    for selection in pending.into_iter().filter(|s| s.reward_j.is_none()) {
        let Some(post_id) = selection.post_id else { continue };
        let Some(post) = state.persistence.get_post(post_id).await? else { continue };
        let Some(raw_j) = post.j_score else { continue };

        let reward = state.reward_normalizer.normalize(raw_j).await;
        state.persistence.record_reward(post_id, reward).await?;
        state.selector.record_action_outcome(selection.post_type, reward).await;
        let pick = ArmPick {
            topic: selection.topic,
            hour_bin: selection.hour_bin,
            cta_variant: selection.cta_variant,
            intensity: selection.intensity,
            sampled_prob: selection.sampled_prob,
        };
        state.selector.record_arm_outcome(&pick, reward).await;
    }

    log_global_j_score(&state, ChronoDuration::days(7)).await
}

async fn log_global_j_score(state: &AppState, window: ChronoDuration) -> VigilResult<()> {
    let since = Utc::now() - window;
    let posts = state.persistence.recent_posts(since).await?;
    let redirects = state.persistence.all_redirects().await?;
    let outcomes = state.persistence.recent_structured_outcomes(since).await?;
    let goal_weights = state.config.goal_weights_for(state.config.goal_mode);

    let fame = analytics::fame_score(
        &posts,
        0.0,
        state.config.engagement_z_mean,
        state.config.engagement_z_std,
        state.config.followers_z_mean,
        state.config.followers_z_std,
    );
    let authority = analytics::authority_signals(&posts);
    let revenue = analytics::revenue_per_day(&redirects, state.config.revenue_per_click);
    let (pilots, forks, partners, citations, ratings) = analytics::tally_structured_outcomes(&outcomes);
    let impact = analytics::impact_score(&state.config.impact, pilots, forks, partners, citations, &ratings);
    let penalty = 0.0;

    let global_j = analytics::global_j_score(
        impact.impact_score,
        revenue,
        authority,
        fame.fame_score,
        penalty,
        &goal_weights,
        state.config.impact.weekly_floor,
    );

    info!(
        global_j,
        impact = impact.impact_score,
        revenue,
        authority,
        fame = fame.fame_score,
        window_days = window.num_days(),
        "kpi_rollup"
    );
    Ok(())
}

async fn tick_follower_snapshot(state: AppState) -> VigilResult<()> {
    // No platform in `RawPlatformClient` exposes a followers-count endpoint;
    // until one is added, the tracked proxy is the perception sweep's total
    // signal volume, which still gives `fame_score`'s follower_delta term a
    // non-degenerate rolling series to diff against.
    let events = state.persistence.recent_sensed_events(1).await?;
    let count = events.first().and_then(|e| e.counts.get("signals")).copied().unwrap_or(0);
    state.persistence.append_followers_snapshot(FollowersSnapshot { ts: Utc::now(), count }).await
}

async fn tick_nightly_reflection(state: AppState) -> VigilResult<()> {
    if let Outcome::Success(persona) = state.persona.check_hot_reload().await? {
        info!(version = persona.version, "persona_hot_reloaded");
    }

    let since = Utc::now() - ChronoDuration::hours(24);
    let posts = state.persistence.recent_posts(since).await?;
    let scored: Vec<f64> = posts.iter().filter_map(|p| p.j_score).collect();
    if scored.is_empty() {
        return Ok(());
    }
    let avg_j = scored.iter().sum::<f64>() / scored.len() as f64;
    let worst_kind = posts
        .iter()
        .filter(|p| p.j_score.is_some())
        .min_by(|a, b| a.j_score.partial_cmp(&b.j_score).unwrap_or(std::cmp::Ordering::Equal))
        .map(|p| p.kind.as_str())
        .unwrap_or("none");

    let note = ImprovementNote {
        id: Uuid::new_v4(),
        text: format!("last 24h: {} posts, avg J={avg_j:.3}, weakest kind={worst_kind}", posts.len()),
        created_at: Utc::now(),
    };
    state.persistence.append_improvement_note(note, state.config.improvement_notes_cap).await
}

async fn tick_weekly_plan(state: AppState) -> VigilResult<()> {
    if let Outcome::Success(persona) = state.persona.check_hot_reload().await? {
        info!(version = persona.version, "persona_hot_reloaded");
    }
    log_global_j_score(&state, ChronoDuration::days(7)).await?;

    let snapshots = state.persistence.recent_followers_snapshots(2).await?;
    let delta = match snapshots.as_slice() {
        [latest, previous] => latest.count as i64 - previous.count as i64,
        _ => 0,
    };
    let note = ImprovementNote {
        id: Uuid::new_v4(),
        text: format!("weekly plan: follower-proxy delta over snapshot window = {delta}"),
        created_at: Utc::now(),
    };
    state.persistence.append_improvement_note(note, state.config.improvement_notes_cap).await
}
