//! Scheduler (§4.2, §5): periodic and cron-like triggers per job, each
//! re-entrant-safe (`max_instances=1`) and cancellable within a bounded
//! grace window on shutdown. Grounded on the daemon's maintenance loop:
//! `tokio::time::interval`-style sleeping between ticks, `tracing` at each
//! transition, and a skip path when the prior tick is still running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use rand::Rng;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{info, warn};
use vigil_core::{RuntimeConfig, VigilResult, JOB_NAMES};

/// One job's trigger rule (§4.2 table). `Interval` covers the nine
/// min/max/jitter rows; `Daily`/`Weekly` cover the three cron-like rows.
#[derive(Debug, Clone, Copy)]
pub enum Cadence {
    Interval { min_minutes: u64, max_minutes: u64, jitter_minutes: f64 },
    Daily { hour: u8 },
    Weekly { weekday: Weekday, hour: u8 },
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub cadence: Cadence,
}

/// Builds the twelve job specs from `RuntimeConfig`, resolving the three
/// cron-like jobs to their configured hour/weekday instead of an interval.
pub fn build_job_specs(config: &RuntimeConfig) -> Vec<JobSpec> {
    JOB_NAMES
        .iter()
        .map(|&name| {
            let cadence = match name {
                "follower_snapshot" => Cadence::Daily { hour: config.follower_snapshot_hour },
                "nightly_reflection" => Cadence::Daily { hour: config.nightly_reflection_hour },
                "weekly_plan" => Cadence::Weekly { weekday: Weekday::Sun, hour: config.weekly_plan_hour },
                _ => {
                    let jc = config.job_cadence(name);
                    Cadence::Interval { min_minutes: jc.min_minutes, max_minutes: jc.max_minutes, jitter_minutes: jc.jitter_minutes }
                }
            };
            JobSpec { name: name.to_string(), cadence }
        })
        .collect()
}

fn duration_until_hour(now: DateTime<Utc>, hour: u8) -> Duration {
    let today_target = now.date_naive().and_hms_opt(hour as u32, 0, 0).unwrap_or_else(|| now.naive_utc());
    let target_utc = today_target.and_utc();
    let target = if target_utc > now { target_utc } else { target_utc + chrono::Duration::days(1) };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

fn duration_until_weekday_hour(now: DateTime<Utc>, weekday: Weekday, hour: u8) -> Duration {
    let mut days_ahead = (weekday.num_days_from_monday() as i64) - (now.weekday().num_days_from_monday() as i64);
    if days_ahead < 0 {
        days_ahead += 7;
    }
    let candidate_date = now.date_naive() + chrono::Duration::days(days_ahead);
    let candidate = candidate_date.and_hms_opt(hour as u32, 0, 0).unwrap_or_else(|| now.naive_utc()).and_utc();
    let target = if candidate > now { candidate } else { candidate + chrono::Duration::days(7) };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

/// Additive jitter applied to the base interval, per §4.2.
fn next_delay(cadence: &Cadence, now: DateTime<Utc>) -> Duration {
    match cadence {
        Cadence::Interval { min_minutes, max_minutes, jitter_minutes } => {
            let mut rng = rand::thread_rng();
            let base_minutes = if max_minutes > min_minutes { rng.gen_range(*min_minutes..=*max_minutes) } else { *min_minutes };
            let jitter = if *jitter_minutes > 0.0 { rng.gen_range(-*jitter_minutes..=*jitter_minutes) } else { 0.0 };
            let total_secs = (base_minutes as f64 * 60.0 + jitter * 60.0).max(1.0);
            Duration::from_secs_f64(total_secs)
        }
        Cadence::Daily { hour } => duration_until_hour(now, *hour),
        Cadence::Weekly { weekday, hour } => duration_until_weekday_hour(now, *weekday, *hour),
    }
}

/// Per-job run counters exposed through `Scheduler::snapshot` (Design Notes
/// §9: an observability surface analogous to the daemon's health report).
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

enum TickOutcome {
    Completed(VigilResult<()>),
    TimedOut,
    Aborted,
}

/// Runs `fut` under a 15s per-call write timeout (§5 "15s default for
/// writes"). If shutdown is signalled mid-run, allows `grace` more time
/// before giving up on the tick entirely.
async fn run_with_grace<Fut>(fut: Fut, normal_timeout: Duration, shutdown_rx: &mut watch::Receiver<bool>, grace: Duration) -> TickOutcome
where
    Fut: Future<Output = VigilResult<()>>,
{
    tokio::pin!(fut);
    tokio::select! {
        res = &mut fut => TickOutcome::Completed(res),
        _ = tokio::time::sleep(normal_timeout) => TickOutcome::TimedOut,
        changed = shutdown_rx.changed() => {
            if changed.is_err() || !*shutdown_rx.borrow() {
                // Sender dropped, or a spurious notification with no real
                // shutdown request: keep waiting on the job itself.
                return match fut.await {
                    res => TickOutcome::Completed(res),
                };
            }
            tokio::select! {
                res = &mut fut => TickOutcome::Completed(res),
                _ = tokio::time::sleep(grace) => TickOutcome::Aborted,
            }
        }
    }
}

/// Owns the shutdown signal, per-job re-entry semaphores, and run metrics.
/// Each job's loop is driven by a call to `run_job`, typically spawned onto
/// its own task by the daemon.
pub struct Scheduler {
    config: RuntimeConfig,
    shutdown: watch::Sender<bool>,
    metrics: RwLock<HashMap<String, JobMetrics>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        let (tx, _rx) = watch::channel(false);
        let specs = build_job_specs(&config);
        let semaphores = specs.iter().map(|s| (s.name.clone(), Arc::new(Semaphore::new(1)))).collect();
        let metrics = specs.iter().map(|s| (s.name.clone(), JobMetrics::default())).collect();
        Self { config, shutdown: tx, metrics: RwLock::new(metrics), semaphores }
    }

    /// Signals every running job loop to stop accepting new ticks and wind
    /// down within its grace window (§4.2, §5 "Cancellation").
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.subscribe().borrow()
    }

    pub async fn snapshot(&self, name: &str) -> Option<JobMetrics> {
        self.metrics.read().await.get(name).cloned()
    }

    pub async fn snapshot_all(&self) -> HashMap<String, JobMetrics> {
        self.metrics.read().await.clone()
    }

    async fn record_success(&self, name: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(name.to_string()).or_default();
        entry.ticks_run += 1;
        entry.last_run_at = Some(Utc::now());
        entry.last_error = None;
    }

    async fn record_error(&self, name: &str, error: String) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(name.to_string()).or_default();
        entry.ticks_run += 1;
        entry.last_run_at = Some(Utc::now());
        entry.last_error = Some(error);
    }

    async fn record_skip(&self, name: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(name.to_string()).or_default();
        entry.ticks_skipped += 1;
    }

    /// Drives `name`'s loop until shutdown is requested: sleeps for the
    /// cadence's next jittered delay, skips the tick if a prior run of the
    /// same job is still in flight (re-entrant-safety, `max_instances=1`),
    /// otherwise runs `job` once under the write timeout/grace window.
    pub async fn run_job<F, Fut>(&self, name: &str, mut job: F)
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = VigilResult<()>> + Send,
    {
        let spec = match build_job_specs(&self.config).into_iter().find(|s| s.name == name) {
            Some(s) => s,
            None => {
                warn!(job = name, "unknown_job_name");
                return;
            }
        };
        let semaphore = match self.semaphores.get(name) {
            Some(s) => s.clone(),
            None => return,
        };
        let mut shutdown_rx = self.shutdown.subscribe();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);

        loop {
            let delay = next_delay(&spec.cadence, Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    info!(job = name, "job_reentry_blocked");
                    self.record_skip(name).await;
                    continue;
                }
            };

            let outcome = run_with_grace(job(), Duration::from_secs(15), &mut shutdown_rx, grace).await;
            drop(permit);

            match outcome {
                TickOutcome::Completed(Ok(())) => self.record_success(name).await,
                TickOutcome::Completed(Err(e)) => {
                    warn!(job = name, error = %e, "job_tick_failed");
                    self.record_error(name, e.to_string()).await;
                }
                TickOutcome::TimedOut => {
                    warn!(job = name, "job_tick_timed_out");
                    self.record_error(name, "tick exceeded its write timeout".to_string()).await;
                }
                TickOutcome::Aborted => {
                    warn!(job = name, "job_force_aborted_on_shutdown");
                    self.record_error(name, "force-aborted past the shutdown grace window".to_string()).await;
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn build_job_specs_resolves_all_twelve_jobs() {
        let config = RuntimeConfig::default();
        let specs = build_job_specs(&config);
        assert_eq!(specs.len(), JOB_NAMES.len());
        let weekly = specs.iter().find(|s| s.name == "weekly_plan").unwrap();
        assert!(matches!(weekly.cadence, Cadence::Weekly { weekday: Weekday::Sun, .. }));
    }

    #[test]
    fn duration_until_hour_rolls_to_tomorrow_when_past() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        let delay = duration_until_hour(now, 4);
        assert!(delay.as_secs() > 0 && delay.as_secs() <= 6 * 3600);
    }

    #[test]
    fn duration_until_weekday_hour_finds_next_sunday() {
        // 2026-01-01 is a Thursday.
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let delay = duration_until_weekday_hour(now, Weekday::Sun, 5);
        let target = now + chrono::Duration::from_std(delay).unwrap();
        assert_eq!(target.weekday(), Weekday::Sun);
    }

    #[tokio::test]
    async fn reentrant_tick_is_skipped_while_previous_run_holds_the_permit() {
        let config = RuntimeConfig::default();
        let scheduler = Scheduler::new(config);
        let semaphore = scheduler.semaphores.get("crisis_watch").unwrap().clone();
        let _held = semaphore.try_acquire_owned().unwrap();
        assert!(semaphore.try_acquire_owned().is_err());
    }

    #[tokio::test]
    async fn snapshot_reports_success_after_one_completed_tick() {
        let config = RuntimeConfig::default();
        let scheduler = Scheduler::new(config);
        scheduler.record_success("crisis_watch").await;
        let snap = scheduler.snapshot("crisis_watch").await.unwrap();
        assert_eq!(snap.ticks_run, 1);
        assert!(snap.last_error.is_none());
    }
}
