//! Attempt supervision, retry scheduling, priority aging and the scheduler's
//! background tasks.

use super::{Shared, state::Effects};
use crate::{
    Result,
    hooks::LifecycleEvent,
    job::{JobStatus, RuntimeJob},
    stats::JobEventType,
    work::JobWork,
};
use chrono::{DateTime, Utc};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::watch,
    task::JoinError,
    time::{MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, warn};

/// Failure reason recorded when an attempt outlives its timeout.
pub const ATTEMPT_TIMEOUT_REASON: &str = "attempt timeout";

/// Everything an attempt needs once it leaves the state lock.
pub(super) struct Attempt {
    pub token: u64,
    pub job: RuntimeJob,
    pub work: Arc<dyn JobWork>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptOutcome {
    Succeeded,
    Failed(String),
}

impl Shared {
    pub(super) fn spawn_attempt(self: &Arc<Self>, attempt: Attempt) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move { shared.supervise(attempt).await });
    }

    /// Run the work action in its own task so a panic or a timeout is observed
    /// here instead of unwinding through the scheduler. A timed-out action is
    /// left to finish in the background; its result is ignored.
    async fn supervise(self: Arc<Self>, attempt: Attempt) {
        let Attempt {
            token,
            job,
            work,
            timeout,
        } = attempt;
        let job_id = job.id().to_string();
        let started = Instant::now();

        let mut handle = self.runtime.spawn(async move { work.run(job).await });
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => AttemptOutcome::Succeeded,
            Ok(Ok(Err(e))) => AttemptOutcome::Failed(e.failure_reason()),
            Ok(Err(join_error)) => AttemptOutcome::Failed(join_failure(join_error)),
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Attempt timed out"
                );
                AttemptOutcome::Failed(ATTEMPT_TIMEOUT_REASON.to_string())
            }
        };

        self.complete_attempt(&job_id, token, outcome, started.elapsed());
    }

    fn complete_attempt(
        &self,
        job_id: &str,
        token: u64,
        outcome: AttemptOutcome,
        elapsed: Duration,
    ) {
        let now = self.clock.now();

        {
            let mut state = self.lock_state();
            let mut effects = Effects::default();
            state.running.remove(&token);

            let Some(job) = state.jobs.get_mut(job_id) else {
                debug!(job_id, token, "Attempt finished for a job no longer in the table");
                return;
            };
            if job.status != JobStatus::Running || job.dispatch != Some(token) {
                debug!(
                    job_id,
                    token,
                    status = %job.status,
                    "Discarding outcome of a superseded attempt"
                );
                return;
            }

            job.dispatch = None;
            job.finished_at = Some(now);
            match outcome {
                AttemptOutcome::Succeeded => {
                    job.failure_reason = None;
                    effects.transition(job, JobStatus::Succeeded);
                    effects.lifecycle(LifecycleEvent::Succeeded(job.clone()));
                    effects.lifecycle(LifecycleEvent::Final(job.clone()));
                    effects.metric(job, JobEventType::Succeeded, Some(elapsed), now);
                    debug!(
                        job_id,
                        attempt = job.attempts,
                        duration_ms = elapsed.as_millis() as u64,
                        "Job succeeded"
                    );
                }
                AttemptOutcome::Failed(reason) => {
                    job.failure_reason = Some(reason.clone());
                    if job.attempts <= job.definition.max_retries {
                        let delay = self
                            .config
                            .retry_strategy(job.definition.retry_backoff)
                            .calculate_delay(job.attempts);
                        job.next_eligible_at = Some(add_duration(now, delay));
                        effects.transition(job, JobStatus::Queued);
                        effects.lifecycle(LifecycleEvent::Failed(job.clone()));
                        effects.metric(job, JobEventType::Retried, Some(elapsed), now);
                        warn!(
                            job_id,
                            attempt = job.attempts,
                            max_retries = job.definition.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Attempt failed, retry scheduled"
                        );
                    } else {
                        effects.transition(job, JobStatus::Failed);
                        effects.lifecycle(LifecycleEvent::Failed(job.clone()));
                        effects.lifecycle(LifecycleEvent::Final(job.clone()));
                        effects.metric(job, JobEventType::Failed, Some(elapsed), now);
                        error!(
                            job_id,
                            class = %job.class(),
                            attempts = job.attempts,
                            reason = %reason,
                            "Job failed permanently"
                        );
                    }
                }
            }
            effects.persist = true;
            self.queue_effects(effects);
        }

        self.deliver_effects();
    }

    /// Raise the priority of every queued job that has waited past its aging
    /// threshold, by one level, and restart its wait.
    pub(super) fn age_queued(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut boosted = Vec::new();

        {
            let mut state = self.lock_state();
            for job in state.jobs.values_mut() {
                if job.status != JobStatus::Queued {
                    continue;
                }
                let Some(threshold) = job.definition.aging_threshold() else {
                    continue;
                };
                let waited = (now - job.enqueue_at).to_std().unwrap_or(Duration::ZERO);
                if waited < threshold {
                    continue;
                }
                let Some(next) = job.priority().boosted() else {
                    continue;
                };

                let previous = job.priority();
                job.definition.priority = next;
                job.enqueue_at = now;
                warn!(
                    job_id = %job.id(),
                    from = %previous,
                    to = %next,
                    waited_ms = waited.as_millis() as u64,
                    "Job priority aged"
                );
                boosted.push((job.sequence, job.id().to_string()));
            }
        }

        boosted.sort();
        let boosted: Vec<String> = boosted.into_iter().map(|(_, id)| id).collect();
        if !boosted.is_empty() {
            self.request_persist();
        }
        boosted
    }

    /// Merge the stored table into the live one. Non-terminal records come
    /// back `queued` with no pending backoff; ids already present are kept.
    pub(super) async fn recover(&self) {
        // Marks recovery finished on every exit, including a panicking store.
        let _done = RecoveryDone(&self.recovered);
        let Some(store) = &self.store else {
            return;
        };

        let loaded = store.load().await;
        let mut restored = 0usize;
        let mut skipped = 0usize;
        {
            let mut state = self.lock_state();
            for mut job in loaded {
                if state.jobs.contains_key(job.id()) {
                    skipped += 1;
                    continue;
                }
                if !job.status.is_terminal() {
                    job.status = JobStatus::Queued;
                    job.next_eligible_at = None;
                }
                job.dispatch = None;
                job.sequence = state.next_sequence();
                state.jobs.insert(job.id().to_string(), job);
                restored += 1;
            }
        }

        if restored > 0 || skipped > 0 {
            info!(restored, skipped, "Recovered jobs from snapshot");
        }
    }

    /// Write the whole table to the store, if one is configured. Waits for
    /// recovery first so a write never drops records still being loaded.
    pub(super) async fn persist_now(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut recovered = self.recovered.subscribe();
        let _ = recovered.wait_for(|done| *done).await;

        let _writer = self.persist_lock.lock().await;
        let jobs: Vec<RuntimeJob> = {
            let state = self.lock_state();
            state.ordered_jobs().into_iter().cloned().collect()
        };
        store.save(&jobs).await
    }
}

struct RecoveryDone<'a>(&'a watch::Sender<bool>);

impl Drop for RecoveryDone<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

fn join_failure(join_error: JoinError) -> String {
    if join_error.is_panic() {
        let panic = join_error.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("work action panicked: {}", message)
    } else {
        "work action was cancelled".to_string()
    }
}

fn add_duration(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Dispatch loop. The first cycle runs one period after start.
pub(super) async fn run_tick_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.config.tick_interval;
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let cycle = panic::catch_unwind(AssertUnwindSafe(|| shared.run_cycle()));
                if cycle.is_err() {
                    error!("Scheduling cycle panicked");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Dispatch loop stopped");
}

/// Aging loop, independent of the dispatch tick.
pub(super) async fn run_aging_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.config.aging_interval;
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let pass = panic::catch_unwind(AssertUnwindSafe(|| shared.age_queued()));
                if pass.is_err() {
                    error!("Aging pass panicked");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Aging loop stopped");
}

/// Serializes snapshot writes. Requests made while a write is in flight
/// collapse into one follow-up write.
pub(super) async fn run_persister(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        tokio::select! {
            _ = shared.persist_requested.notified() => {
                if let Err(e) = shared.persist_now().await {
                    warn!(error = %e, "Failed to persist job snapshot");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Persister stopped");
}
