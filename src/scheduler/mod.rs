//! The batch scheduler.
//!
//! [`BatchScheduler`] owns the job table. Callers submit [`JobDefinition`]s and
//! steer jobs with `hold`, `release`, `cancel` and `requeue`; everything else
//! happens inside the scheduler:
//!
//! - a **dispatch loop** runs a scheduling cycle every `tick_interval`, and a
//!   cycle also runs right after `submit`, `release` and `requeue`;
//! - every dispatched attempt runs in its own Tokio task under an attempt
//!   timeout, and its outcome feeds back into the job table;
//! - an **aging loop** raises the priority of starving queued jobs every
//!   `aging_interval`;
//! - a **persister** writes the whole table to the [`SnapshotStore`] after
//!   dispatches, terminal transitions, retries and control operations.
//!
//! ## Scheduling cycle
//!
//! 1. `blocked` jobs whose dependencies have all succeeded, whose time window
//!    is open and whose retry backoff has elapsed move back to `queued`.
//! 2. `queued` jobs that fail the same test move to `blocked`; the rest form
//!    the ready set.
//! 3. The ready set is ordered by the [`JobComparator`].
//! 4. Each ready job is dispatched unless the global cap, its class cap, or a
//!    lease on one of its resource tags holds it back; such jobs stay `queued`
//!    and are reported as waiting.
//!
//! ## Example
//!
//! ```rust,no_run
//! use batchwork::{BatchScheduler, JobDefinition, SchedulerConfig, work::work_fn};
//! use std::time::Duration;
//!
//! # async fn example() -> batchwork::Result<()> {
//! let scheduler = BatchScheduler::builder(SchedulerConfig::default())
//!     .with_default_work(work_fn(|job| async move {
//!         println!("running {}", job.id());
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! scheduler.submit(JobDefinition::new("extract"))?;
//! scheduler.submit(JobDefinition::new("load").depends_on("extract"))?;
//!
//! scheduler.wait_for_idle(Duration::from_secs(5)).await;
//! let snapshot = scheduler.snapshot();
//! assert_eq!(snapshot.succeeded.len(), 2);
//!
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod cycle;
mod state;
mod supervisor;

pub use supervisor::ATTEMPT_TIMEOUT_REASON;

use crate::{
    BatchworkError, Result,
    clock::{Clock, SystemClock},
    config::SchedulerConfig,
    hooks::{JobHooks, LifecycleEvent, NoopHooks},
    job::{JobDefinition, JobOverrides, JobStatus, RuntimeJob},
    lock::LockAuthority,
    metrics::{NoopMetrics, SchedulerMetrics},
    persistence::{FileSnapshotStore, SnapshotStore},
    priority::{JobComparator, default_comparator},
    snapshot::{BatchSnapshot, ScheduleResult},
    work::{JobWork, PlaceholderWork},
};
use state::{Effects, SchedulerState};
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Reason recorded by [`BatchScheduler::cancel`] when the caller gives none.
pub const DEFAULT_CANCEL_REASON: &str = "cancelled by operator";

/// State shared between the public handle, the background loops and the
/// attempt tasks.
pub(crate) struct Shared {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    clock: Arc<dyn Clock>,
    locks: Option<Arc<dyn LockAuthority>>,
    store: Option<Arc<dyn SnapshotStore>>,
    metrics: Arc<dyn SchedulerMetrics>,
    hooks: RwLock<Arc<dyn JobHooks>>,
    /// Effects queued under the state lock, in transition order.
    pending_effects: Mutex<VecDeque<Effects>>,
    /// Held by the thread draining `pending_effects`.
    delivery: Mutex<()>,
    comparator: JobComparator,
    default_work: Arc<dyn JobWork>,
    runtime: Handle,
    persist_requested: Notify,
    persist_lock: tokio::sync::Mutex<()>,
    recovered: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn request_persist(&self) {
        if self.store.is_some() {
            self.persist_requested.notify_one();
        }
    }

    /// Queue `effects` for delivery. Call with the state lock held so the
    /// queue follows the order transitions were applied in.
    fn queue_effects(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        self.pending_effects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(effects);
    }

    /// Drain the effect queue. Must not be called with the state lock held.
    ///
    /// One thread delivers at a time; a caller arriving while another thread
    /// drains waits for it, so its own effects have been delivered on return.
    /// A call made from inside a hook only leaves its effects queued for the
    /// drain already running on this thread.
    fn deliver_effects(&self) {
        let Some(_reentry) = DeliveryGuard::enter(self) else {
            return;
        };
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let next = self
                .pending_effects
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(effects) => self.apply_effects(effects),
                None => break,
            }
        }
    }

    fn apply_effects(&self, effects: Effects) {
        if !effects.lifecycle.is_empty() {
            let hooks = Arc::clone(&*self.hooks.read().unwrap_or_else(PoisonError::into_inner));
            for event in &effects.lifecycle {
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| event.deliver(hooks.as_ref())));
                if delivered.is_err() {
                    error!(job_id = %event.job().id(), "Lifecycle hook panicked");
                }
            }
        }
        for event in &effects.events {
            self.metrics.record_event(event);
        }
        if effects.persist {
            self.request_persist();
        }
    }
}

thread_local! {
    /// Schedulers whose effects are being delivered on this thread.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a scheduler as delivering on the current thread until dropped.
struct DeliveryGuard(usize);

impl DeliveryGuard {
    fn enter(shared: &Shared) -> Option<Self> {
        let id = shared as *const Shared as usize;
        DELIVERING.with(|delivering| {
            let mut delivering = delivering.borrow_mut();
            if delivering.contains(&id) {
                return None;
            }
            delivering.push(id);
            Some(Self(id))
        })
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        DELIVERING.with(|delivering| delivering.borrow_mut().retain(|id| *id != self.0));
    }
}

/// Builder for [`BatchScheduler`]. Every collaborator is optional.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    locks: Option<Arc<dyn LockAuthority>>,
    store: Option<Arc<dyn SnapshotStore>>,
    metrics: Option<Arc<dyn SchedulerMetrics>>,
    hooks: Option<Arc<dyn JobHooks>>,
    comparator: Option<JobComparator>,
    default_work: Option<Arc<dyn JobWork>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            clock: None,
            locks: None,
            store: None,
            metrics: None,
            hooks: None,
            comparator: None,
            default_work: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Gate dispatch on the leases reported by `locks`.
    pub fn with_lock_authority(mut self, locks: Arc<dyn LockAuthority>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Overrides `config.snapshot_path`.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn JobHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Replace the ready-set ordering. `Ordering::Less` dispatches first.
    ///
    /// The comparator must be a total order. The standard sort may panic on
    /// one that is not; such a cycle is logged and dispatches in submission
    /// order instead.
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&RuntimeJob, &RuntimeJob) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(comparator));
        self
    }

    /// Work run for jobs whose payload carries none.
    pub fn with_default_work(mut self, work: Arc<dyn JobWork>) -> Self {
        self.default_work = Some(work);
        self
    }

    /// Start the scheduler on the current Tokio runtime.
    ///
    /// Recovery from the snapshot store starts in the background; use
    /// [`BatchScheduler::wait_until_recovered`] to wait for it.
    pub fn build(self) -> Result<BatchScheduler> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            BatchworkError::Config("BatchScheduler must be built inside a Tokio runtime".to_string())
        })?;

        let store = self.store.or_else(|| {
            self.config
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(FileSnapshotStore::new(path)) as Arc<dyn SnapshotStore>)
        });

        let (recovered, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config: self.config,
            state: Mutex::new(SchedulerState::default()),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            locks: self.locks,
            store,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            hooks: RwLock::new(self.hooks.unwrap_or_else(|| Arc::new(NoopHooks))),
            pending_effects: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            comparator: self
                .comparator
                .unwrap_or_else(|| Arc::new(default_comparator)),
            default_work: self
                .default_work
                .unwrap_or_else(|| Arc::new(PlaceholderWork::default())),
            runtime: runtime.clone(),
            persist_requested: Notify::new(),
            persist_lock: tokio::sync::Mutex::new(()),
            recovered,
            shutdown,
        });

        let recovery = {
            let shared = Arc::clone(&shared);
            runtime.spawn(async move { shared.recover().await })
        };
        let tasks = vec![
            recovery,
            runtime.spawn(supervisor::run_tick_loop(
                Arc::clone(&shared),
                shared.shutdown.subscribe(),
            )),
            runtime.spawn(supervisor::run_aging_loop(
                Arc::clone(&shared),
                shared.shutdown.subscribe(),
            )),
            runtime.spawn(supervisor::run_persister(
                Arc::clone(&shared),
                shared.shutdown.subscribe(),
            )),
        ];

        info!(
            max_concurrent = shared.config.max_concurrent,
            tick_ms = shared.config.tick_interval.as_millis() as u64,
            aging_ms = shared.config.aging_interval.as_millis() as u64,
            persistent = shared.store.is_some(),
            "Batch scheduler started"
        );

        Ok(BatchScheduler {
            shared,
            tasks: Mutex::new(tasks),
        })
    }
}

/// In-process batch job scheduler. See the [module docs](self).
///
/// Dropping the scheduler stops its background loops without a final
/// snapshot write; call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct BatchScheduler {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// A scheduler with no lock authority, no metrics and the placeholder work.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        SchedulerBuilder::new(config).build()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Add a job in `queued` and run a scheduling cycle.
    ///
    /// Returns the record as created, before the cycle ran.
    pub fn submit(&self, mut definition: JobDefinition) -> Result<RuntimeJob> {
        definition.validate()?;
        let now = self.shared.clock.now();

        let job = {
            let mut state = self.shared.lock_state();
            if state.jobs.contains_key(&definition.id) {
                return Err(BatchworkError::DuplicateJob { id: definition.id });
            }
            definition.created_at.get_or_insert(now);
            let mut job = RuntimeJob::new(definition, now);
            job.sequence = state.next_sequence();
            state.jobs.insert(job.id().to_string(), job.clone());
            job
        };

        info!(
            job_id = %job.id(),
            class = %job.class(),
            priority = %job.priority(),
            dependencies = job.definition.dependencies.len(),
            "Job submitted"
        );
        self.shared.request_persist();
        self.shared.run_cycle();
        Ok(job)
    }

    /// Move a `queued` or `blocked` job to `held`.
    pub fn hold(&self, id: &str) -> Result<()> {
        self.control(id, "hold", |job, effects| match job.status {
            JobStatus::Queued | JobStatus::Blocked => {
                effects.transition(job, JobStatus::Held);
                Ok(())
            }
            status => Err(status),
        })?;
        info!(job_id = id, "Job held");
        Ok(())
    }

    /// Move a `held` job back to `queued` and run a scheduling cycle.
    pub fn release(&self, id: &str) -> Result<()> {
        self.control(id, "release", |job, effects| match job.status {
            JobStatus::Held => {
                effects.transition(job, JobStatus::Queued);
                Ok(())
            }
            status => Err(status),
        })?;
        info!(job_id = id, "Job released");
        self.shared.run_cycle();
        Ok(())
    }

    /// Cancel a job. Cancelling a terminal job does nothing.
    ///
    /// A running job's work action is not interrupted; its result is
    /// discarded and it keeps its concurrency slot until it settles.
    pub fn cancel(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let now = self.shared.clock.now();
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON);
        let mut effects = Effects::default();

        {
            let mut state = self.shared.lock_state();
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| BatchworkError::JobNotFound { id: id.to_string() })?;
            if job.is_terminal() {
                debug!(job_id = id, status = %job.status, "Cancel ignored for terminal job");
                return Ok(());
            }

            job.failure_reason = Some(reason.to_string());
            job.finished_at = Some(now);
            job.dispatch = None;
            effects.transition(job, JobStatus::Cancelled);
            effects.lifecycle(LifecycleEvent::Final(job.clone()));
            effects.persist = true;
            self.shared.queue_effects(effects);
        }

        info!(job_id = id, reason, "Job cancelled");
        self.shared.deliver_effects();
        Ok(())
    }

    /// Replace a terminal job with a fresh `queued` record under the same id,
    /// with `overrides` merged into its definition and no attempts.
    pub fn requeue(&self, id: &str, overrides: JobOverrides) -> Result<RuntimeJob> {
        let now = self.shared.clock.now();
        let mut effects = Effects::default();

        let fresh = {
            let mut state = self.shared.lock_state();
            let previous = state
                .jobs
                .get(id)
                .ok_or_else(|| BatchworkError::JobNotFound { id: id.to_string() })?;
            if !previous.is_terminal() {
                return Err(BatchworkError::NotTerminal {
                    id: id.to_string(),
                    status: previous.status,
                });
            }

            let definition = overrides.apply(previous.definition.clone());
            definition.validate()?;

            let prev_status = previous.status;
            let mut fresh = RuntimeJob::new(definition, now);
            fresh.sequence = previous.sequence;
            effects.lifecycle(LifecycleEvent::StateChange {
                job: fresh.clone(),
                prev: prev_status,
                next: JobStatus::Queued,
            });
            effects.persist = true;
            state.jobs.insert(id.to_string(), fresh.clone());
            self.shared.queue_effects(effects);
            fresh
        };

        info!(job_id = id, priority = %fresh.priority(), "Job requeued");
        self.shared.deliver_effects();
        self.shared.run_cycle();
        Ok(fresh)
    }

    /// Point-in-time view of the table. Never changes state.
    pub fn snapshot(&self) -> BatchSnapshot {
        let now = self.shared.clock.now();
        let state = self.shared.lock_state();
        BatchSnapshot::from_jobs(
            now,
            state.ordered_jobs(),
            &self.shared.config.max_per_class,
        )
    }

    pub fn get(&self, id: &str) -> Option<RuntimeJob> {
        self.shared.lock_state().jobs.get(id).cloned()
    }

    /// Run one scheduling cycle now.
    pub fn tick_once(&self) -> ScheduleResult {
        self.shared.run_cycle()
    }

    /// Run one aging pass now, returning the ids whose priority was raised.
    pub fn age_once(&self) -> Vec<String> {
        self.shared.age_queued()
    }

    /// Poll until nothing is queued, blocked or running, or `timeout` passes.
    /// Returns whether the scheduler went idle.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let poll = self
            .shared
            .config
            .tick_interval
            .min(Duration::from_millis(20));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shared.lock_state().is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Resolves once the startup load from the snapshot store has finished.
    pub async fn wait_until_recovered(&self) {
        let mut recovered = self.shared.recovered.subscribe();
        let _ = recovered.wait_for(|done| *done).await;
    }

    pub fn is_recovered(&self) -> bool {
        *self.shared.recovered.borrow()
    }

    /// Write the current table to the snapshot store now.
    pub async fn persist(&self) -> Result<()> {
        self.shared.persist_now().await
    }

    /// Stop the loops and write a final snapshot. Attempts already running
    /// finish in the background; no new attempts are dispatched.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        self.shared.persist_now().await?;
        info!("Batch scheduler stopped");
        Ok(())
    }

    /// Replace the lifecycle hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn JobHooks>) {
        *self
            .shared
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// Apply a status change to one job under the lock. `change` returns the
    /// offending status when the job is in the wrong state for `action`.
    fn control<F>(&self, id: &str, action: &'static str, change: F) -> Result<()>
    where
        F: FnOnce(&mut RuntimeJob, &mut Effects) -> std::result::Result<(), JobStatus>,
    {
        let mut effects = Effects::default();
        {
            let mut state = self.shared.lock_state();
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| BatchworkError::JobNotFound { id: id.to_string() })?;
            change(job, &mut effects).map_err(|status| BatchworkError::InvalidState {
                id: id.to_string(),
                status,
                action,
            })?;
            effects.persist = true;
            self.shared.queue_effects(effects);
        }
        self.shared.deliver_effects();
        Ok(())
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MockClock, hooks::HookSet, persistence::MemorySnapshotStore, priority::JobPriority,
        work::work_fn,
    };

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_secs(3600))
            .with_aging_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = BatchScheduler::new(SchedulerConfig::default());
        assert!(matches!(result, Err(BatchworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = BatchScheduler::new(SchedulerConfig::default().with_max_concurrent(0));
        assert!(matches!(result, Err(BatchworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_submit_duplicate_is_rejected_without_mutation() {
        let scheduler = BatchScheduler::new(config()).unwrap();
        let job = scheduler.submit(JobDefinition::new("a")).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.definition.created_at.is_some());

        let error = scheduler.submit(JobDefinition::new("a")).unwrap_err();
        assert_eq!(error.to_string(), "Job id exists: a");
        assert_eq!(scheduler.snapshot().total(), 1);
    }

    #[tokio::test]
    async fn test_hold_and_release_state_checks() {
        let scheduler = BatchScheduler::builder(config().with_max_concurrent(1))
            .with_default_work(work_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }))
            .build()
            .unwrap();

        scheduler.submit(JobDefinition::new("runner")).unwrap();
        scheduler.submit(JobDefinition::new("waiter")).unwrap();
        assert_eq!(scheduler.get("runner").unwrap().status, JobStatus::Running);

        assert!(matches!(
            scheduler.hold("runner"),
            Err(BatchworkError::InvalidState { action: "hold", .. })
        ));
        assert!(matches!(
            scheduler.release("waiter"),
            Err(BatchworkError::InvalidState {
                action: "release",
                ..
            })
        ));
        assert!(matches!(
            scheduler.hold("ghost"),
            Err(BatchworkError::JobNotFound { .. })
        ));

        scheduler.hold("waiter").unwrap();
        assert_eq!(scheduler.get("waiter").unwrap().status, JobStatus::Held);
        scheduler.release("waiter").unwrap();
        assert_eq!(scheduler.get("waiter").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_cycle_reports_waiting_and_blocked() {
        let scheduler = BatchScheduler::builder(config().with_max_concurrent(1))
            .with_default_work(work_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }))
            .build()
            .unwrap();

        scheduler.submit(JobDefinition::new("first")).unwrap();
        scheduler.submit(JobDefinition::new("second")).unwrap();
        scheduler
            .submit(JobDefinition::new("child").depends_on("first"))
            .unwrap();

        let result = scheduler.tick_once();
        assert!(result.started.is_empty());
        assert_eq!(result.waiting, vec!["second".to_string()]);
        assert_eq!(result.blocked, vec!["child".to_string()]);
    }

    #[tokio::test]
    async fn test_age_once_boosts_and_resets_enqueue_time() {
        let clock = MockClock::new();
        let scheduler = BatchScheduler::builder(config().with_max_concurrent(1))
            .with_clock(Arc::new(clock.clone()))
            .with_default_work(work_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }))
            .build()
            .unwrap();

        scheduler.submit(JobDefinition::new("gate")).unwrap();
        scheduler
            .submit(
                JobDefinition::new("starving")
                    .with_priority(JobPriority::new(8).unwrap())
                    .with_aging(Duration::from_secs(10)),
            )
            .unwrap();

        clock.advance(chrono::Duration::seconds(9));
        assert!(scheduler.age_once().is_empty());

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(scheduler.age_once(), vec!["starving".to_string()]);
        let job = scheduler.get("starving").unwrap();
        assert_eq!(job.priority(), JobPriority::HIGHEST);
        assert_eq!(job.enqueue_at, clock.now());

        clock.advance(chrono::Duration::seconds(60));
        assert!(scheduler.age_once().is_empty());
    }

    #[tokio::test]
    async fn test_set_hooks_replaces_hooks() {
        let scheduler = BatchScheduler::new(config().with_max_concurrent(1)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler.set_hooks(Arc::new(HookSet::new().on_final(move |job| {
            sink.lock().unwrap().push(job.id().to_string())
        })));

        scheduler.submit(JobDefinition::new("x")).unwrap();
        scheduler.cancel("x", None).ok();
        assert!(scheduler.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(seen.lock().unwrap().as_slice(), ["x".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_snapshot_and_stops_dispatch() {
        let store = Arc::new(MemorySnapshotStore::new());
        let scheduler = BatchScheduler::builder(config())
            .with_snapshot_store(store.clone())
            .build()
            .unwrap();
        scheduler.wait_until_recovered().await;
        scheduler.submit(JobDefinition::new("a")).unwrap();
        assert!(scheduler.wait_for_idle(Duration::from_secs(2)).await);

        scheduler.shutdown().await.unwrap();
        let stored = store.load().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, JobStatus::Succeeded);

        scheduler.submit(JobDefinition::new("late")).unwrap();
        assert!(scheduler.tick_once().started.is_empty());
        assert_eq!(scheduler.get("late").unwrap().status, JobStatus::Queued);
    }
}
