//! Lifecycle callbacks.
//!
//! Hooks run after the scheduler has applied a transition and released its
//! state lock. Deliveries are serialized per scheduler and follow the order
//! the transitions were applied in, whichever thread applied them. For a
//! single transition `on_state_change` runs first, then the specific hook:
//!
//! | Transition | Hooks |
//! |---|---|
//! | `queued -> running` | `on_state_change`, `on_start` |
//! | `running -> succeeded` | `on_state_change`, `on_success`, `on_final` |
//! | `running -> queued` (retry) | `on_state_change`, `on_failure` |
//! | `running -> failed` | `on_state_change`, `on_failure`, `on_final` |
//! | `* -> cancelled` | `on_state_change`, `on_final` |
//!
//! Every other transition only calls `on_state_change`. Hooks receive a copy of
//! the record as it was right after the transition.
//!
//! A hook may call back into the scheduler. Transitions caused by that call
//! are delivered after the current hook returns. A panicking hook is logged
//! and skipped; the scheduler keeps running. Hooks block other deliveries
//! while they run, so keep them short.

use crate::job::{JobStatus, RuntimeJob};
use std::sync::Arc;

pub trait JobHooks: Send + Sync {
    fn on_state_change(&self, _job: &RuntimeJob, _prev: JobStatus, _next: JobStatus) {}

    fn on_start(&self, _job: &RuntimeJob) {}

    fn on_success(&self, _job: &RuntimeJob) {}

    /// `job.failure_reason` holds the reason for this attempt.
    fn on_failure(&self, _job: &RuntimeJob) {}

    /// Once per arrival in a terminal status.
    fn on_final(&self, _job: &RuntimeJob) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl JobHooks for NoopHooks {}

type JobCallback = Arc<dyn Fn(&RuntimeJob) + Send + Sync>;
type StateChangeCallback = Arc<dyn Fn(&RuntimeJob, JobStatus, JobStatus) + Send + Sync>;

/// Hooks assembled from closures.
///
/// ```rust
/// use batchwork::hooks::HookSet;
///
/// let hooks = HookSet::new()
///     .on_start(|job| println!("started {}", job.id()))
///     .on_final(|job| println!("{} finished as {}", job.id(), job.status));
/// # let _ = hooks;
/// ```
#[derive(Clone, Default)]
pub struct HookSet {
    state_change: Option<StateChangeCallback>,
    start: Option<JobCallback>,
    success: Option<JobCallback>,
    failure: Option<JobCallback>,
    finished: Option<JobCallback>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeJob, JobStatus, JobStatus) + Send + Sync + 'static,
    {
        self.state_change = Some(Arc::new(callback));
        self
    }

    pub fn on_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeJob) + Send + Sync + 'static,
    {
        self.start = Some(Arc::new(callback));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeJob) + Send + Sync + 'static,
    {
        self.success = Some(Arc::new(callback));
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeJob) + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(callback));
        self
    }

    pub fn on_final<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeJob) + Send + Sync + 'static,
    {
        self.finished = Some(Arc::new(callback));
        self
    }
}

impl JobHooks for HookSet {
    fn on_state_change(&self, job: &RuntimeJob, prev: JobStatus, next: JobStatus) {
        if let Some(callback) = &self.state_change {
            callback(job, prev, next);
        }
    }

    fn on_start(&self, job: &RuntimeJob) {
        if let Some(callback) = &self.start {
            callback(job);
        }
    }

    fn on_success(&self, job: &RuntimeJob) {
        if let Some(callback) = &self.success {
            callback(job);
        }
    }

    fn on_failure(&self, job: &RuntimeJob) {
        if let Some(callback) = &self.failure {
            callback(job);
        }
    }

    fn on_final(&self, job: &RuntimeJob) {
        if let Some(callback) = &self.finished {
            callback(job);
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("state_change", &self.state_change.is_some())
            .field("start", &self.start.is_some())
            .field("success", &self.success.is_some())
            .field("failure", &self.failure.is_some())
            .field("final", &self.finished.is_some())
            .finish()
    }
}

/// A transition captured under the state lock and delivered to hooks later.
#[derive(Debug, Clone)]
pub(crate) enum LifecycleEvent {
    StateChange {
        job: RuntimeJob,
        prev: JobStatus,
        next: JobStatus,
    },
    Started(RuntimeJob),
    Succeeded(RuntimeJob),
    Failed(RuntimeJob),
    Final(RuntimeJob),
}

impl LifecycleEvent {
    pub(crate) fn job(&self) -> &RuntimeJob {
        match self {
            LifecycleEvent::StateChange { job, .. }
            | LifecycleEvent::Started(job)
            | LifecycleEvent::Succeeded(job)
            | LifecycleEvent::Failed(job)
            | LifecycleEvent::Final(job) => job,
        }
    }

    pub(crate) fn deliver(&self, hooks: &dyn JobHooks) {
        match self {
            LifecycleEvent::StateChange { job, prev, next } => {
                hooks.on_state_change(job, *prev, *next)
            }
            LifecycleEvent::Started(job) => hooks.on_start(job),
            LifecycleEvent::Succeeded(job) => hooks.on_success(job),
            LifecycleEvent::Failed(job) => hooks.on_failure(job),
            LifecycleEvent::Final(job) => hooks.on_final(job),
        }
    }
}
