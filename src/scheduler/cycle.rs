//! One scheduling cycle: reclassify, order, gate, dispatch.

use super::{
    Shared,
    state::{Effects, RunningSlot, is_eligible},
    supervisor::Attempt,
};
use crate::{
    hooks::LifecycleEvent,
    job::{JobStatus, RuntimeJob},
    snapshot::ScheduleResult,
    stats::JobEventType,
};
use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, trace};

/// Why a ready job was not dispatched this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    GlobalCapacity,
    ClassCapacity,
    ResourceLocked,
}

impl Shared {
    pub(super) fn run_cycle(self: &Arc<Self>) -> ScheduleResult {
        if self.is_shutting_down() {
            return ScheduleResult::default();
        }

        // One lease query per cycle, before taking the state lock.
        let locked: HashSet<String> = self
            .locks
            .as_ref()
            .map(|locks| locks.locked_keys())
            .unwrap_or_default();

        let now = self.clock.now();
        let mut effects = Effects::default();
        let mut attempts = Vec::new();
        let mut result = ScheduleResult::default();

        {
            let mut state = self.lock_state();
            let succeeded = state.succeeded_ids();

            for job in state.jobs.values_mut() {
                if job.status == JobStatus::Blocked && is_eligible(job, &succeeded, now) {
                    effects.transition(job, JobStatus::Queued);
                }
            }

            let mut ready: Vec<RuntimeJob> = Vec::new();
            for job in state.jobs.values_mut() {
                if job.status != JobStatus::Queued {
                    continue;
                }
                if is_eligible(job, &succeeded, now) {
                    ready.push(job.clone());
                } else {
                    effects.transition(job, JobStatus::Blocked);
                }
            }

            // Stable order first so comparator ties are deterministic.
            ready.sort_by_key(|job| job.sequence);
            let sorted = panic::catch_unwind(AssertUnwindSafe(|| {
                ready.sort_by(|a, b| (self.comparator)(a, b))
            }));
            if sorted.is_err() {
                error!("Job comparator panicked, dispatching in submission order");
                ready.sort_by_key(|job| job.sequence);
            }

            let mut running_total = state.running.len();
            let mut running_per_class = state.running_per_class();

            for candidate in ready {
                let class = candidate.class().to_string();
                let gate = if running_total >= self.config.max_concurrent {
                    Some(Gate::GlobalCapacity)
                } else if self
                    .config
                    .class_limit(&class)
                    .is_some_and(|limit| running_per_class.get(&class).copied().unwrap_or(0) >= limit)
                {
                    Some(Gate::ClassCapacity)
                } else if candidate
                    .definition
                    .resource_tags
                    .iter()
                    .any(|tag| locked.contains(tag))
                {
                    Some(Gate::ResourceLocked)
                } else {
                    None
                };

                if let Some(gate) = gate {
                    trace!(job_id = %candidate.id(), ?gate, "Job waiting");
                    result.waiting.push(candidate.id().to_string());
                    continue;
                }

                let token = state.next_token();
                let Some(job) = state.jobs.get_mut(candidate.id()) else {
                    continue;
                };

                job.attempts += 1;
                job.started_at = Some(now);
                job.finished_at = None;
                job.dispatch = Some(token);
                effects.transition(job, JobStatus::Running);
                effects.lifecycle(LifecycleEvent::Started(job.clone()));
                effects.metric(job, JobEventType::Started, None, now);

                debug!(
                    job_id = %job.id(),
                    class = %class,
                    attempt = job.attempts,
                    priority = %job.priority(),
                    "Dispatching job"
                );

                attempts.push(Attempt {
                    token,
                    job: job.clone(),
                    work: job
                        .definition
                        .payload
                        .work
                        .clone()
                        .unwrap_or_else(|| Arc::clone(&self.default_work)),
                    timeout: job
                        .definition
                        .attempt_timeout
                        .unwrap_or(self.config.default_attempt_timeout),
                });

                result.started.push(job.id().to_string());
                state.running.insert(
                    token,
                    RunningSlot {
                        job_id: candidate.id().to_string(),
                        class: class.clone(),
                    },
                );
                running_total += 1;
                *running_per_class.entry(class).or_insert(0) += 1;
            }

            result.blocked = state.ids_with_status(JobStatus::Blocked);
            effects.persist = !result.started.is_empty();
            self.queue_effects(effects);
        }

        if !result.started.is_empty() || !result.waiting.is_empty() {
            debug!(
                started = result.started.len(),
                waiting = result.waiting.len(),
                blocked = result.blocked.len(),
                "Scheduling cycle"
            );
        }

        // Attempts are already `running` in the table; start them before any
        // hook gets a chance to stall or unwind this cycle.
        for attempt in attempts {
            self.spawn_attempt(attempt);
        }
        self.deliver_effects();

        result
    }
}
