use crate::{
    hooks::LifecycleEvent,
    job::{JobStatus, RuntimeJob},
    stats::{JobEvent, JobEventType},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tracing::debug;

/// A concurrency slot held by one dispatched attempt.
#[derive(Debug, Clone)]
pub(super) struct RunningSlot {
    pub job_id: String,
    pub class: String,
}

/// The job table and running set. Only touched under the scheduler's lock.
#[derive(Debug, Default)]
pub(super) struct SchedulerState {
    pub jobs: HashMap<String, RuntimeJob>,
    /// Keyed by dispatch token. A slot is freed when its attempt settles, even
    /// if the job was cancelled in the meantime.
    pub running: HashMap<u64, RunningSlot>,
    next_sequence: u64,
    next_token: u64,
}

impl SchedulerState {
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn running_per_class(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for slot in self.running.values() {
            *counts.entry(slot.class.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn succeeded_ids(&self) -> HashSet<String> {
        self.jobs
            .values()
            .filter(|job| job.status == JobStatus::Succeeded)
            .map(|job| job.id().to_string())
            .collect()
    }

    /// All records in first-submission order.
    pub fn ordered_jobs(&self) -> Vec<&RuntimeJob> {
        let mut jobs: Vec<&RuntimeJob> = self.jobs.values().collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    /// Ids with `status`, in first-submission order.
    pub fn ids_with_status(&self, status: JobStatus) -> Vec<String> {
        self.ordered_jobs()
            .into_iter()
            .filter(|job| job.status == status)
            .map(|job| job.id().to_string())
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        !self.jobs.values().any(|job| {
            matches!(
                job.status,
                JobStatus::Queued | JobStatus::Blocked | JobStatus::Running
            )
        })
    }
}

/// Whether `job` may leave `blocked`/stay in `queued` at `now`: every
/// dependency has succeeded, the time window is open and any retry backoff has
/// elapsed. A dependency on an unknown id is never satisfied.
pub(super) fn is_eligible(job: &RuntimeJob, succeeded: &HashSet<String>, now: DateTime<Utc>) -> bool {
    let definition = &job.definition;
    if !definition
        .dependencies
        .iter()
        .all(|dependency| succeeded.contains(dependency))
    {
        return false;
    }
    if let Some(window) = &definition.time_window {
        if !window.contains(now) {
            return false;
        }
    }
    job.next_eligible_at.is_none_or(|at| now >= at)
}

/// Side effects collected while the state lock is held and released after it
/// is dropped.
#[derive(Debug, Default)]
pub(super) struct Effects {
    pub lifecycle: Vec<LifecycleEvent>,
    pub events: Vec<JobEvent>,
    pub persist: bool,
}

impl Effects {
    /// Move `job` to `next`, recording the state change for hooks.
    pub fn transition(&mut self, job: &mut RuntimeJob, next: JobStatus) {
        let prev = job.status;
        job.status = next;
        debug!(job_id = %job.id(), from = %prev, to = %next, "Job transition");
        self.lifecycle.push(LifecycleEvent::StateChange {
            job: job.clone(),
            prev,
            next,
        });
    }

    pub fn lifecycle(&mut self, event: LifecycleEvent) {
        self.lifecycle.push(event);
    }

    pub fn metric(
        &mut self,
        job: &RuntimeJob,
        event_type: JobEventType,
        processing_time: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        self.events.push(JobEvent {
            job_id: job.id().to_string(),
            class: job.class().to_string(),
            event_type,
            priority: job.priority(),
            attempt: job.attempts,
            processing_time_ms: processing_time.map(|elapsed| elapsed.as_millis() as u64),
            error_message: job.failure_reason.clone(),
            timestamp: now,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.lifecycle.is_empty() && self.events.is_empty() && !self.persist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDefinition, TimeWindow};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_eligibility_requires_succeeded_dependencies() {
        let now = Utc::now();
        let job = RuntimeJob::new(JobDefinition::new("b").depends_on("a"), now);

        assert!(!is_eligible(&job, &HashSet::new(), now));
        assert!(is_eligible(&job, &HashSet::from(["a".to_string()]), now));
    }

    #[test]
    fn test_eligibility_honours_window_and_backoff() {
        let now = Utc::now();
        let mut job = RuntimeJob::new(
            JobDefinition::new("w")
                .with_time_window(TimeWindow::starting_at(now + ChronoDuration::seconds(1))),
            now,
        );
        assert!(!is_eligible(&job, &HashSet::new(), now));
        assert!(is_eligible(&job, &HashSet::new(), now + ChronoDuration::seconds(1)));

        job.definition.time_window = None;
        job.next_eligible_at = Some(now + ChronoDuration::milliseconds(500));
        assert!(!is_eligible(&job, &HashSet::new(), now));
        assert!(is_eligible(
            &job,
            &HashSet::new(),
            now + ChronoDuration::milliseconds(500)
        ));
    }

    #[test]
    fn test_transition_records_state_change() {
        let mut effects = Effects::default();
        let mut job = RuntimeJob::new(JobDefinition::new("t"), Utc::now());

        effects.transition(&mut job, JobStatus::Held);

        assert_eq!(job.status, JobStatus::Held);
        assert!(matches!(
            effects.lifecycle.as_slice(),
            [LifecycleEvent::StateChange {
                prev: JobStatus::Queued,
                next: JobStatus::Held,
                ..
            }]
        ));
    }

    #[test]
    fn test_sequence_and_token_counters() {
        let mut state = SchedulerState::default();
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
        assert_eq!(state.next_token(), 1);
        assert!(state.is_idle());
    }
}
