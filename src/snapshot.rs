use crate::job::{JobStatus, RuntimeJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-class occupancy in a [`BatchSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub running: usize,
    pub queued: usize,
    /// `None` when only the global cap applies.
    pub concurrency_limit: Option<usize>,
}

/// Point-in-time view of the job table, bucketed by status.
///
/// Each bucket lists jobs in first-submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queued: Vec<RuntimeJob>,
    pub blocked: Vec<RuntimeJob>,
    pub held: Vec<RuntimeJob>,
    pub running: Vec<RuntimeJob>,
    pub succeeded: Vec<RuntimeJob>,
    pub failed: Vec<RuntimeJob>,
    pub cancelled: Vec<RuntimeJob>,
    pub per_class: BTreeMap<String, ClassCounts>,
}

impl BatchSnapshot {
    /// Bucket `jobs`, which must already be in display order.
    pub fn from_jobs<'a>(
        timestamp: DateTime<Utc>,
        jobs: impl IntoIterator<Item = &'a RuntimeJob>,
        limits: &BTreeMap<String, usize>,
    ) -> Self {
        let mut snapshot = BatchSnapshot {
            timestamp,
            ..Default::default()
        };

        for (class, limit) in limits {
            snapshot.per_class.insert(
                class.clone(),
                ClassCounts {
                    concurrency_limit: Some(*limit),
                    ..Default::default()
                },
            );
        }

        for job in jobs {
            let counts = snapshot
                .per_class
                .entry(job.class().to_string())
                .or_insert_with(|| ClassCounts {
                    concurrency_limit: limits.get(job.class()).copied(),
                    ..Default::default()
                });
            match job.status {
                JobStatus::Running => counts.running += 1,
                JobStatus::Queued => counts.queued += 1,
                _ => {}
            }
            snapshot.bucket_mut(job.status).push(job.clone());
        }

        snapshot
    }

    pub fn bucket(&self, status: JobStatus) -> &[RuntimeJob] {
        match status {
            JobStatus::Queued => &self.queued,
            JobStatus::Blocked => &self.blocked,
            JobStatus::Held => &self.held,
            JobStatus::Running => &self.running,
            JobStatus::Succeeded => &self.succeeded,
            JobStatus::Failed => &self.failed,
            JobStatus::Cancelled => &self.cancelled,
        }
    }

    fn bucket_mut(&mut self, status: JobStatus) -> &mut Vec<RuntimeJob> {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Blocked => &mut self.blocked,
            JobStatus::Held => &mut self.held,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    /// Ids in one bucket.
    pub fn ids(&self, status: JobStatus) -> Vec<&str> {
        self.bucket(status).iter().map(|job| job.id()).collect()
    }

    /// Status of `id`, if it is in the table.
    pub fn status_of(&self, id: &str) -> Option<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .find(|status| self.bucket(*status).iter().any(|job| job.id() == id))
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL
            .into_iter()
            .map(|status| self.bucket(status).len())
            .sum()
    }

    /// Nothing queued, blocked or running.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.blocked.is_empty() && self.running.is_empty()
    }
}

/// Outcome of one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResult {
    /// Jobs dispatched this cycle, in dispatch order.
    pub started: Vec<String>,
    /// Ready jobs held back by the global cap, a class cap or a resource lease.
    pub waiting: Vec<String>,
    /// Jobs left blocked on dependencies, a time window or retry backoff.
    pub blocked: Vec<String>,
}

impl ScheduleResult {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.waiting.is_empty() && self.blocked.is_empty()
    }
}
