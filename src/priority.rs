//! Job priorities and ready-set ordering.
//!
//! Priorities are ordinals from 1 (lowest) to 9 (highest). A job's priority is
//! fixed at submission and changes only through aging (see
//! [`BatchScheduler::age_once`](crate::scheduler::BatchScheduler::age_once)) or an explicit
//! requeue override.
//!
//! ## Ordering
//!
//! Each scheduling cycle sorts the ready set with a [`JobComparator`]. The
//! default, [`default_comparator`], runs higher priorities first and breaks ties
//! by the earlier `enqueue_at`, giving FIFO order within a priority band.

use crate::job::RuntimeJob;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, sync::Arc};
use thiserror::Error;

/// A validated job priority in the range `1..=9`, where 9 runs first.
///
/// # Examples
///
/// ```rust
/// use batchwork::JobPriority;
/// use std::str::FromStr;
///
/// let priority = JobPriority::new(7).unwrap();
/// assert_eq!(priority.get(), 7);
/// assert!(priority > JobPriority::NORMAL);
///
/// assert_eq!(JobPriority::from_str("highest").unwrap(), JobPriority::HIGHEST);
/// assert!(JobPriority::new(0).is_err());
/// assert!(JobPriority::new(10).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct JobPriority(u8);

impl JobPriority {
    /// Priority 1.
    pub const LOWEST: JobPriority = JobPriority(1);
    /// Priority 5, used when a definition does not set one.
    pub const NORMAL: JobPriority = JobPriority(5);
    /// Priority 9. Aging never raises a job above this.
    pub const HIGHEST: JobPriority = JobPriority(9);

    /// Creates a priority, rejecting values outside `1..=9`.
    pub fn new(level: u8) -> Result<Self, PriorityError> {
        if (Self::LOWEST.0..=Self::HIGHEST.0).contains(&level) {
            Ok(JobPriority(level))
        } else {
            Err(PriorityError::OutOfRange(level))
        }
    }

    /// The numeric level.
    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_highest(self) -> bool {
        self == Self::HIGHEST
    }

    /// The next level up, or `None` when already at 9.
    ///
    /// ```rust
    /// use batchwork::JobPriority;
    ///
    /// assert_eq!(JobPriority::new(3).unwrap().boosted(), Some(JobPriority::new(4).unwrap()));
    /// assert_eq!(JobPriority::HIGHEST.boosted(), None);
    /// ```
    pub fn boosted(self) -> Option<Self> {
        if self.is_highest() {
            None
        } else {
            Some(JobPriority(self.0 + 1))
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for JobPriority {
    type Error = PriorityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        JobPriority::new(value)
    }
}

impl From<JobPriority> for u8 {
    fn from(priority: JobPriority) -> Self {
        priority.0
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobPriority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lowest" | "min" => Ok(JobPriority::LOWEST),
            "normal" | "default" => Ok(JobPriority::NORMAL),
            "highest" | "max" => Ok(JobPriority::HIGHEST),
            other => other
                .parse::<u8>()
                .map_err(|_| PriorityError::InvalidPriorityString(s.to_string()))
                .and_then(JobPriority::new),
        }
    }
}

/// Orders two candidates in the ready set; `Less` dispatches first.
pub type JobComparator = Arc<dyn Fn(&RuntimeJob, &RuntimeJob) -> Ordering + Send + Sync>;

/// Higher priority first, then earlier `enqueue_at`.
pub fn default_comparator(a: &RuntimeJob, b: &RuntimeJob) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.enqueue_at.cmp(&b.enqueue_at))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriorityError {
    #[error("Priority {0} is outside the range 1..=9")]
    OutOfRange(u8),

    #[error("Invalid priority string: {0}")]
    InvalidPriorityString(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use chrono::{Duration, Utc};
    use std::str::FromStr;

    fn runtime(id: &str, level: u8, offset_ms: i64) -> RuntimeJob {
        let definition =
            JobDefinition::new(id).with_priority(JobPriority::new(level).unwrap());
        let mut job = RuntimeJob::new(definition, Utc::now());
        job.enqueue_at += Duration::milliseconds(offset_ms);
        job
    }

    #[test]
    fn test_priority_bounds() {
        assert!(JobPriority::new(1).is_ok());
        assert!(JobPriority::new(9).is_ok());
        assert_eq!(JobPriority::new(0), Err(PriorityError::OutOfRange(0)));
        assert_eq!(JobPriority::new(12), Err(PriorityError::OutOfRange(12)));
        assert_eq!(JobPriority::default(), JobPriority::NORMAL);
    }

    #[test]
    fn test_priority_boost_saturates() {
        let mut priority = JobPriority::new(7).unwrap();
        priority = priority.boosted().unwrap();
        priority = priority.boosted().unwrap();
        assert!(priority.is_highest());
        assert_eq!(priority.boosted(), None);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!(JobPriority::from_str("3").unwrap().get(), 3);
        assert_eq!(JobPriority::from_str(" Normal ").unwrap(), JobPriority::NORMAL);
        assert_eq!(JobPriority::from_str("max").unwrap(), JobPriority::HIGHEST);
        assert!(matches!(
            JobPriority::from_str("urgent"),
            Err(PriorityError::InvalidPriorityString(_))
        ));
        assert!(matches!(
            JobPriority::from_str("0"),
            Err(PriorityError::OutOfRange(0))
        ));
    }

    #[test]
    fn test_priority_serde_validates() {
        let priority: JobPriority = serde_json::from_str("8").unwrap();
        assert_eq!(priority.get(), 8);
        assert_eq!(serde_json::to_string(&priority).unwrap(), "8");
        assert!(serde_json::from_str::<JobPriority>("11").is_err());
    }

    #[test]
    fn test_default_comparator_orders_by_priority_then_fifo() {
        let older_low = runtime("older-low", 2, 0);
        let high = runtime("high", 8, 10);
        let newer_low = runtime("newer-low", 2, 20);

        let mut ready = vec![newer_low.clone(), older_low.clone(), high.clone()];
        ready.sort_by(default_comparator);

        let order: Vec<&str> = ready.iter().map(|job| job.id()).collect();
        assert_eq!(order, vec!["high", "older-low", "newer-low"]);
    }
}
