use crate::{BatchworkError, Result, priority::JobPriority, work::JobWork};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

pub type JobId = String;

/// Class assigned to jobs that do not name one.
pub const DEFAULT_CLASS: &str = "default";

/// Lifecycle status of a job.
///
/// ```text
/// submit ──> queued <──> blocked
///              │  ^         │
///        hold  v  │ release │ hold
///             held <────────┘
///
/// queued ──dispatch──> running ──ok──> succeeded
///    ^                    │
///    └──retry (budget)────┤
///                         └──exhausted──> failed
///
/// any non-terminal ──cancel──> cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Blocked,
    Held,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Blocked,
        JobStatus::Held,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// `succeeded`, `failed` and `cancelled` are terminal. A terminal record only
    /// changes by being replaced through requeue.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Blocked => "blocked",
            JobStatus::Held => "held",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock bounds a job may run inside. A missing bound is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn ending_at(end: DateTime<Utc>) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    /// Both bounds are inclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if self.start.is_some_and(|start| now < start) {
            return false;
        }
        if self.end.is_some_and(|end| now > end) {
            return false;
        }
        true
    }
}

/// Opaque job data plus an optional work action.
///
/// The work action is not serialized; a job restored from a snapshot runs the
/// scheduler's default work unless it is requeued with a new one.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(skip)]
    pub work: Option<Arc<dyn JobWork>>,
}

impl JobPayload {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, work: None }
    }

    pub fn with_work(mut self, work: Arc<dyn JobWork>) -> Self {
        self.work = Some(work);
        self
    }
}

impl fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPayload")
            .field("data", &self.data)
            .field("work", &self.work.as_ref().map(|_| "<work>"))
            .finish()
    }
}

fn default_class() -> String {
    DEFAULT_CLASS.to_string()
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

/// A caller-supplied job description.
///
/// # Examples
///
/// ```rust
/// use batchwork::{JobDefinition, JobPriority};
/// use std::time::Duration;
///
/// let job = JobDefinition::new("load-orders")
///     .with_priority(JobPriority::new(7).unwrap())
///     .with_class("ingest")
///     .with_max_retries(3)
///     .with_retry_backoff(Duration::from_millis(250))
///     .depends_on("fetch-orders")
///     .with_resource_tag("warehouse-db");
///
/// assert_eq!(job.class, "ingest");
/// assert_eq!(job.dependencies, vec!["fetch-orders".to_string()]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default)]
    pub max_retries: u32,
    /// Base of the exponential retry curve.
    #[serde(default = "default_retry_backoff", with = "duration_millis")]
    pub retry_backoff: Duration,
    /// Falls back to the scheduler's default when unset.
    #[serde(default, with = "option_duration_millis")]
    pub attempt_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub resource_tags: Vec<String>,
    /// How long the job must sit in `queued` before aging raises its priority.
    #[serde(default, with = "option_duration_millis")]
    pub aging_after: Option<Duration>,
    #[serde(default)]
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl JobDefinition {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            priority: JobPriority::default(),
            class: default_class(),
            max_retries: 0,
            retry_backoff: default_retry_backoff(),
            attempt_timeout: None,
            time_window: None,
            dependencies: Vec::new(),
            resource_tags: Vec::new(),
            aging_after: None,
            payload: JobPayload::default(),
            created_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn depends_on(mut self, id: impl Into<JobId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_resource_tag(mut self, tag: impl Into<String>) -> Self {
        self.resource_tags.push(tag.into());
        self
    }

    pub fn with_aging(mut self, after: Duration) -> Self {
        self.aging_after = Some(after);
        self
    }

    pub fn with_payload(mut self, data: serde_json::Value) -> Self {
        self.payload.data = data;
        self
    }

    pub fn with_work(mut self, work: Arc<dyn JobWork>) -> Self {
        self.payload.work = Some(work);
        self
    }

    /// Aging threshold, if aging is enabled for this job.
    pub fn aging_threshold(&self) -> Option<Duration> {
        self.aging_after.filter(|after| !after.is_zero())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BatchworkError::InvalidDefinition {
                message: "job id must not be empty".to_string(),
            });
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(BatchworkError::InvalidDefinition {
                message: format!("job {} depends on itself", self.id),
            });
        }
        if self.class.trim().is_empty() {
            return Err(BatchworkError::InvalidDefinition {
                message: format!("job {} has an empty class", self.id),
            });
        }
        Ok(())
    }
}

/// The scheduler-owned runtime record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeJob {
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub attempts: u32,
    pub enqueue_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_eligible_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// First-submission order, used to list snapshot buckets stably.
    #[serde(skip)]
    pub(crate) sequence: u64,
    /// Token of the dispatch currently executing this job.
    #[serde(skip)]
    pub(crate) dispatch: Option<u64>,
}

impl RuntimeJob {
    /// A fresh `queued` record with no attempts.
    pub fn new(definition: JobDefinition, now: DateTime<Utc>) -> Self {
        Self {
            definition,
            status: JobStatus::Queued,
            attempts: 0,
            enqueue_at: now,
            started_at: None,
            finished_at: None,
            next_eligible_at: None,
            failure_reason: None,
            sequence: 0,
            dispatch: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn class(&self) -> &str {
        &self.definition.class
    }

    pub fn priority(&self) -> JobPriority {
        self.definition.priority
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time between the start of the latest attempt and `finished_at`.
    pub fn run_duration(&self) -> Option<Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }
}

/// Definition fields replaced when a terminal job is requeued. Unset fields
/// keep the previous definition's value; the id never changes.
///
/// ```rust
/// use batchwork::{JobDefinition, JobOverrides, JobPriority};
///
/// let previous = JobDefinition::new("report").with_max_retries(1);
/// let next = JobOverrides::new()
///     .with_priority(JobPriority::HIGHEST)
///     .apply(previous);
///
/// assert_eq!(next.id, "report");
/// assert_eq!(next.priority, JobPriority::HIGHEST);
/// assert_eq!(next.max_retries, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobOverrides {
    pub description: Option<String>,
    pub priority: Option<JobPriority>,
    pub class: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    pub time_window: Option<TimeWindow>,
    pub dependencies: Option<Vec<JobId>>,
    pub resource_tags: Option<Vec<String>>,
    pub aging_after: Option<Duration>,
    pub payload: Option<JobPayload>,
}

impl JobOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<JobId>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn with_resource_tags(mut self, tags: Vec<String>) -> Self {
        self.resource_tags = Some(tags);
        self
    }

    pub fn with_aging(mut self, after: Duration) -> Self {
        self.aging_after = Some(after);
        self
    }

    pub fn with_work(mut self, work: Arc<dyn JobWork>) -> Self {
        let mut payload = self.payload.take().unwrap_or_default();
        payload.work = Some(work);
        self.payload = Some(payload);
        self
    }

    /// Merge into `previous`, producing the definition of the fresh record.
    pub fn apply(self, previous: JobDefinition) -> JobDefinition {
        JobDefinition {
            id: previous.id,
            description: self.description.or(previous.description),
            priority: self.priority.unwrap_or(previous.priority),
            class: self.class.unwrap_or(previous.class),
            max_retries: self.max_retries.unwrap_or(previous.max_retries),
            retry_backoff: self.retry_backoff.unwrap_or(previous.retry_backoff),
            attempt_timeout: self.attempt_timeout.or(previous.attempt_timeout),
            time_window: self.time_window.or(previous.time_window),
            dependencies: self.dependencies.unwrap_or(previous.dependencies),
            resource_tags: self.resource_tags.unwrap_or(previous.resource_tags),
            aging_after: self.aging_after.or(previous.aging_after),
            payload: self.payload.unwrap_or(previous.payload),
            created_at: previous.created_at,
        }
    }
}

/// Serializes `Duration` as whole milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::work_fn;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<JobStatus> = JobStatus::ALL
            .into_iter()
            .filter(|status| status.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![JobStatus::Succeeded, JobStatus::Failed, JobStatus::Cancelled]
        );
        assert_eq!(JobStatus::Blocked.to_string(), "blocked");
    }

    #[test]
    fn test_time_window_bounds() {
        let now = Utc::now();
        let window = TimeWindow::between(now, now + ChronoDuration::seconds(10));

        assert!(!window.contains(now - ChronoDuration::milliseconds(1)));
        assert!(window.contains(now));
        assert!(window.contains(now + ChronoDuration::seconds(10)));
        assert!(!window.contains(now + ChronoDuration::seconds(11)));

        assert!(TimeWindow::default().contains(now));
        assert!(TimeWindow::starting_at(now).contains(now + ChronoDuration::days(365)));
        assert!(!TimeWindow::ending_at(now).contains(now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_definition_defaults_and_validation() {
        let definition = JobDefinition::new("nightly");
        assert_eq!(definition.class, DEFAULT_CLASS);
        assert_eq!(definition.priority, JobPriority::NORMAL);
        assert_eq!(definition.retry_backoff, Duration::from_secs(1));
        assert!(definition.validate().is_ok());

        assert!(JobDefinition::new("  ").validate().is_err());
        assert!(JobDefinition::new("loop").depends_on("loop").validate().is_err());
        assert!(JobDefinition::new("x").with_class("").validate().is_err());
    }

    #[test]
    fn test_aging_threshold_ignores_zero() {
        assert_eq!(JobDefinition::new("a").aging_threshold(), None);
        assert_eq!(
            JobDefinition::new("a")
                .with_aging(Duration::ZERO)
                .aging_threshold(),
            None
        );
        assert_eq!(
            JobDefinition::new("a")
                .with_aging(Duration::from_secs(3))
                .aging_threshold(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_runtime_job_serialization_skips_work() {
        let work = work_fn(|_job| async { Ok(()) });
        let definition = JobDefinition::new("export")
            .with_payload(json!({"table": "orders"}))
            .with_work(work)
            .with_attempt_timeout(Duration::from_millis(1500))
            .with_time_window(TimeWindow::starting_at(Utc::now()));
        let job = RuntimeJob::new(definition, Utc::now());

        let encoded = serde_json::to_string(&job).unwrap();
        assert!(encoded.contains("\"attempt_timeout\":1500"));
        assert!(encoded.contains("\"status\":\"queued\""));

        let decoded: RuntimeJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id(), "export");
        assert_eq!(decoded.definition.payload.data, json!({"table": "orders"}));
        assert!(decoded.definition.payload.work.is_none());
        assert_eq!(
            decoded.definition.attempt_timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let definition: JobDefinition = serde_json::from_value(json!({"id": "bare"})).unwrap();
        assert_eq!(definition.class, DEFAULT_CLASS);
        assert_eq!(definition.priority, JobPriority::NORMAL);
        assert_eq!(definition.retry_backoff, Duration::from_secs(1));
        assert!(definition.dependencies.is_empty());
    }

    #[test]
    fn test_overrides_keep_id_and_unset_fields() {
        let previous = JobDefinition::new("sync")
            .with_class("etl")
            .with_max_retries(2)
            .depends_on("extract");

        let next = JobOverrides::new()
            .with_max_retries(5)
            .with_dependencies(Vec::new())
            .apply(previous);

        assert_eq!(next.id, "sync");
        assert_eq!(next.class, "etl");
        assert_eq!(next.max_retries, 5);
        assert!(next.dependencies.is_empty());
    }

    #[test]
    fn test_run_duration() {
        let now = Utc::now();
        let mut job = RuntimeJob::new(JobDefinition::new("timed"), now);
        assert_eq!(job.run_duration(), None);

        job.started_at = Some(now);
        job.finished_at = Some(now + ChronoDuration::milliseconds(1250));
        assert_eq!(job.run_duration(), Some(Duration::from_millis(1250)));
    }
}
