//! # Batchwork
//!
//! An in-process batch job scheduler for Tokio applications.
//!
//! ## Features
//!
//! - **Priorities**: integer levels 1 (lowest) to 9 (highest) with a pluggable ready-set comparator
//! - **Dependencies**: a job waits until every job it depends on has succeeded
//! - **Time windows**: jobs only start inside an optional `[start, end]` window
//! - **Concurrency caps**: a global limit plus optional per-class limits
//! - **Resource tags**: jobs sharing a leased tag never start while the lease is held
//! - **Retries**: bounded attempts with exponential, jittered backoff and per-attempt timeouts
//! - **Priority aging**: starving queued jobs are boosted one level at a time
//! - **Crash recovery**: the job table is snapshotted to disk and reloaded on start
//! - **Monitoring**: lifecycle hooks, structured `tracing` logs and Prometheus metrics (enabled by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchwork::{BatchScheduler, JobDefinition, JobPriority, SchedulerConfig, work::work_fn};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = SchedulerConfig::default()
//!         .with_max_concurrent(2)
//!         .with_class_limit("export", 1)
//!         .with_snapshot_path("./batchwork-state.json");
//!
//!     let scheduler = BatchScheduler::builder(config)
//!         .with_default_work(work_fn(|job| async move {
//!             println!("processing {} with {}", job.id(), job.definition.payload.data);
//!             Ok(())
//!         }))
//!         .build()?;
//!     scheduler.wait_until_recovered().await;
//!
//!     scheduler.submit(
//!         JobDefinition::new("extract")
//!             .with_priority(JobPriority::HIGHEST)
//!             .with_payload(json!({"table": "orders"})),
//!     )?;
//!     scheduler.submit(
//!         JobDefinition::new("export")
//!             .with_class("export")
//!             .depends_on("extract")
//!             .with_max_retries(3)
//!             .with_resource_tag("warehouse"),
//!     )?;
//!
//!     scheduler.wait_for_idle(Duration::from_secs(30)).await;
//!     println!("{} jobs succeeded", scheduler.snapshot().succeeded.len());
//!
//!     scheduler.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`JobDefinition`] describes what to run: a caller-chosen id, a priority, a
//! concurrency class, a retry budget, dependencies, resource tags and a payload.
//! The scheduler wraps it in a [`RuntimeJob`] that tracks status, attempts and
//! timing. Statuses move through `queued`, `blocked`, `held`, `running` and the
//! terminal `succeeded`, `failed` and `cancelled`; see [`JobStatus`].
//!
//! ### Work
//!
//! What an attempt actually does is a [`JobWork`] implementation, either
//! attached to the payload of a single job or installed as the scheduler's
//! default. [`work_fn`] adapts an async closure.
//!
//! ### Control
//!
//! Jobs can be held, released, cancelled and, once terminal, requeued under the
//! same id with [`JobOverrides`]. [`BatchScheduler::snapshot`] returns a
//! point-in-time [`BatchSnapshot`] bucketed by status.
//!
//! ## Feature Flags
//!
//! - `metrics` (default): Prometheus counters and histograms with an optional
//!   `/metrics` exposition server

pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod persistence;
pub mod priority;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod stats;
pub mod telemetry;
pub mod work;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{LoggingConfig, SchedulerConfig};
pub use error::BatchworkError;
pub use hooks::{HookSet, JobHooks, NoopHooks};
pub use job::{
    DEFAULT_CLASS, JobDefinition, JobId, JobOverrides, JobPayload, JobStatus, RuntimeJob,
    TimeWindow,
};
pub use lock::{Lease, LeaseStatus, LockAuthority, LockManager};
pub use metrics::{MetricsConfig, NoopMetrics, PrometheusMetricsCollector, SchedulerMetrics};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use priority::{JobComparator, JobPriority, PriorityError, default_comparator};
pub use retry::{JitterType, RetryStrategy};
pub use scheduler::{
    ATTEMPT_TIMEOUT_REASON, BatchScheduler, DEFAULT_CANCEL_REASON, SchedulerBuilder,
};
pub use snapshot::{BatchSnapshot, ClassCounts, ScheduleResult};
pub use stats::{ClassStatistics, InMemoryStatsCollector, JobEvent, JobEventType, StatsConfig};
pub use work::{JobWork, PlaceholderWork, work_fn};

/// Convenient type alias for Results with [`BatchworkError`] as the error type.
///
/// This is used throughout the crate for consistent error handling.
pub type Result<T> = std::result::Result<T, BatchworkError>;
