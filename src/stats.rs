use crate::{metrics::SchedulerMetrics, priority::JobPriority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

/// A lifecycle event emitted by the scheduler at a transition point.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub class: String,
    pub event_type: JobEventType,
    pub priority: JobPriority,
    /// The attempt this event belongs to, starting at 1.
    pub attempt: u32,
    /// Wall time of the attempt, for `Succeeded`, `Failed` and `Retried`.
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Started,
    Succeeded,
    /// The attempt failed and the job was scheduled for another one.
    Retried,
    /// The attempt failed and retries are exhausted.
    Failed,
}

/// Aggregated counters for one job class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    pub class: String,
    pub started: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    /// Failed or retried attempts that hit the attempt timeout.
    pub timed_out: u64,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    /// `(retried + failed) / finished attempts`
    pub error_rate: f64,
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
        }
    }
}

/// Keeps scheduler events in memory and derives per-class statistics on read.
///
/// ```rust
/// use batchwork::stats::InMemoryStatsCollector;
///
/// let stats = InMemoryStatsCollector::new_default();
/// assert_eq!(stats.class_statistics("default").started, 0);
/// ```
#[derive(Debug)]
pub struct InMemoryStatsCollector {
    events: RwLock<Vec<JobEvent>>,
    config: StatsConfig,
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn new_default() -> Self {
        Self::new(StatsConfig::default())
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events for one job, oldest first.
    pub fn events_for(&self, job_id: &str) -> Vec<JobEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn class_statistics(&self, class: &str) -> ClassStatistics {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let class_events: Vec<&JobEvent> =
            events.iter().filter(|event| event.class == class).collect();
        calculate_statistics(class, &class_events)
    }

    /// Statistics for every class that has emitted an event, sorted by class.
    pub fn all_statistics(&self) -> Vec<ClassStatistics> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_class: BTreeMap<&str, Vec<&JobEvent>> = BTreeMap::new();
        for event in events.iter() {
            by_class.entry(&event.class).or_default().push(event);
        }
        by_class
            .into_iter()
            .map(|(class, events)| calculate_statistics(class, &events))
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new_default()
    }
}

impl SchedulerMetrics for InMemoryStatsCollector {
    fn record_event(&self, event: &JobEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event.clone());

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
    }
}

fn calculate_statistics(class: &str, events: &[&JobEvent]) -> ClassStatistics {
    let count = |kind: JobEventType| events.iter().filter(|e| e.event_type == kind).count() as u64;

    let started = count(JobEventType::Started);
    let succeeded = count(JobEventType::Succeeded);
    let retried = count(JobEventType::Retried);
    let failed = count(JobEventType::Failed);
    let timed_out = events
        .iter()
        .filter(|e| matches!(e.event_type, JobEventType::Retried | JobEventType::Failed))
        .filter(|e| {
            e.error_message
                .as_deref()
                .is_some_and(|message| message.contains("timeout"))
        })
        .count() as u64;

    let processing_times: Vec<u64> = events.iter().filter_map(|e| e.processing_time_ms).collect();
    let (avg_processing_time_ms, min_processing_time_ms, max_processing_time_ms) =
        match (processing_times.iter().min(), processing_times.iter().max()) {
            (Some(&min), Some(&max)) => {
                let sum: u64 = processing_times.iter().sum();
                (sum as f64 / processing_times.len() as f64, min, max)
            }
            _ => (0.0, 0, 0),
        };

    let finished = succeeded + retried + failed;
    let error_rate = if finished > 0 {
        (retried + failed) as f64 / finished as f64
    } else {
        0.0
    };

    ClassStatistics {
        class: class.to_string(),
        started,
        succeeded,
        retried,
        failed,
        timed_out,
        avg_processing_time_ms,
        min_processing_time_ms,
        max_processing_time_ms,
        error_rate,
    }
}
