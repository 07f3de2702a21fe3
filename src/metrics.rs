use crate::{Result, stats::JobEvent};
use std::{collections::HashMap, net::SocketAddr};

#[cfg(feature = "metrics")]
use crate::{error::BatchworkError, stats::JobEventType};

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, HistogramVec, Registry, TextEncoder};

#[cfg(feature = "metrics")]
use warp::Filter;

/// Receives lifecycle events at the scheduler's transition points.
///
/// Called synchronously after the scheduler releases its state lock, so an
/// implementation must not block.
pub trait SchedulerMetrics: Send + Sync {
    fn record_event(&self, event: &JobEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SchedulerMetrics for NoopMetrics {
    fn record_event(&self, _event: &JobEvent) {}
}

/// Configuration for metrics collection
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP server address for metrics exposition
    pub exposition_addr: Option<SocketAddr>,
    /// Constant labels attached to every metric
    pub custom_labels: HashMap<String, String>,
    /// Whether to observe attempt durations
    pub collect_histograms: bool,
    /// Histogram buckets in seconds
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            exposition_addr: None,
            custom_labels: HashMap::new(),
            collect_histograms: true,
            duration_buckets: vec![
                0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
            ],
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `/metrics` on `addr` once the exposition server is started
    pub fn with_prometheus_exporter(mut self, addr: SocketAddr) -> Self {
        self.exposition_addr = Some(addr);
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }

    pub fn with_duration_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.duration_buckets = buckets;
        self
    }

    pub fn without_histograms(mut self) -> Self {
        self.collect_histograms = false;
        self
    }
}

/// Prometheus counters and a duration histogram, all labeled by job class.
///
/// | Metric | Kind |
/// |---|---|
/// | `batch_jobs_started_total` | counter |
/// | `batch_jobs_succeeded_total` | counter |
/// | `batch_jobs_failed_total` | counter |
/// | `batch_jobs_retried_total` | counter |
/// | `batch_job_duration_seconds` | histogram |
#[cfg(feature = "metrics")]
pub struct PrometheusMetricsCollector {
    config: MetricsConfig,
    registry: Registry,
    jobs_started: CounterVec,
    jobs_succeeded: CounterVec,
    jobs_failed: CounterVec,
    jobs_retried: CounterVec,
    job_duration: HistogramVec,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

#[cfg(feature = "metrics")]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let labels = (!config.custom_labels.is_empty()).then(|| config.custom_labels.clone());
        let registry =
            Registry::new_custom(None, labels).map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to create registry: {}", e),
            })?;

        let jobs_started = counter(&registry, "batch_jobs_started_total", "Jobs dispatched")?;
        let jobs_succeeded = counter(
            &registry,
            "batch_jobs_succeeded_total",
            "Jobs whose work action completed",
        )?;
        let jobs_failed = counter(
            &registry,
            "batch_jobs_failed_total",
            "Jobs that failed permanently",
        )?;
        let jobs_retried = counter(
            &registry,
            "batch_jobs_retried_total",
            "Failed attempts scheduled for retry",
        )?;

        let job_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "batch_job_duration_seconds",
                "Attempt duration in seconds at success or failure",
            )
            .buckets(config.duration_buckets.clone()),
            &["class"],
        )
        .map_err(|e| BatchworkError::Metrics {
            message: format!("Failed to create batch_job_duration_seconds metric: {}", e),
        })?;
        registry
            .register(Box::new(job_duration.clone()))
            .map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to register batch_job_duration_seconds: {}", e),
            })?;

        Ok(Self {
            config,
            registry,
            jobs_started,
            jobs_succeeded,
            jobs_failed,
            jobs_retried,
            job_duration,
            server_handle: None,
        })
    }

    /// Start the Prometheus HTTP exposition server, if an address is configured.
    pub async fn start_exposition_server(&mut self) -> Result<()> {
        if let Some(addr) = self.config.exposition_addr {
            let registry = self.registry.clone();
            let handle = tokio::spawn(async move {
                let app = warp::path("metrics")
                    .map(move || encode(&registry).unwrap_or_else(|e| format!("# {}\n", e)))
                    .with(warp::reply::with::header("content-type", "text/plain"));

                warp::serve(app).run(addr).await;
            });
            tracing::info!(%addr, "Metrics exposition server started");

            self.server_handle = Some(handle);
        }

        Ok(())
    }

    /// Get metrics as Prometheus text format
    pub fn get_metrics_text(&self) -> Result<String> {
        encode(&self.registry)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(feature = "metrics")]
impl SchedulerMetrics for PrometheusMetricsCollector {
    fn record_event(&self, event: &JobEvent) {
        let class = [event.class.as_str()];
        match event.event_type {
            JobEventType::Started => self.jobs_started.with_label_values(&class).inc(),
            JobEventType::Succeeded => self.jobs_succeeded.with_label_values(&class).inc(),
            JobEventType::Failed => self.jobs_failed.with_label_values(&class).inc(),
            JobEventType::Retried => self.jobs_retried.with_label_values(&class).inc(),
        }

        if self.config.collect_histograms && event.event_type != JobEventType::Started {
            if let Some(duration_ms) = event.processing_time_ms {
                self.job_duration
                    .with_label_values(&class)
                    .observe(duration_ms as f64 / 1000.0);
            }
        }
    }
}

#[cfg(feature = "metrics")]
impl Drop for PrometheusMetricsCollector {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<CounterVec> {
    let counter = CounterVec::new(prometheus::Opts::new(name, help), &["class"]).map_err(|e| {
        BatchworkError::Metrics {
            message: format!("Failed to create {} metric: {}", name, e),
        }
    })?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| BatchworkError::Metrics {
            message: format!("Failed to register {} with registry: {}", name, e),
        })?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| BatchworkError::Metrics {
            message: format!("Failed to encode metrics: {}", e),
        })?;

    String::from_utf8(buffer).map_err(|e| BatchworkError::Metrics {
        message: format!("Failed to convert metrics to string: {}", e),
    })
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct PrometheusMetricsCollector {
    _config: MetricsConfig,
}

#[cfg(not(feature = "metrics"))]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        Ok(Self { _config: config })
    }

    pub async fn start_exposition_server(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn get_metrics_text(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}

#[cfg(not(feature = "metrics"))]
impl SchedulerMetrics for PrometheusMetricsCollector {
    fn record_event(&self, _event: &JobEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{priority::JobPriority, stats::JobEventType};

    fn event(event_type: JobEventType, processing_time_ms: Option<u64>) -> JobEvent {
        JobEvent {
            job_id: "nightly-export".to_string(),
            class: "etl".to_string(),
            event_type,
            priority: JobPriority::NORMAL,
            attempt: 1,
            processing_time_ms,
            error_message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_metrics_config_creation() {
        let config = MetricsConfig::new()
            .with_prometheus_exporter("127.0.0.1:9090".parse().unwrap())
            .with_duration_buckets(vec![0.1, 1.0])
            .without_histograms();

        assert!(config.exposition_addr.is_some());
        assert_eq!(config.duration_buckets, vec![0.1, 1.0]);
        assert!(!config.collect_histograms);
    }

    #[test]
    fn test_noop_metrics_accepts_events() {
        NoopMetrics.record_event(&event(JobEventType::Started, None));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_recording() {
        let collector = PrometheusMetricsCollector::new(MetricsConfig::new()).unwrap();

        collector.record_event(&event(JobEventType::Started, None));
        collector.record_event(&event(JobEventType::Retried, Some(120)));
        collector.record_event(&event(JobEventType::Started, None));
        collector.record_event(&event(JobEventType::Succeeded, Some(1500)));

        let text = collector.get_metrics_text().unwrap();
        assert!(text.contains("batch_jobs_started_total{class=\"etl\"} 2"));
        assert!(text.contains("batch_jobs_retried_total{class=\"etl\"} 1"));
        assert!(text.contains("batch_jobs_succeeded_total{class=\"etl\"} 1"));
        assert!(text.contains("batch_job_duration_seconds_count{class=\"etl\"} 2"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_custom_labels_are_attached() {
        let mut labels = HashMap::new();
        labels.insert("service".to_string(), "reports".to_string());
        let collector =
            PrometheusMetricsCollector::new(MetricsConfig::new().with_labels(labels)).unwrap();

        collector.record_event(&event(JobEventType::Failed, Some(10)));
        let text = collector.get_metrics_text().unwrap();
        assert!(text.contains("service=\"reports\""));
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_noop_collector() {
        let collector = PrometheusMetricsCollector::new(MetricsConfig::new()).unwrap();
        collector.record_event(&event(JobEventType::Failed, Some(10)));
        assert!(collector.get_metrics_text().unwrap().contains("disabled"));
    }
}
