//! Configuration for the batch scheduler.
//!
//! A [`SchedulerConfig`] can be built in code, loaded from TOML, or read from
//! `BATCHWORK_*` environment variables. Durations are written human-readably in
//! TOML (`"75ms"`, `"30s"`, `"5m"`, `"1h"`); a bare integer is milliseconds.
//!
//! ```toml
//! max_concurrent = 8
//! tick_interval = "50ms"
//! aging_interval = "10s"
//! default_attempt_timeout = "2m"
//! snapshot_path = "/var/lib/batchwork/jobs.json"
//!
//! [max_per_class]
//! ingest = 2
//! report = 1
//!
//! [logging]
//! level = "debug"
//! json_format = true
//! ```

use crate::{BatchworkError, Result, retry::RetryStrategy};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

/// Serializes `Duration` as strings like "75ms", "30s", "5m", "1h"
mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Millis(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
            Repr::Text(s) => parse_duration(&s).map_err(D::Error::custom),
        }
    }

    pub fn format_duration(duration: Duration) -> String {
        let ms = duration.as_millis();
        if ms == 0 {
            "0ms".to_string()
        } else if ms % 3_600_000 == 0 {
            format!("{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1000 == 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        }
    }

    /// Parse a duration string like "75ms", "30s", "5m", "1h", "250".
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are milliseconds
        if let Ok(ms) = s.parse::<u64>() {
            return Ok(Duration::from_millis(ms));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration format: {}", s))?;
        let (num_str, suffix) = s.split_at(split);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        let unit_ms: u64 = match suffix.trim() {
            "ms" => 1,
            "s" => 1000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    other
                ));
            }
        };
        num.checked_mul(unit_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    }
}

pub use duration_human::{format_duration, parse_duration};

/// Scheduler configuration.
///
/// # Examples
///
/// ```rust
/// use batchwork::config::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig::new()
///     .with_max_concurrent(8)
///     .with_class_limit("ingest", 2)
///     .with_tick_interval(Duration::from_millis(50));
///
/// assert_eq!(config.max_concurrent, 8);
/// assert_eq!(config.class_limit("ingest"), Some(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global cap on running jobs
    pub max_concurrent: usize,

    /// Per-class caps on running jobs; classes not listed are only bound by
    /// the global cap
    pub max_per_class: BTreeMap<String, usize>,

    /// Period of the dispatch loop
    #[serde(with = "duration_human")]
    pub tick_interval: Duration,

    /// Period of the priority aging pass
    #[serde(with = "duration_human")]
    pub aging_interval: Duration,

    /// Attempt timeout for jobs that do not set one
    #[serde(with = "duration_human")]
    pub default_attempt_timeout: Duration,

    /// Upper bound on a single retry delay
    #[serde(with = "duration_human")]
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,

    /// Fraction of each retry delay that is randomized
    pub jitter_ratio: f64,

    /// Snapshot file used when no store is injected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_per_class: BTreeMap::new(),
            tick_interval: Duration::from_millis(75),
            aging_interval: Duration::from_secs(30),
            default_attempt_timeout: Duration::from_secs(300),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.5,
            snapshot_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_class_limit(mut self, class: impl Into<String>, limit: usize) -> Self {
        self.max_per_class.insert(class.into(), limit);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_aging_interval(mut self, interval: Duration) -> Self {
        self.aging_interval = interval;
        self
    }

    pub fn with_default_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.default_attempt_timeout = timeout;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn class_limit(&self, class: &str) -> Option<usize> {
        self.max_per_class.get(class).copied()
    }

    /// The retry curve applied to a job whose base backoff is `base`.
    pub fn retry_strategy(&self, base: Duration) -> RetryStrategy {
        RetryStrategy::jittered_exponential(
            base,
            self.backoff_multiplier,
            self.max_backoff,
            self.jitter_ratio,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(BatchworkError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(BatchworkError::Config(
                "tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.aging_interval.is_zero() {
            return Err(BatchworkError::Config(
                "aging_interval must be greater than zero".to_string(),
            ));
        }
        if self.default_attempt_timeout.is_zero() {
            return Err(BatchworkError::Config(
                "default_attempt_timeout must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(BatchworkError::Config(format!(
                "jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(BatchworkError::Config(format!(
                "backoff_multiplier must be at least 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `BATCHWORK_*` environment variables on top of
    /// the defaults. Unparseable values keep the default.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("BATCHWORK_MAX_CONCURRENT") {
            config.max_concurrent = value.parse().unwrap_or(config.max_concurrent);
        }
        if let Some(interval) = env_millis("BATCHWORK_TICK_INTERVAL_MS") {
            config.tick_interval = interval;
        }
        if let Some(interval) = env_millis("BATCHWORK_AGING_INTERVAL_MS") {
            config.aging_interval = interval;
        }
        if let Some(timeout) = env_millis("BATCHWORK_ATTEMPT_TIMEOUT_MS") {
            config.default_attempt_timeout = timeout;
        }
        if let Ok(path) = std::env::var("BATCHWORK_SNAPSHOT_PATH") {
            if !path.is_empty() {
                config.snapshot_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(level) = std::env::var("BATCHWORK_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Short intervals and verbose logging
    pub fn development() -> Self {
        Self {
            max_concurrent: 2,
            tick_interval: Duration::from_millis(50),
            aging_interval: Duration::from_secs(5),
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            max_concurrent: 16,
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to emit structured JSON lines
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.tick_interval, Duration::from_millis(75));
        assert_eq!(config.aging_interval, Duration::from_secs(30));
        assert_eq!(config.default_attempt_timeout, Duration::from_secs(300));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert_eq!(config.jitter_ratio, 0.5);
        assert!(config.snapshot_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(SchedulerConfig::new().with_max_concurrent(0).validate().is_err());
        assert!(
            SchedulerConfig::new()
                .with_tick_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SchedulerConfig::new()
                .with_aging_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(SchedulerConfig::new().with_jitter_ratio(1.5).validate().is_err());
        assert!(SchedulerConfig::new().with_jitter_ratio(-0.1).validate().is_err());
        assert!(
            SchedulerConfig::new()
                .with_backoff_multiplier(0.5)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_development_and_production() {
        let development = SchedulerConfig::development();
        assert_eq!(development.logging.level, "debug");
        assert!(development.validate().is_ok());

        let production = SchedulerConfig::production();
        assert!(production.logging.json_format);
        assert_eq!(production.max_concurrent, 16);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("batchwork.toml");

        let config = SchedulerConfig::new()
            .with_max_concurrent(6)
            .with_class_limit("ingest", 2)
            .with_tick_interval(Duration::from_millis(40))
            .with_default_attempt_timeout(Duration::from_secs(120))
            .with_snapshot_path(dir.path().join("jobs.json"));

        config.save_to_file(&config_path).unwrap();

        let toml_content = std::fs::read_to_string(&config_path).unwrap();
        assert!(toml_content.contains("tick_interval = \"40ms\""));
        assert!(toml_content.contains("aging_interval = \"30s\""));
        assert!(toml_content.contains("default_attempt_timeout = \"2m\""));

        let loaded = SchedulerConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SchedulerConfig = toml::from_str(
            r#"
            max_concurrent = 3
            tick_interval = 120
            aging_interval = "1h"

            [max_per_class]
            report = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.tick_interval, Duration::from_millis(120));
        assert_eq!(config.aging_interval, Duration::from_secs(3600));
        assert_eq!(config.class_limit("report"), Some(1));
        assert_eq!(config.class_limit("other"), None);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("75ms").unwrap(), Duration::from_millis(75));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10w").is_err());

        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }

    #[test]
    fn test_env_config() {
        unsafe {
            std::env::set_var("BATCHWORK_MAX_CONCURRENT", "12");
            std::env::set_var("BATCHWORK_TICK_INTERVAL_MS", "20");
            std::env::set_var("BATCHWORK_ATTEMPT_TIMEOUT_MS", "900");
            std::env::set_var("BATCHWORK_SNAPSHOT_PATH", "/tmp/batchwork-env.json");
            std::env::set_var("BATCHWORK_LOG_LEVEL", "warn");
        }

        let config = SchedulerConfig::from_env().unwrap();

        assert_eq!(config.max_concurrent, 12);
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert_eq!(config.default_attempt_timeout, Duration::from_millis(900));
        assert_eq!(
            config.snapshot_path,
            Some(PathBuf::from("/tmp/batchwork-env.json"))
        );
        assert_eq!(config.logging.level, "warn");

        unsafe {
            std::env::remove_var("BATCHWORK_MAX_CONCURRENT");
            std::env::remove_var("BATCHWORK_TICK_INTERVAL_MS");
            std::env::remove_var("BATCHWORK_ATTEMPT_TIMEOUT_MS");
            std::env::remove_var("BATCHWORK_SNAPSHOT_PATH");
            std::env::remove_var("BATCHWORK_LOG_LEVEL");
        }
    }

    #[test]
    fn test_retry_strategy_uses_config() {
        let config = SchedulerConfig::new()
            .with_max_backoff(Duration::from_secs(5))
            .with_jitter_ratio(0.0);
        let strategy = config.retry_strategy(Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(strategy.calculate_delay(10), Duration::from_secs(5));
    }
}
