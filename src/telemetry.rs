//! Log output for binaries and tests.
//!
//! The library only emits `tracing` events; nothing is printed until a
//! subscriber is installed. [`init_logging`] installs a `fmt` subscriber driven
//! by a [`LoggingConfig`]. `RUST_LOG`, when set, takes precedence over the
//! configured level.

use crate::{BatchworkError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            BatchworkError::Config(format!("Invalid log level {:?}: {}", config.level, e))
        }),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    installed.map_err(|e| BatchworkError::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "batchwork=loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_env_filter(&config),
            Err(BatchworkError::Config(_))
        ));
    }

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
