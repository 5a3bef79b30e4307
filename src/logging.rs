//! Tracing subscriber setup for the binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

/// Install the global subscriber. Call once at startup.
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
            key: "logging.filter".to_string(),
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
    Ok(())
}
