//! Tracing subscriber setup.

use crate::config::Settings;
use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(settings: &Settings) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.application.log_level)
            .map_err(|e| ConfigError::invalid("application.log_level", e.to_string())),
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays clean for
/// JSON output.
pub fn init_from_config(settings: &Settings) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(settings)?)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
