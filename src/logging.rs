//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::{Result, TapedeckError};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `cli_level_override`, which takes
/// precedence over the configured level.
///
/// # Errors
///
/// Returns error if a filter directive is invalid or a subscriber is already set
pub fn init(config: &LoggingConfig, cli_level_override: Option<&str>) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = resolve_filter(env.as_deref(), config, cli_level_override)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    }
    .map_err(|e| TapedeckError::Config(format!("Failed to initialize logging: {e}")))
}

fn resolve_filter(
    env: Option<&str>,
    config: &LoggingConfig,
    cli_level_override: Option<&str>,
) -> Result<EnvFilter> {
    let directive = env
        .filter(|value| !value.trim().is_empty())
        .or(cli_level_override)
        .or(config.level.as_deref())
        .unwrap_or(DEFAULT_LOG_LEVEL);

    EnvFilter::try_new(directive.trim())
        .map_err(|e| TapedeckError::Config(format!("Invalid log filter '{directive}': {e}")))
}
