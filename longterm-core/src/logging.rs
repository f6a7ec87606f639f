use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::config::CoreConfig;
use crate::errors::{CoreError, Result};

const DEFAULT_LEVEL: &str = "info";

fn subscriber(level: &str, with_target: bool) -> SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format,
    EnvFilter,
> {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(with_target)
        .with_ansi(atty::is(atty::Stream::Stdout))
}

/// Installs the global subscriber at `level` (default `info`).
pub fn init_tracing(level: Option<&str>) -> Result<()> {
    subscriber(level.unwrap_or(DEFAULT_LEVEL), true)
        .try_init()
        .map_err(|err| CoreError::Logging(err.to_string()))
}

/// Installs the global subscriber from loaded configuration.
///
/// Targets are omitted in production to keep lines short.
pub fn init_from_config(config: &CoreConfig) -> Result<()> {
    subscriber(&config.log_level, !config.is_production())
        .try_init()
        .map_err(|err| CoreError::Logging(err.to_string()))
}

/// Same as [`init_tracing`] but tolerates a subscriber that is already installed.
///
/// Test binaries call this from many tests; only the first call wins.
pub fn try_init_tracing(level: Option<&str>) {
    if let Err(err) = init_tracing(level) {
        tracing::debug!(%err, "tracing subscriber already installed");
    }
}
