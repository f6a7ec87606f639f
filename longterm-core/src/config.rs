use std::env;
use std::time::Duration;

use chrono::FixedOffset;

use crate::errors::{ConfigError, CoreError};

const DEFAULT_PREFIX: &str = "LONGTERM_";
const DEFAULT_MUTATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Time zone used to cut the calendar into quarters.
///
/// Every quantization in a process must use the same zone, so the setting is
/// read once and handed to the clock explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZoneSetting {
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl ZoneSetting {
    /// Parses `local`, `utc` or a signed `HH:MM` offset such as `+02:00`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "local" | "" => return Some(ZoneSetting::Local),
            "utc" | "z" => return Some(ZoneSetting::Utc),
            _ => {}
        }

        let (sign, rest) = match trimmed.as_bytes().first()? {
            b'+' => (1, &trimmed[1..]),
            b'-' => (-1, &trimmed[1..]),
            _ => return None,
        };
        let (hours, minutes) = rest.split_once(':')?;
        let hours: i32 = hours.parse().ok()?;
        let minutes: i32 = minutes.parse().ok()?;
        if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
            return None;
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(ZoneSetting::Fixed)
    }
}

/// Configuration shared by the engine components.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub environment: Environment,
    pub log_level: String,
    pub zone: ZoneSetting,
    /// Upper bound a dispatched mutation may stay silent before it counts as failed.
    pub mutation_timeout: Duration,
    /// How often the wall clock is sampled for quarter changes.
    pub tick_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            log_level: "info".to_string(),
            zone: ZoneSetting::Local,
            mutation_timeout: Duration::from_millis(DEFAULT_MUTATION_TIMEOUT_MS),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

impl CoreConfig {
    /// Loads configuration from the process environment (`LONGTERM_*`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_with_prefix(DEFAULT_PREFIX)
    }

    /// Loads configuration from env vars prefixed with the provided value (e.g. `GOALS_`).
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);
        let defaults = Self::default();

        let environment = lookup(&key("ENV"))
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let log_level = lookup(&key("LOG_LEVEL")).unwrap_or(defaults.log_level);

        let zone_key = key("TIMEZONE");
        let zone = match lookup(&zone_key) {
            Some(raw) => ZoneSetting::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: zone_key,
                value: raw,
            })?,
            None => defaults.zone,
        };

        let mutation_timeout =
            read_millis(&lookup, key("MUTATION_TIMEOUT_MS"))?.unwrap_or(defaults.mutation_timeout);
        let tick_interval =
            read_millis(&lookup, key("TICK_INTERVAL_MS"))?.unwrap_or(defaults.tick_interval);

        Ok(Self {
            environment,
            log_level,
            zone,
            mutation_timeout,
            tick_interval,
        })
    }

    /// Whether the process is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

fn read_millis<F>(lookup: &F, key: String) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}

/// Helper that loads config and converts to the canonical core error type.
pub fn load_core_config() -> Result<CoreConfig, CoreError> {
    Ok(CoreConfig::from_env()?)
}
