//! Settings read from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ClientError;

pub const MULTIPROCESS_ENV: &str = "ENGINECORE_MULTIPROCESS";
pub const STARTUP_TIMEOUT_ENV: &str = "ENGINECORE_STARTUP_TIMEOUT_SECS";
pub const WATCHDOG_INTERVAL_ENV: &str = "ENGINECORE_WATCHDOG_INTERVAL_SECS";
pub const KEEP_ALIVE_ENV: &str = "ENGINECORE_KEEP_ALIVE_ON_ENGINE_DEATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Run the engine in a separate worker rather than in-process.
    pub multiprocess: bool,
    /// How long to wait for the worker's startup report.
    pub startup_timeout: Duration,
    pub watchdog_interval: Duration,
    pub keep_alive_on_engine_death: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            multiprocess: true,
            startup_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(3),
            keep_alive_on_engine_death: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            multiprocess: parse_bool(&lookup, MULTIPROCESS_ENV)?.unwrap_or(defaults.multiprocess),
            startup_timeout: parse_secs(&lookup, STARTUP_TIMEOUT_ENV)?
                .unwrap_or(defaults.startup_timeout),
            watchdog_interval: parse_secs(&lookup, WATCHDOG_INTERVAL_ENV)?
                .unwrap_or(defaults.watchdog_interval),
            keep_alive_on_engine_death: parse_bool(&lookup, KEEP_ALIVE_ENV)?
                .unwrap_or(defaults.keep_alive_on_engine_death),
        })
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ClientError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(invalid(key, &raw)),
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ClientError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let secs = u64::from_str(raw.trim()).map_err(|_| invalid(key, &raw))?;
    if secs == 0 {
        return Err(invalid(key, &raw));
    }
    Ok(Some(Duration::from_secs(secs)))
}

fn invalid(key: &str, raw: &str) -> ClientError {
    ClientError::Config(format!("invalid value for {}: {:?}", key, raw))
}
