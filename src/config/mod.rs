//! Process configuration.
//!
//! Every knob has a default; `QUIETFETCH_*` environment variables override
//! them. [`HarvestConfig::from_lookup`] takes the variable source as a
//! function so tests never touch the real environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use url::Url;

use crate::challenges::engine::{ChromeConfig, SolveConfig};
use crate::challenges::tracker::TrackerConfig;
use crate::modules::circuit::CircuitConfig;
use crate::modules::pacing::PacingConfig;
use crate::transport::TransportConfig;
use crate::worker::WorkerConfig;

pub const ENV_PREFIX: &str = "QUIETFETCH_";

static DEFAULT_API_BASE: Lazy<Url> =
    Lazy::new(|| Url::parse("https://discord.com/api/v9").expect("invalid default api base"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_base: Url,
    pub database_path: PathBuf,
    pub exports_dir: PathBuf,
    pub min_delay: f64,
    pub max_delay: f64,
    /// Zero disables the hourly cap.
    pub messages_per_hour: u32,
    pub max_concurrent_jobs: usize,
    pub request_timeout: Duration,
    pub max_rate_limit_retries: u32,
    pub max_retry_after: Duration,
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    pub challenge_attempt_limit: usize,
    pub headless: bool,
    pub chrome_executable: PathBuf,
    pub browser_timeout: Duration,
    pub max_concurrent_browsers: usize,
    pub resource_limit_mb: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.clone(),
            database_path: PathBuf::from("quietfetch.redb"),
            exports_dir: PathBuf::from("exports"),
            min_delay: 0.1,
            max_delay: 0.2,
            messages_per_hour: 10_000,
            max_concurrent_jobs: 4,
            request_timeout: Duration::from_secs(30),
            max_rate_limit_retries: 5,
            max_retry_after: Duration::from_secs(300),
            circuit_threshold: 3,
            circuit_cooldown: Duration::from_secs(300),
            challenge_attempt_limit: 3,
            headless: true,
            chrome_executable: PathBuf::from("google-chrome"),
            browser_timeout: Duration::from_secs(30),
            max_concurrent_browsers: 2,
            resource_limit_mb: 512,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        let mut config = Self::default();

        if let Some(raw) = get("API_BASE") {
            config.api_base = parse("API_BASE", &raw)?;
        }
        if let Some(raw) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(raw);
        }
        if let Some(raw) = get("EXPORTS_DIR") {
            config.exports_dir = PathBuf::from(raw);
        }
        if let Some(raw) = get("MIN_DELAY") {
            config.min_delay = parse("MIN_DELAY", &raw)?;
        }
        if let Some(raw) = get("MAX_DELAY") {
            config.max_delay = parse("MAX_DELAY", &raw)?;
        }
        if let Some(raw) = get("MESSAGES_PER_HOUR") {
            config.messages_per_hour = parse("MESSAGES_PER_HOUR", &raw)?;
        }
        if let Some(raw) = get("MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse("MAX_CONCURRENT_JOBS", &raw)?;
        }
        if let Some(raw) = get("REQUEST_TIMEOUT") {
            config.request_timeout = Duration::from_secs(parse("REQUEST_TIMEOUT", &raw)?);
        }
        if let Some(raw) = get("MAX_RATE_LIMIT_RETRIES") {
            config.max_rate_limit_retries = parse("MAX_RATE_LIMIT_RETRIES", &raw)?;
        }
        if let Some(raw) = get("MAX_RETRY_AFTER") {
            config.max_retry_after = Duration::from_secs(parse("MAX_RETRY_AFTER", &raw)?);
        }
        if let Some(raw) = get("CIRCUIT_THRESHOLD") {
            config.circuit_threshold = parse("CIRCUIT_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("CIRCUIT_COOLDOWN") {
            config.circuit_cooldown = Duration::from_secs(parse("CIRCUIT_COOLDOWN", &raw)?);
        }
        if let Some(raw) = get("AUTO_SOLVE_LIMIT") {
            config.challenge_attempt_limit = parse("AUTO_SOLVE_LIMIT", &raw)?;
        }
        if let Some(raw) = get("BROWSER_HEADLESS") {
            config.headless = parse_bool("BROWSER_HEADLESS", &raw)?;
        }
        if let Some(raw) = get("CHROME_EXECUTABLE") {
            config.chrome_executable = PathBuf::from(raw);
        }
        if let Some(raw) = get("BROWSER_TIMEOUT") {
            config.browser_timeout = Duration::from_secs(parse("BROWSER_TIMEOUT", &raw)?);
        }
        if let Some(raw) = get("MAX_CONCURRENT_BROWSERS") {
            config.max_concurrent_browsers = parse("MAX_CONCURRENT_BROWSERS", &raw)?;
        }
        if let Some(raw) = get("BROWSER_RESOURCE_LIMIT_MB") {
            config.resource_limit_mb = parse("BROWSER_RESOURCE_LIMIT_MB", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value,
            reason: reason.to_string(),
        };
        if !(self.min_delay.is_finite() && self.min_delay >= 0.0) {
            return Err(invalid(
                "MIN_DELAY",
                self.min_delay.to_string(),
                "must be a non-negative number",
            ));
        }
        if !(self.max_delay.is_finite() && self.max_delay >= self.min_delay) {
            return Err(invalid(
                "MAX_DELAY",
                self.max_delay.to_string(),
                "must not be below MIN_DELAY",
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(invalid("MAX_CONCURRENT_JOBS", "0".into(), "must be positive"));
        }
        if self.max_concurrent_browsers == 0 {
            return Err(invalid("MAX_CONCURRENT_BROWSERS", "0".into(), "must be positive"));
        }
        if self.circuit_threshold == 0 {
            return Err(invalid("CIRCUIT_THRESHOLD", "0".into(), "must be positive"));
        }
        Ok(())
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            messages_per_hour: (self.messages_per_hour > 0).then_some(self.messages_per_hour),
            ..PacingConfig::default()
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            exports_dir: self.exports_dir.clone(),
            pacing: self.pacing(),
            ..WorkerConfig::default()
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: self.request_timeout,
            max_rate_limit_retries: self.max_rate_limit_retries,
            max_retry_after: self.max_retry_after,
            ..TransportConfig::default()
        }
    }

    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_threshold,
            cooldown: self.circuit_cooldown,
            ..CircuitConfig::default()
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            attempt_limit: self.challenge_attempt_limit,
            ..TrackerConfig::default()
        }
    }

    pub fn chrome(&self) -> ChromeConfig {
        ChromeConfig {
            executable: self.chrome_executable.clone(),
            headless: self.headless,
            resource_limit_mb: self.resource_limit_mb,
            ..ChromeConfig::default()
        }
    }

    pub fn solve(&self) -> SolveConfig {
        SolveConfig {
            timeout: self.browser_timeout,
            ..SolveConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = HarvestConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_concurrent_browsers, 2);
        assert_eq!(config.browser_timeout, Duration::from_secs(30));
        assert_eq!(config.pacing().delay_floor, 1.0);
        assert_eq!(config.api_base.as_str(), "https://discord.com/api/v9");
    }

    #[test]
    fn overrides_apply() {
        let config = HarvestConfig::from_lookup(lookup(&[
            ("QUIETFETCH_MIN_DELAY", "0.5"),
            ("QUIETFETCH_MAX_DELAY", "1.5"),
            ("QUIETFETCH_BROWSER_HEADLESS", "false"),
            ("QUIETFETCH_MAX_CONCURRENT_BROWSERS", "3"),
            ("QUIETFETCH_EXPORTS_DIR", "/tmp/out"),
        ]))
        .unwrap();
        assert_eq!(config.pacing().max_delay, 1.5);
        assert!(!config.chrome().headless);
        assert_eq!(config.max_concurrent_browsers, 3);
        assert_eq!(config.worker().exports_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn hourly_cap_and_retry_ceiling_from_env() {
        let config = HarvestConfig::from_lookup(lookup(&[
            ("QUIETFETCH_MESSAGES_PER_HOUR", "80"),
            ("QUIETFETCH_MAX_RETRY_AFTER", "45"),
        ]))
        .unwrap();
        assert_eq!(config.pacing().messages_per_hour, Some(80));
        assert_eq!(config.transport().max_retry_after, Duration::from_secs(45));

        let defaults = HarvestConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(defaults.pacing().messages_per_hour, Some(10_000));

        let disabled = HarvestConfig::from_lookup(lookup(&[("QUIETFETCH_MESSAGES_PER_HOUR", "0")])).unwrap();
        assert_eq!(disabled.pacing().messages_per_hour, None);
    }

    #[test]
    fn rejects_bad_values() {
        let err = HarvestConfig::from_lookup(lookup(&[("QUIETFETCH_MAX_CONCURRENT_JOBS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "QUIETFETCH_MAX_CONCURRENT_JOBS"));

        let err = HarvestConfig::from_lookup(lookup(&[
            ("QUIETFETCH_MIN_DELAY", "3"),
            ("QUIETFETCH_MAX_DELAY", "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "QUIETFETCH_MAX_DELAY"));

        assert!(HarvestConfig::from_lookup(lookup(&[("QUIETFETCH_BROWSER_HEADLESS", "maybe")])).is_err());
    }
}
