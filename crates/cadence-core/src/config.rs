use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_MAX_RESULT_COUNT: i64 = 1024;
pub const DEFAULT_RETENTION_INTERVAL: &str = "24h";
pub const DEFAULT_RETENTION_MAX_AGE: &str = "168h"; // one week of history
pub const DEFAULT_CORE_COMMAND_URL: &str = "http://localhost:59882";
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 10_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub retention: RetentionConfig,
    pub clients: ClientsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound on the number of jobs loaded in one batch at startup.
    pub max_result_count: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_result_count: DEFAULT_MAX_RESULT_COUNT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Schedule action record retention.
///
/// `interval` and `max_age` are duration strings such as `"30m"` or `"168h"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval: String,
    pub max_age: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_RETENTION_INTERVAL.to_string(),
            max_age: DEFAULT_RETENTION_MAX_AGE.to_string(),
        }
    }
}

impl RetentionConfig {
    /// Time between two purge ticks.
    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval)
            .map_err(|e| e.with_context("failed to parse retention.interval"))
    }

    /// Records older than `now - max_age` are purged.
    pub fn max_age(&self) -> Result<Duration> {
        parse_duration(&self.max_age)
            .map_err(|e| e.with_context("failed to parse retention.max_age"))
    }
}

/// Downstream services reached by the HTTP action executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Base URL of the core-command service, used for device control actions.
    pub core_command_url: String,
    pub timeout_ms: u64,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            core_command_url: DEFAULT_CORE_COMMAND_URL.to_string(),
            timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `CADENCE_RETENTION__MAX_AGE=72h`. A missing file yields the defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Parse a duration string made of `<number><unit>` segments.
///
/// Units: `ms`, `s`, `m`, `h`, `d`. Segments may be chained (`"1h30m"`).
/// A zero total is rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || CadenceError::Config(format!("invalid duration '{s}'"));
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total_ms: u64 = 0;
    let mut chars = trimmed.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c);
            chars.next();
        }
        if digits.is_empty() || unit.is_empty() {
            return Err(invalid());
        }
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        let factor: u64 = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(invalid()),
        };
        total_ms = n
            .checked_mul(factor)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if total_ms == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "10", "h", "5w", "0s", "1h-5m", "  "] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn defaults_when_file_missing() {
        figment::Jail::expect_with(|_jail| {
            let config =
                CadenceConfig::load(Some("does-not-exist.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.service.max_result_count, DEFAULT_MAX_RESULT_COUNT);
            assert!(config.retention.enabled);
            assert_eq!(config.retention.interval().unwrap(), Duration::from_secs(86_400));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [service]
                max_result_count = 50

                [retention]
                enabled = false
                interval = "10m"
                "#,
            )?;
            jail.set_env("CADENCE_RETENTION__MAX_AGE", "72h");

            let config = CadenceConfig::load(Some("cadence.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.service.max_result_count, 50);
            assert!(!config.retention.enabled);
            assert_eq!(config.retention.interval().unwrap(), Duration::from_secs(600));
            assert_eq!(config.retention.max_age().unwrap(), Duration::from_secs(72 * 3600));
            Ok(())
        });
    }
}
