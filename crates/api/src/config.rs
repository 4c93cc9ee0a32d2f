//! Application configuration

use std::env;
use std::time::Duration;

use huddle_coordination::{config::MAX_DURATION, CoordinatorConfig};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Coordination
    pub sweep_interval: Duration,
    pub presence_staleness: Duration,
    pub default_lock_ttl: Duration,
    pub max_lock_ttl: Duration,

    // Logging
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Server
            bind_address: {
                let address =
                    env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
                if address.trim().is_empty() {
                    return Err(ConfigError::Missing("BIND_ADDRESS"));
                }
                address
            },

            // Coordination
            sweep_interval: duration_secs("SWEEP_INTERVAL_SECS", 300)?,
            presence_staleness: duration_secs("PRESENCE_STALENESS_SECS", 30 * 60)?,
            default_lock_ttl: duration_secs("DEFAULT_LOCK_TTL_SECS", 300)?,
            max_lock_ttl: duration_secs("MAX_LOCK_TTL_SECS", 3600)?,

            // Logging
            log_filter: env::var("LOG_FILTER").unwrap_or_else(|_| "info".to_string()),
            log_format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                other => {
                    return Err(ConfigError::Invalid(
                        "LOG_FORMAT",
                        format!("expected pretty or json, got {other:?}"),
                    ))
                }
            },
        };

        if config.default_lock_ttl > config.max_lock_ttl {
            return Err(ConfigError::Invalid(
                "DEFAULT_LOCK_TTL_SECS",
                "must not exceed MAX_LOCK_TTL_SECS".to_string(),
            ));
        }

        Ok(config)
    }

    /// Settings handed to the coordination core
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            sweep_interval: self.sweep_interval,
            presence_staleness: self.presence_staleness,
            default_lock_ttl: self.default_lock_ttl,
            max_lock_ttl: self.max_lock_ttl,
        }
    }
}

/// Read a positive number of seconds no larger than [`MAX_DURATION`],
/// falling back to `default` when unset
fn duration_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid(name, format!("{raw:?} is not a number of seconds: {e}")))?,
        Err(_) => default,
    };

    if secs == 0 {
        return Err(ConfigError::Invalid(name, "must be greater than zero".to_string()));
    }
    if secs > MAX_DURATION.as_secs() {
        return Err(ConfigError::Invalid(
            name,
            format!("must not exceed {} seconds", MAX_DURATION.as_secs()),
        ));
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "SWEEP_INTERVAL_SECS",
        "PRESENCE_STALENESS_SECS",
        "DEFAULT_LOCK_TTL_SECS",
        "MAX_LOCK_TTL_SECS",
        "LOG_FILTER",
        "LOG_FORMAT",
    ];

    /// Helper to clear env vars before and after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.presence_staleness, Duration::from_secs(1800));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.coordinator_config(), CoordinatorConfig::default());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
        env::set_var("SWEEP_INTERVAL_SECS", "60");
        env::set_var("DEFAULT_LOCK_TTL_SECS", "120");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:8080");
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.default_lock_ttl, Duration::from_secs(120));
        assert_eq!(config.log_format, LogFormat::Json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_durations_are_rejected() {
        cleanup_config();

        env::set_var("SWEEP_INTERVAL_SECS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("SWEEP_INTERVAL_SECS", _))
        ));

        env::set_var("SWEEP_INTERVAL_SECS", "five minutes");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("SWEEP_INTERVAL_SECS", _))
        ));

        env::set_var("SWEEP_INTERVAL_SECS", "400000000000");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("SWEEP_INTERVAL_SECS", _))
        ));

        cleanup_config();
        env::set_var("MAX_LOCK_TTL_SECS", "400000000000");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("MAX_LOCK_TTL_SECS", _))
        ));

        cleanup_config();
        env::set_var("MAX_LOCK_TTL_SECS", &MAX_DURATION.as_secs().to_string());
        assert_eq!(Config::from_env().unwrap().max_lock_ttl, MAX_DURATION);

        cleanup_config();
        env::set_var("DEFAULT_LOCK_TTL_SECS", "7200");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("DEFAULT_LOCK_TTL_SECS", _))
        ));

        cleanup_config();
        env::set_var("LOG_FORMAT", "xml");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("LOG_FORMAT", _))
        ));

        cleanup_config();
        env::set_var("BIND_ADDRESS", " ");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("BIND_ADDRESS"))
        ));

        cleanup_config();
    }
}
