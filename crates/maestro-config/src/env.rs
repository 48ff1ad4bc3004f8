//! Environment variable loading.
//!
//! Variables are applied on top of [`Config::default`]; an unset variable
//! leaves the default in place, a malformed one is an error rather than a
//! silent fallback.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::types::Config;

/// Lookup abstraction so tests can inject variables without touching the
/// process environment.
pub trait EnvSource {
    /// Return the value of `name`, if set.
    fn get(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// The environment variable name.
        var: &'static str,
        /// The raw value found.
        value: String,
        /// Why parsing failed.
        reason: String,
    },
}

/// Recognised variables, kept in one place so `check-config` can print them.
pub const RECOGNIZED_VARS: &[&str] = &[
    "STORAGE_ROOT",
    "ARCHIVE_STORE",
    "ARCHIVE_COMPRESSION",
    "AGENT_CLI_PATH",
    "DEFAULT_MODEL",
    "DEFAULT_MAX_RETRIES",
    "DEFAULT_RETRY_DELAY_MS",
    "DEFAULT_TIMEOUT_MS",
    "MAX_CONCURRENT_SESSIONS_PER_USER",
    "METRICS_SNAPSHOT_INTERVAL_MS",
    "USER_MONTHLY_BUDGET_USD",
    "ENABLE_AUDIT_HOOK",
    "ENABLE_METRICS_HOOK",
    "ENABLE_NOTIFICATION_HOOK",
    "BLOCKED_COMMANDS",
    "RESTRICTED_PATHS",
];

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    /// Load configuration from an arbitrary [`EnvSource`].
    pub fn from_source(source: &impl EnvSource) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = source.get("STORAGE_ROOT") {
            config.storage_root = PathBuf::from(v);
        }
        if let Some(v) = source.get("ARCHIVE_STORE") {
            config.archive_store = PathBuf::from(v);
        }
        if let Some(v) = source.get("ARCHIVE_COMPRESSION") {
            config.archive_compression = v.parse().map_err(|e| ConfigError::InvalidValue {
                var: "ARCHIVE_COMPRESSION",
                value: v,
                reason: format!("{e}"),
            })?;
        }
        if let Some(v) = source.get("AGENT_CLI_PATH") {
            config.agent_cli_path = PathBuf::from(v);
        }
        if let Some(v) = source.get("DEFAULT_MODEL") {
            config.default_model = v;
        }
        if let Some(v) = source.get("DEFAULT_MAX_RETRIES") {
            config.retry.max_retries = parse_num("DEFAULT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = source.get("DEFAULT_RETRY_DELAY_MS") {
            config.retry.retry_delay_ms = parse_num("DEFAULT_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = source.get("DEFAULT_TIMEOUT_MS") {
            config.retry.timeout_ms = parse_num("DEFAULT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = source.get("MAX_CONCURRENT_SESSIONS_PER_USER") {
            config.max_concurrent_sessions_per_user =
                parse_num("MAX_CONCURRENT_SESSIONS_PER_USER", &v)?;
        }
        if let Some(v) = source.get("METRICS_SNAPSHOT_INTERVAL_MS") {
            config.metrics_snapshot_interval_ms = parse_num("METRICS_SNAPSHOT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = source.get("USER_MONTHLY_BUDGET_USD") {
            config.user_monthly_budget_usd =
                v.parse::<f64>().map_err(|e| ConfigError::InvalidValue {
                    var: "USER_MONTHLY_BUDGET_USD",
                    value: v,
                    reason: e.to_string(),
                })?;
        }
        if let Some(v) = source.get("ENABLE_AUDIT_HOOK") {
            config.hooks.audit = parse_bool("ENABLE_AUDIT_HOOK", &v)?;
        }
        if let Some(v) = source.get("ENABLE_METRICS_HOOK") {
            config.hooks.metrics = parse_bool("ENABLE_METRICS_HOOK", &v)?;
        }
        if let Some(v) = source.get("ENABLE_NOTIFICATION_HOOK") {
            config.hooks.notification = parse_bool("ENABLE_NOTIFICATION_HOOK", &v)?;
        }
        if let Some(v) = source.get("BLOCKED_COMMANDS") {
            config.blocked_commands = parse_list(&v);
        }
        if let Some(v) = source.get("RESTRICTED_PATHS") {
            config.restricted_paths = parse_list(&v);
        }

        debug!(
            storage_root = %config.storage_root.display(),
            compression = %config.archive_compression,
            "Configuration loaded"
        );
        Ok(config)
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Compression;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = Config::from_source(&env(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = Config::from_source(&env(&[
            ("STORAGE_ROOT", "/srv/maestro"),
            ("ARCHIVE_COMPRESSION", "tar"),
            ("DEFAULT_MAX_RETRIES", "7"),
            ("USER_MONTHLY_BUDGET_USD", "12.5"),
            ("ENABLE_NOTIFICATION_HOOK", "off"),
            ("BLOCKED_COMMANDS", "shutdown, reboot"),
        ]))
        .unwrap();

        assert_eq!(config.storage_root, PathBuf::from("/srv/maestro"));
        assert_eq!(config.archive_compression, Compression::Tar);
        assert_eq!(config.retry.max_retries, 7);
        assert!((config.user_monthly_budget_usd - 12.5).abs() < f64::EPSILON);
        assert!(!config.hooks.notification);
        assert_eq!(config.blocked_commands, vec!["shutdown", "reboot"]);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_source(&env(&[("DEFAULT_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("DEFAULT_TIMEOUT_MS"));
    }

    #[test]
    fn malformed_compression_is_an_error() {
        assert!(Config::from_source(&env(&[("ARCHIVE_COMPRESSION", "brotli")])).is_err());
    }

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        let config =
            Config::from_source(&env(&[("RESTRICTED_PATHS", " /etc , ,/root,")])).unwrap();
        assert_eq!(config.restricted_paths, vec!["/etc", "/root"]);
    }
}
