//! Typed configuration for the engine.

use maestro_core::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Retry knobs applied to new sessions unless overridden per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Maximum retries for transient failures.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-turn timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 300_000,
        }
    }
}

/// Which built-in hooks are installed on new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookToggles {
    /// Structured audit logging hook.
    pub audit: bool,
    /// Counter-updating metrics hook.
    pub metrics: bool,
    /// Transport notification hook.
    pub notification: bool,
}

impl Default for HookToggles {
    fn default() -> Self {
        Self {
            audit: true,
            metrics: true,
            notification: true,
        }
    }
}

/// Engine configuration, assembled once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root under which per-session working directories live
    /// (`<storage_root>/active/<session_id>`).
    pub storage_root: PathBuf,
    /// Directory (or object-store URI rendered as a path) for archives.
    pub archive_store: PathBuf,
    /// Compression for new archives.
    pub archive_compression: Compression,
    /// Path of the agent CLI binary to spawn.
    pub agent_cli_path: PathBuf,
    /// Model passed to the agent CLI when a session does not specify one.
    pub default_model: String,
    /// Retry and timeout defaults.
    pub retry: RetryDefaults,
    /// Per-user concurrent session quota.
    pub max_concurrent_sessions_per_user: u32,
    /// Interval between metric snapshots of active sessions.
    pub metrics_snapshot_interval_ms: u64,
    /// Monthly per-user budget in USD.
    pub user_monthly_budget_usd: f64,
    /// Built-in hook toggles.
    pub hooks: HookToggles,
    /// Substrings denied by the built-in command policy.
    pub blocked_commands: Vec<String>,
    /// Path prefixes denied by the built-in file-access policy.
    pub restricted_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/maestro/sessions"),
            archive_store: PathBuf::from("/var/lib/maestro/archives"),
            archive_compression: Compression::Gzip,
            agent_cli_path: PathBuf::from("claude"),
            default_model: "claude-sonnet-4-20250514".to_string(),
            retry: RetryDefaults::default(),
            max_concurrent_sessions_per_user: 5,
            metrics_snapshot_interval_ms: 60_000,
            user_monthly_budget_usd: 100.0,
            hooks: HookToggles::default(),
            blocked_commands: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                ":(){ :|:& };:".to_string(),
            ],
            restricted_paths: vec!["/etc".to_string(), "~/.ssh".to_string()],
        }
    }
}

impl Config {
    /// Path of the SQLite store inside the storage root.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.storage_root.join("maestro.db")
    }

    /// Directory for live working directories.
    #[must_use]
    pub fn active_root(&self) -> PathBuf {
        self.storage_root.join("active")
    }
}
