//! Subprocess launch configuration.

use maestro_core::PermissionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Transport by which a tool provider is attached to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderTransport {
    /// Provider subprocess speaking over stdio.
    Stdio {
        /// Command to launch.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Server-sent events endpoint.
    Sse {
        /// Endpoint URL.
        url: String,
    },
    /// Plain HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
    },
    /// Provider compiled into the agent.
    InProcess,
}

/// One named tool provider declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProvider {
    /// Provider name as the agent addresses it.
    pub name: String,
    /// Attachment transport.
    pub transport: ProviderTransport,
}

/// Everything needed to spawn the agent CLI for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path of the agent CLI binary.
    pub cli_path: PathBuf,
    /// Working directory the subprocess runs in (the session's workdir).
    pub workdir: PathBuf,
    /// Model identifier.
    pub model: String,
    /// Tools the agent may use (passed comma-separated).
    pub allowed_tools: Vec<String>,
    /// Global permission shorthand, forwarded to the CLI.
    pub permission_mode: PermissionMode,
    /// Whether the CLI should stream partial messages.
    pub include_partial_messages: bool,
    /// Tool provider declarations.
    pub tool_providers: Vec<ToolProvider>,
    /// Opaque options forwarded as `--option key=json`.
    pub sdk_options: BTreeMap<String, Value>,
    /// Connect retries for transient spawn failures.
    pub max_retries: u32,
    /// Base retry delay in milliseconds.
    pub retry_delay_ms: u64,
}

impl AgentConfig {
    /// Command-line arguments for the subprocess.
    #[must_use]
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--permission-mode".to_string(),
            self.permission_mode.to_string(),
        ];
        if !self.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if self.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        for provider in &self.tool_providers {
            args.push("--tool-provider".to_string());
            args.push(
                serde_json::to_string(provider).unwrap_or_else(|_| provider.name.clone()),
            );
        }
        for (key, value) in &self.sdk_options {
            args.push("--option".to_string());
            args.push(format!(
                "{key}={}",
                serde_json::to_string(value).unwrap_or_default()
            ));
        }
        args
    }
}
