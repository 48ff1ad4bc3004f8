//! Built-in policies.

use maestro_core::PermissionMode;
use serde_json::Value;

use crate::decision::{Policy, PolicyDecision};

/// Tool names treated as file reads/writes by [`FileAccessPolicy`].
const FILE_TOOLS: &[&str] = &["read_file", "write_file", "Read", "Write", "Edit"];

/// Tool names treated as shell execution by [`CommandPolicy`].
const SHELL_TOOLS: &[&str] = &["bash", "Bash"];

/// Tool names allowed outright under `ACCEPT_EDITS`.
const EDIT_TOOLS: &[&str] = &["Write", "Edit", "write_file", "edit_file", "NotebookEdit"];

/// Settings the built-in policies are constructed from (global config
/// merged with per-session overrides).
#[derive(Debug, Clone, Default)]
pub struct PolicySettings {
    /// Path prefixes that deny file tools.
    pub restricted_paths: Vec<String>,
    /// Path prefixes that explicitly allow file tools.
    pub allowed_paths: Vec<String>,
    /// Substrings that deny shell commands.
    pub blocked_commands: Vec<String>,
}

/// Build a built-in policy by its configured name.
#[must_use]
pub fn from_name(
    name: &str,
    settings: &PolicySettings,
) -> Option<std::sync::Arc<dyn Policy>> {
    match name {
        "file_access" | "FileAccessPolicy" => Some(std::sync::Arc::new(FileAccessPolicy::new(
            settings.restricted_paths.clone(),
            settings.allowed_paths.clone(),
        ))),
        "command" | "CommandPolicy" => Some(std::sync::Arc::new(CommandPolicy::new(
            settings.blocked_commands.clone(),
        ))),
        _ => None,
    }
}

/// Denies file tools whose target path falls under a restricted prefix.
///
/// Paths are expanded (`~`, `$VAR`, `${VAR}`) before matching, so a
/// restriction on `~/.ssh` also covers the expanded home path the agent
/// would actually send.
#[derive(Debug, Clone)]
pub struct FileAccessPolicy {
    restricted_paths: Vec<String>,
    allowed_paths: Vec<String>,
}

impl FileAccessPolicy {
    /// Create with restricted and explicitly allowed prefixes.
    #[must_use]
    pub fn new(restricted_paths: Vec<String>, allowed_paths: Vec<String>) -> Self {
        Self {
            restricted_paths: restricted_paths.iter().map(|p| expand_path(p)).collect(),
            allowed_paths: allowed_paths.iter().map(|p| expand_path(p)).collect(),
        }
    }

    fn target_path(input: &Value) -> Option<String> {
        for key in ["path", "file_path"] {
            if let Some(path) = input.get(key).and_then(Value::as_str) {
                return Some(expand_path(path));
            }
        }
        None
    }
}

impl Policy for FileAccessPolicy {
    fn name(&self) -> &str {
        "file_access"
    }

    fn evaluate(&self, tool_name: &str, input: &Value) -> PolicyDecision {
        if !FILE_TOOLS.contains(&tool_name) {
            return PolicyDecision::Abstain;
        }
        let Some(path) = Self::target_path(input) else {
            // A file tool without a parsable path cannot be vetted.
            return PolicyDecision::deny(format!(
                "tool '{tool_name}' input carries no recognizable path"
            ));
        };
        if let Some(prefix) = self.restricted_paths.iter().find(|p| path.starts_with(p.as_str())) {
            return PolicyDecision::deny(format!(
                "path '{path}' is under restricted prefix '{prefix}'"
            ));
        }
        if !self.allowed_paths.is_empty()
            && !self.allowed_paths.iter().any(|p| path.starts_with(p.as_str()))
        {
            return PolicyDecision::deny(format!("path '{path}' is outside the allowed set"));
        }
        PolicyDecision::Allow
    }
}

/// Denies shell tools whose command contains a blocked substring.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    blocked: Vec<String>,
}

impl CommandPolicy {
    /// Create with the blocked substrings.
    #[must_use]
    pub fn new(blocked: Vec<String>) -> Self {
        Self { blocked }
    }
}

impl Policy for CommandPolicy {
    fn name(&self) -> &str {
        "command"
    }

    fn evaluate(&self, tool_name: &str, input: &Value) -> PolicyDecision {
        if !SHELL_TOOLS.contains(&tool_name) {
            return PolicyDecision::Abstain;
        }
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if command.is_empty() {
            return PolicyDecision::deny("shell tool input carries no command");
        }
        if let Some(blocked) = self.blocked.iter().find(|b| command.contains(b.as_str())) {
            return PolicyDecision::deny(format!(
                "command contains blocked substring '{blocked}'"
            ));
        }
        PolicyDecision::Abstain
    }
}

/// Shorthand for the three global permission modes.
///
/// `DEFAULT` abstains, `ACCEPT_EDITS` allows edit tools, `BYPASS` allows
/// everything. Installed ahead of custom policies so the shorthand wins.
#[derive(Debug, Clone, Copy)]
pub struct PermissionModePolicy {
    mode: PermissionMode,
}

impl PermissionModePolicy {
    /// Create for a session's mode.
    #[must_use]
    pub fn new(mode: PermissionMode) -> Self {
        Self { mode }
    }
}

impl Policy for PermissionModePolicy {
    fn name(&self) -> &str {
        "permission_mode"
    }

    fn evaluate(&self, tool_name: &str, _input: &Value) -> PolicyDecision {
        match self.mode {
            PermissionMode::Default => PolicyDecision::Abstain,
            PermissionMode::AcceptEdits => {
                if EDIT_TOOLS.contains(&tool_name) {
                    PolicyDecision::Allow
                } else {
                    PolicyDecision::Abstain
                }
            },
            PermissionMode::Bypass => PolicyDecision::Allow,
        }
    }
}

/// Expand `~`, `$VAR`, and `${VAR}` in a path string.
fn expand_path(path: &str) -> String {
    let mut expanded = if let Some(rest) = path.strip_prefix("~") {
        let home = dirs::home_dir().unwrap_or_default();
        format!("{}{rest}", home.display())
    } else {
        path.to_string()
    };

    while let Some(start) = expanded.find('$') {
        let after = &expanded[start + 1..];
        let (name, end) = if let Some(stripped) = after.strip_prefix('{') {
            match stripped.find('}') {
                Some(close) => (&stripped[..close], start + close + 3),
                None => break,
            }
        } else {
            let len = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            if len == 0 {
                break;
            }
            (&after[..len], start + 1 + len)
        };
        let value = std::env::var(name).unwrap_or_default();
        expanded = format!("{}{}{}", &expanded[..start], value, &expanded[end..]);
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_policy_denies_restricted_prefix() {
        let policy = FileAccessPolicy::new(vec!["/etc".into()], vec![]);
        let decision = policy.evaluate("Read", &json!({"path": "/etc/passwd"}));
        match decision {
            PolicyDecision::Deny { reason, interrupt } => {
                assert!(reason.contains("/etc"));
                assert!(!interrupt);
            },
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn file_policy_allows_elsewhere() {
        let policy = FileAccessPolicy::new(vec!["/etc".into()], vec![]);
        assert_eq!(
            policy.evaluate("Read", &json!({"path": "/tmp/x"})),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn file_policy_abstains_for_other_tools() {
        let policy = FileAccessPolicy::new(vec!["/etc".into()], vec![]);
        assert_eq!(
            policy.evaluate("Bash", &json!({"command": "cat /etc/passwd"})),
            PolicyDecision::Abstain
        );
    }

    #[test]
    fn file_policy_respects_allowed_set() {
        let policy = FileAccessPolicy::new(vec![], vec!["/workspace".into()]);
        assert_eq!(
            policy.evaluate("Write", &json!({"file_path": "/workspace/main.rs"})),
            PolicyDecision::Allow
        );
        assert!(matches!(
            policy.evaluate("Write", &json!({"file_path": "/home/other"})),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn file_policy_denies_missing_path() {
        let policy = FileAccessPolicy::new(vec![], vec![]);
        assert!(matches!(
            policy.evaluate("Read", &json!({"target": 42})),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn command_policy_matches_substrings() {
        let policy = CommandPolicy::new(vec!["rm -rf".into()]);
        assert!(matches!(
            policy.evaluate("Bash", &json!({"command": "rm -rf /tmp/build"})),
            PolicyDecision::Deny { .. }
        ));
        assert_eq!(
            policy.evaluate("Bash", &json!({"command": "ls -la"})),
            PolicyDecision::Abstain
        );
        assert_eq!(
            policy.evaluate("Read", &json!({"path": "/x"})),
            PolicyDecision::Abstain
        );
    }

    #[test]
    fn permission_mode_shorthands() {
        let bypass = PermissionModePolicy::new(PermissionMode::Bypass);
        assert_eq!(bypass.evaluate("anything", &json!({})), PolicyDecision::Allow);

        let edits = PermissionModePolicy::new(PermissionMode::AcceptEdits);
        assert_eq!(edits.evaluate("Edit", &json!({})), PolicyDecision::Allow);
        assert_eq!(edits.evaluate("Bash", &json!({})), PolicyDecision::Abstain);

        let default = PermissionModePolicy::new(PermissionMode::Default);
        assert_eq!(default.evaluate("Edit", &json!({})), PolicyDecision::Abstain);
    }

    #[test]
    fn tilde_expansion_covers_home_paths() {
        let home = dirs::home_dir().unwrap_or_default();
        let policy = FileAccessPolicy::new(vec!["~/.ssh".into()], vec![]);
        let target = format!("{}/.ssh/id_ed25519", home.display());
        assert!(matches!(
            policy.evaluate("Read", &json!({"path": target})),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn env_var_expansion() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_path("$HOME/x"), format!("{home}/x"));
            assert_eq!(expand_path("${HOME}/y"), format!("{home}/y"));
        }
        // Unset variables expand to empty rather than erroring.
        assert_eq!(expand_path("$MAESTRO_NO_SUCH_VAR/z"), "/z");
    }
}
