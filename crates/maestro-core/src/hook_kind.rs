//! Hook kinds shared across crates.
//!
//! `HookKind` lives in `maestro-core` so that the hook registry, the
//! message pipeline, and the store can all reference it without a
//! circular dependency.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle points at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Before a tool call is allowed to run.
    PreToolUse,
    /// After a tool result arrives.
    PostToolUse,
    /// When the user submits a prompt.
    UserPromptSubmit,
    /// At end of turn.
    Stop,
    /// When a forked child finishes.
    SubagentStop,
    /// Before context compaction.
    PreCompact,
}

impl HookKind {
    /// All kinds, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::PreToolUse,
        Self::PostToolUse,
        Self::UserPromptSubmit,
        Self::Stop,
        Self::SubagentStop,
        Self::PreCompact,
    ];

    /// Parse from the snake_case wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pre_tool_use" => Some(Self::PreToolUse),
            "post_tool_use" => Some(Self::PostToolUse),
            "user_prompt_submit" => Some(Self::UserPromptSubmit),
            "stop" => Some(Self::Stop),
            "subagent_stop" => Some(Self::SubagentStop),
            "pre_compact" => Some(Self::PreCompact),
            _ => None,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreToolUse => write!(f, "pre_tool_use"),
            Self::PostToolUse => write!(f, "post_tool_use"),
            Self::UserPromptSubmit => write!(f, "user_prompt_submit"),
            Self::Stop => write!(f, "stop"),
            Self::SubagentStop => write!(f, "subagent_stop"),
            Self::PreCompact => write!(f, "pre_compact"),
        }
    }
}
