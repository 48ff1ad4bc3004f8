//! Message content blocks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Direction of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Prompt written by the user (or a task template).
    UserToAgent,
    /// Output emitted by the agent subprocess.
    AgentToUser,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserToAgent => write!(f, "user_to_agent"),
            Self::AgentToUser => write!(f, "agent_to_user"),
        }
    }
}

/// One block of message content.
///
/// The set is closed; frame parsing matches exhaustively and unknown block
/// tags are a parse error, never a silent default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// The agent is invoking a tool.
    ToolUse {
        /// Correlates the matching result block and the tool-execution row.
        tool_use_id: String,
        /// Tool name as the agent spelled it.
        tool_name: String,
        /// Tool input, verbatim.
        input: Value,
    },
    /// Outcome of a prior tool invocation.
    ToolResult {
        /// Id of the `ToolUse` block this result answers.
        tool_use_id: String,
        /// Tool output (text or structured).
        output: Value,
        /// Whether the tool failed.
        is_error: bool,
    },
    /// Extended thinking emitted by the model.
    Thinking {
        /// The thinking text.
        text: String,
    },
}

impl ContentBlock {
    /// Build a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a synthetic error result, used when a tool call is blocked
    /// before it reaches the agent.
    #[must_use]
    pub fn error_result(tool_use_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            output: Value::String(reason.into()),
            is_error: true,
        }
    }

    /// The tool-use id, for the two block kinds that carry one.
    #[must_use]
    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Self::ToolUse { tool_use_id, .. } | Self::ToolResult { tool_use_id, .. } => {
                Some(tool_use_id)
            },
            Self::Text { .. } | Self::Thinking { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_json_is_tagged() {
        let block = ContentBlock::ToolUse {
            tool_use_id: "tu_1".into(),
            tool_name: "Read".into(),
            input: serde_json::json!({"path": "/tmp/x"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["tool_name"], "Read");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn unknown_block_tag_is_an_error() {
        let raw = serde_json::json!({"type": "hologram", "text": "hi"});
        assert!(serde_json::from_value::<ContentBlock>(raw).is_err());
    }

    #[test]
    fn error_result_sets_flag() {
        let block = ContentBlock::error_result("tu_9", "blocked_by_hook");
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_use_id, "tu_9");
                assert!(is_error);
            },
            other => panic!("unexpected block: {other:?}"),
        }
    }
}
