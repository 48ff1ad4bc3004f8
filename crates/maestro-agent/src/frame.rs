//! The line-delimited JSON wire protocol.
//!
//! The frame set is closed; parsing matches exhaustively and an unknown
//! `type` tag is a parse error the client counts and skips — never a
//! silently accepted default.

use maestro_core::{ContentBlock, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage as the agent reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUsage {
    /// Input tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Cache-write tokens.
    #[serde(default)]
    pub cache_creation: u64,
    /// Cache-read tokens.
    #[serde(default)]
    pub cache_read: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation,
            cache_read_tokens: usage.cache_read,
        }
    }
}

/// One content block as the agent spells it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Tool invocation.
    ToolUse {
        /// Correlation id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },
    /// Tool outcome.
    ToolResult {
        /// Correlation id of the matching `tool_use`.
        tool_use_id: String,
        /// Tool output.
        #[serde(default)]
        content: Value,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },
    /// Extended thinking.
    Thinking {
        /// The thinking text.
        text: String,
        /// Integrity signature (opaque; not verified here).
        #[serde(default)]
        signature: Option<String>,
    },
}

impl From<WireBlock> for ContentBlock {
    fn from(block: WireBlock) -> Self {
        match block {
            WireBlock::Text { text } => Self::Text { text },
            WireBlock::ToolUse { id, name, input } => Self::ToolUse {
                tool_use_id: id,
                tool_name: name,
                input,
            },
            WireBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Self::ToolResult {
                tool_use_id,
                output: content,
                is_error,
            },
            WireBlock::Thinking { text, .. } => Self::Thinking { text },
        }
    }
}

/// One frame on the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A (possibly multi-block) assistant message.
    Assistant {
        /// Content blocks.
        content: Vec<WireBlock>,
        /// Model that produced the message.
        #[serde(default)]
        model: Option<String>,
        /// Usage attributed to the message.
        #[serde(default)]
        usage: WireUsage,
    },
    /// A streaming delta belonging to a forthcoming message.
    StreamEvent {
        /// Delta kind, e.g. `text_delta`, `input_json_delta`.
        event: String,
        /// Message the delta belongs to.
        #[serde(default)]
        parent_id: Option<String>,
        /// Delta payload.
        delta: Value,
    },
    /// End of turn.
    Result {
        /// Why the turn stopped.
        #[serde(default)]
        stop_reason: Option<String>,
        /// Wall-clock duration of the turn.
        #[serde(default)]
        duration_ms: u64,
        /// Model turns taken.
        #[serde(default)]
        num_turns: u32,
        /// Cost the agent attributes to the turn.
        #[serde(default)]
        total_cost_usd: Option<f64>,
        /// Usage for the whole turn.
        #[serde(default)]
        usage: WireUsage,
    },
    /// The child asks whether a tool call may proceed.
    PermissionRequest {
        /// Correlation id of the pending tool call.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        input: Value,
    },
}

impl Frame {
    /// Parse one line of child output.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Whether this frame ends the turn.
    #[must_use]
    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Frames the parent writes to the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// A user prompt starting a turn.
    User {
        /// The prompt text.
        prompt: String,
    },
    /// Answer to a [`Frame::PermissionRequest`].
    PermissionResponse {
        /// Correlation id being answered.
        tool_use_id: String,
        /// Whether the tool call may proceed.
        allow: bool,
        /// Reason shown to the model on denial.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl OutboundFrame {
    /// Serialize as one wire line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_frame_parses() {
        let line = r#"{"type":"assistant","content":[
            {"type":"text","text":"reading"},
            {"type":"tool_use","id":"tu_1","name":"Read","input":{"path":"/tmp/x"}}
        ],"model":"claude-sonnet-4-20250514","usage":{"input_tokens":10,"output_tokens":4}}"#
            .replace('\n', "");
        let frame = Frame::parse(&line).expect("parse");
        match frame {
            Frame::Assistant { content, model, usage } => {
                assert_eq!(content.len(), 2);
                assert_eq!(model.as_deref(), Some("claude-sonnet-4-20250514"));
                assert_eq!(usage.input_tokens, 10);
                let block: ContentBlock = content[1].clone().into();
                assert_eq!(block.tool_use_id(), Some("tu_1"));
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn result_frame_ends_turn() {
        let frame = Frame::parse(
            r#"{"type":"result","stop_reason":"end_turn","duration_ms":1500,
                "num_turns":1,"total_cost_usd":0.012,"usage":{"input_tokens":100}}"#,
        )
        .expect("parse");
        assert!(frame.is_turn_end());
    }

    #[test]
    fn permission_request_parses() {
        let frame = Frame::parse(
            r#"{"type":"permission_request","tool_use_id":"tu_7",
                "tool_name":"Bash","input":{"command":"ls"}}"#,
        )
        .expect("parse");
        assert!(matches!(frame, Frame::PermissionRequest { ref tool_name, .. }
            if tool_name == "Bash"));
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        assert!(Frame::parse(r#"{"type":"telemetry","data":{}}"#).is_err());
    }

    #[test]
    fn outbound_frames_serialize() {
        let user = OutboundFrame::User {
            prompt: "read /tmp/x".into(),
        };
        let line = user.to_line().expect("line");
        assert_eq!(
            serde_json::from_str::<Value>(&line).expect("json"),
            json!({"type": "user", "prompt": "read /tmp/x"})
        );

        let denial = OutboundFrame::PermissionResponse {
            tool_use_id: "tu_7".into(),
            allow: false,
            reason: Some("restricted path".into()),
        };
        assert!(denial.to_line().expect("line").contains("restricted path"));
    }

    #[test]
    fn thinking_block_converts() {
        let block = WireBlock::Thinking {
            text: "hmm".into(),
            signature: Some("sig".into()),
        };
        assert_eq!(
            ContentBlock::from(block),
            ContentBlock::Thinking { text: "hmm".into() }
        );
    }
}
