//! Hook trait and invocation types.

use async_trait::async_trait;
use maestro_core::{HookKind, SessionId};
use serde_json::{Map, Value};
use thiserror::Error;

/// Default priority; lower fires first.
pub const DEFAULT_PRIORITY: i32 = 100;

/// A hook invocation failed.
#[derive(Debug, Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// Input handed to a hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Lifecycle point being dispatched.
    pub kind: HookKind,
    /// Tool call that triggered the event, for tool-scoped kinds.
    pub tool_use_id: Option<String>,
    /// Composed input: the original event payload overlaid with the
    /// outputs of earlier hooks in the chain (last write wins per key).
    pub input: Map<String, Value>,
}

impl HookContext {
    /// Build a context for an event payload.
    #[must_use]
    pub fn new(session_id: SessionId, kind: HookKind, input: Map<String, Value>) -> Self {
        Self {
            session_id,
            kind,
            tool_use_id: None,
            input,
        }
    }

    /// Attach the triggering tool call.
    #[must_use]
    pub fn with_tool_use_id(mut self, tool_use_id: impl Into<String>) -> Self {
        self.tool_use_id = Some(tool_use_id.into());
        self
    }

    /// Typed read of an input field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(Value::as_str)
    }

    /// Boolean read of an input field (absent counts as false).
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.input.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// What a hook returns.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// Keys to merge into the chain's composed output.
    pub output: Map<String, Value>,
    /// `false` stops the remaining chain and, for
    /// [`HookKind::PreToolUse`], blocks the tool call itself.
    pub continue_execution: bool,
}

impl HookOutcome {
    /// Continue with no output.
    #[must_use]
    pub fn proceed() -> Self {
        Self {
            output: Map::new(),
            continue_execution: true,
        }
    }

    /// Continue, contributing output keys.
    #[must_use]
    pub fn proceed_with(output: Map<String, Value>) -> Self {
        Self {
            output,
            continue_execution: true,
        }
    }

    /// Stop the chain (and the triggering tool call), with a reason key.
    #[must_use]
    pub fn block(reason: impl Into<String>) -> Self {
        let mut output = Map::new();
        output.insert("block_reason".into(), Value::String(reason.into()));
        Self {
            output,
            continue_execution: false,
        }
    }
}

/// A lifecycle callback.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Stable name, recorded on every audit row.
    fn name(&self) -> &str;

    /// The lifecycle point this hook subscribes to.
    fn kind(&self) -> HookKind;

    /// Dispatch order within the kind; lower fires first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Run the hook.
    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_outcome_carries_reason() {
        let outcome = HookOutcome::block("policy violation");
        assert!(!outcome.continue_execution);
        assert_eq!(
            outcome.output.get("block_reason").and_then(Value::as_str),
            Some("policy violation")
        );
    }

    #[test]
    fn context_reads() {
        let mut input = Map::new();
        input.insert("tool_name".into(), Value::String("Read".into()));
        input.insert("is_error".into(), Value::Bool(true));
        let ctx = HookContext::new(SessionId::new(), HookKind::PostToolUse, input)
            .with_tool_use_id("tu_1");
        assert_eq!(ctx.get_str("tool_name"), Some("Read"));
        assert!(ctx.get_bool("is_error"));
        assert!(!ctx.get_bool("missing"));
        assert_eq!(ctx.tool_use_id.as_deref(), Some("tu_1"));
    }
}
