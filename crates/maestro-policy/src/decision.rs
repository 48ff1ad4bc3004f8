//! Policy trait and decision types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a single policy says about one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The call may proceed; stop evaluating.
    Allow,
    /// The call must not proceed; stop evaluating.
    Deny {
        /// Why the call was denied.
        reason: String,
        /// Whether the whole turn should be interrupted, not just this call.
        interrupt: bool,
    },
    /// This policy has no opinion; continue to the next one.
    Abstain,
}

impl PolicyDecision {
    /// Deny with a reason, without interrupting the turn.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            interrupt: false,
        }
    }

    /// Whether this decision terminates evaluation.
    #[must_use]
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Self::Abstain)
    }
}

/// A named permission rule.
///
/// Implementations must be deterministic: the same `(tool_name, input)`
/// always yields the same decision, which is what makes the per-session
/// decision cache and audit replay sound.
pub trait Policy: Send + Sync {
    /// Stable policy name, recorded on every decision.
    fn name(&self) -> &str;

    /// Evaluate one tool call.
    fn evaluate(&self, tool_name: &str, input: &Value) -> PolicyDecision;
}

/// The engine's verdict for one tool call: the first decisive policy
/// decision, or a default-allow when every policy abstained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDecision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Name of the deciding policy; `None` when all abstained.
    pub policy_name: Option<String>,
    /// Reason attached to a deny (or an explicit allow).
    pub reason: Option<String>,
    /// Whether the turn should be interrupted.
    pub interrupt: bool,
    /// Whether this verdict was served from the session cache.
    pub cached: bool,
}

impl EngineDecision {
    pub(crate) fn all_abstained() -> Self {
        Self {
            allowed: true,
            policy_name: None,
            reason: None,
            interrupt: false,
            cached: false,
        }
    }
}
