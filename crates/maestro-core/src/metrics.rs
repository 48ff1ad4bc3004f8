//! Token usage and per-session metric counters.

use serde::{Deserialize, Serialize};

/// Token usage reported by the agent for one turn (or accumulated).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Tokens written to the prompt cache.
    pub cache_creation_tokens: u64,
    /// Tokens read from the prompt cache.
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }

    /// Whether any tokens were counted at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Monotonic per-session counters.
///
/// The store updates these with atomic in-place increments; this struct is
/// the read-side snapshot and the shape carried by metric snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Non-partial messages persisted.
    pub total_messages: u64,
    /// Tool executions recorded.
    pub total_tool_calls: u64,
    /// Hook invocations recorded.
    pub total_hook_executions: u64,
    /// Permission evaluations recorded.
    pub total_permission_checks: u64,
    /// Errors swallowed or surfaced on this session.
    pub total_errors: u64,
    /// Turn- and connect-level retries performed.
    pub total_retries: u64,
    /// Accumulated cost in USD.
    pub cost_usd: f64,
    /// Accumulated token usage.
    pub usage: TokenUsage,
    /// Wall-clock milliseconds spent in turns.
    pub duration_ms: u64,
}

impl SessionMetrics {
    /// Merge a per-turn delta into this snapshot.
    pub fn merge(&mut self, delta: &Self) {
        self.total_messages = self.total_messages.saturating_add(delta.total_messages);
        self.total_tool_calls = self.total_tool_calls.saturating_add(delta.total_tool_calls);
        self.total_hook_executions = self
            .total_hook_executions
            .saturating_add(delta.total_hook_executions);
        self.total_permission_checks = self
            .total_permission_checks
            .saturating_add(delta.total_permission_checks);
        self.total_errors = self.total_errors.saturating_add(delta.total_errors);
        self.total_retries = self.total_retries.saturating_add(delta.total_retries);
        self.cost_usd += delta.cost_usd;
        self.usage.add(delta.usage);
        self.duration_ms = self.duration_ms.saturating_add(delta.duration_ms);
    }
}
