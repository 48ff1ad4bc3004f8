//! Execution strategies.
//!
//! All three strategies drive the same per-session machinery — a
//! connected [`AgentClient`] plus a [`MessagePipeline`] — and differ only
//! in how turns are shaped:
//!
//! - **Interactive**: partials on, a live message stream per turn, the
//!   session stays usable for further turns.
//! - **Background**: partials off, the whole turn wrapped in a retry
//!   policy, exactly one turn per execute.
//! - **Forked**: interactive behavior over a cloned workdir and copied
//!   history; the copied history is summarized into the first prompt
//!   because the agent CLI cannot be re-seeded with a transcript.

use maestro_agent::{AgentClient, AgentConfig, Backoff, TransportFactory};
use maestro_core::{SessionId, SessionMetrics};
use maestro_store::{MessageRecord, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::pipeline::{MessagePipeline, TurnOutcome};

/// Buffer size for the interactive message stream.
pub(crate) const STREAM_BUFFER: usize = 64;

/// Outcome of a background execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Whether the turn completed.
    pub success: bool,
    /// Final assistant text, when successful.
    pub data: Option<String>,
    /// Failure description, when not.
    pub error: Option<String>,
    /// Turn-level retries performed.
    pub retry_count: u32,
    /// Turn details, when a turn completed.
    pub outcome: Option<TurnOutcome>,
}

/// The per-session execution machinery the coordinator keeps alive.
pub struct SessionRuntime<F: TransportFactory + 'static> {
    pub(crate) session_id: SessionId,
    agent_config: AgentConfig,
    factory: Arc<F>,
    client: AgentClient<Arc<F>>,
    pub(crate) pipeline: MessagePipeline,
    pub(crate) cancel: CancellationToken,
    timeout: Duration,
    max_retries: u32,
    retry_delay_ms: u64,
    /// History summary a fork prepends to its first prompt.
    fork_seed: Option<String>,
}

impl<F: TransportFactory + 'static> SessionRuntime<F> {
    /// Assemble the runtime for one session.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session_id: SessionId,
        agent_config: AgentConfig,
        factory: Arc<F>,
        pipeline: MessagePipeline,
        timeout: Duration,
        max_retries: u32,
        retry_delay_ms: u64,
        fork_seed: Option<String>,
    ) -> Self {
        let client = AgentClient::new(agent_config.clone(), Arc::clone(&factory));
        Self {
            session_id,
            agent_config,
            factory,
            client,
            pipeline,
            cancel: CancellationToken::new(),
            timeout,
            max_retries,
            retry_delay_ms,
            fork_seed,
        }
    }

    /// Connect the agent subprocess.
    pub async fn connect(&mut self) -> RuntimeResult<()> {
        self.client.connect().await?;
        Ok(())
    }

    /// Interrupt and disconnect, returning client metrics if possible.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let _ = self.client.interrupt().await;
        if let Err(e) = self.client.disconnect().await {
            warn!(session_id = %self.session_id, error = %e, "disconnect failed");
        }
    }

    /// Replace a dead client with a fresh subprocess (turn-level retry).
    async fn reconnect(&mut self) -> RuntimeResult<()> {
        let _ = self.client.disconnect().await;
        self.client = AgentClient::new(self.agent_config.clone(), Arc::clone(&self.factory));
        self.client.connect().await?;
        Ok(())
    }

    /// Fold the fork's history seed into the first prompt.
    fn effective_prompt(&mut self, prompt: &str) -> String {
        match self.fork_seed.take() {
            Some(seed) => format!("{seed}\n\n{prompt}"),
            None => prompt.to_string(),
        }
    }

    /// One interactive turn, streaming persisted messages into `stream`.
    ///
    /// The session remains usable for further turns afterwards.
    pub async fn execute_interactive(
        &mut self,
        prompt: &str,
        stream: Option<mpsc::Sender<MessageRecord>>,
    ) -> RuntimeResult<TurnOutcome> {
        let prompt = self.effective_prompt(prompt);
        self.pipeline.set_subscriber(stream);
        let result = self
            .pipeline
            .run_turn(&mut self.client, &prompt, self.timeout, &self.cancel)
            .await;
        self.pipeline.set_subscriber(None);
        result
    }

    /// One background turn with turn-level retry.
    ///
    /// On a transient failure the whole turn re-executes (fresh
    /// subprocess, same prompt) up to `max_retries` times. Cancellation
    /// and timeouts are terminal for a background execution.
    pub async fn execute_background(&mut self, prompt: &str, store: &Store) -> ExecutionResult {
        let prompt = self.effective_prompt(prompt);
        let mut backoff = Backoff::new(self.retry_delay_ms, 60_000);
        let mut retry_count: u32 = 0;

        loop {
            let result = self
                .pipeline
                .run_turn(&mut self.client, &prompt, self.timeout, &self.cancel)
                .await;

            match result {
                Ok(outcome) => {
                    return ExecutionResult {
                        success: true,
                        data: outcome.final_text.clone(),
                        error: None,
                        retry_count,
                        outcome: Some(outcome),
                    };
                },
                Err(e) if e.is_transient() && retry_count < self.max_retries => {
                    retry_count += 1;
                    let delta = SessionMetrics {
                        total_retries: 1,
                        ..SessionMetrics::default()
                    };
                    if let Err(store_err) =
                        store.increment_session_metrics(self.session_id, &delta)
                    {
                        warn!(
                            session_id = %self.session_id,
                            error = %store_err,
                            "failed to count retry"
                        );
                    }
                    let delay = backoff.next_delay();
                    info!(
                        session_id = %self.session_id,
                        attempt = retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient turn failure; re-executing"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(reconnect_err) = self.reconnect().await {
                        return ExecutionResult {
                            success: false,
                            data: None,
                            error: Some(reconnect_err.to_string()),
                            retry_count,
                            outcome: None,
                        };
                    }
                },
                Err(e) => {
                    return ExecutionResult {
                        success: false,
                        data: None,
                        error: Some(e.to_string()),
                        retry_count,
                        outcome: None,
                    };
                },
            }
        }
    }
}

/// Build the history seed a forked session carries into its first turn.
///
/// The agent CLI cannot be re-seeded with a transcript, so the copied
/// prefix is summarized as plain text (decision recorded in DESIGN.md).
#[must_use]
pub fn fork_history_seed(messages: &[MessageRecord]) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let mut lines = vec![
        "Context: this session continues an earlier conversation. Prior exchange:".to_string(),
    ];
    for message in messages {
        let who = match message.direction {
            maestro_core::Direction::UserToAgent => "user",
            maestro_core::Direction::AgentToUser => "assistant",
        };
        for block in &message.blocks {
            match block {
                maestro_core::ContentBlock::Text { text } => {
                    let text: String = text.chars().take(400).collect();
                    lines.push(format!("[{who}] {text}"));
                },
                maestro_core::ContentBlock::ToolUse { tool_name, .. } => {
                    lines.push(format!("[{who}] (used tool {tool_name})"));
                },
                maestro_core::ContentBlock::ToolResult { .. }
                | maestro_core::ContentBlock::Thinking { .. } => {},
            }
        }
    }
    Some(lines.join("\n"))
}

impl ExecutionResult {
    /// Error text or a generic fallback.
    #[must_use]
    pub fn error_or_default(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "execution failed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{ContentBlock, Direction, MessageId};

    fn message(direction: Direction, blocks: Vec<ContentBlock>) -> MessageRecord {
        MessageRecord {
            id: MessageId::new(),
            session_id: SessionId::new(),
            sequence: 1,
            direction,
            blocks,
            model: None,
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            is_partial: false,
            parent_message_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn fork_seed_summarizes_text_and_tools() {
        let messages = vec![
            message(Direction::UserToAgent, vec![ContentBlock::text("fix the bug")]),
            message(
                Direction::AgentToUser,
                vec![
                    ContentBlock::ToolUse {
                        tool_use_id: "tu_1".into(),
                        tool_name: "Read".into(),
                        input: serde_json::json!({}),
                    },
                    ContentBlock::text("found it"),
                ],
            ),
        ];
        let seed = fork_history_seed(&messages).expect("seed");
        assert!(seed.contains("[user] fix the bug"));
        assert!(seed.contains("(used tool Read)"));
        assert!(seed.contains("[assistant] found it"));
    }

    #[test]
    fn empty_history_has_no_seed() {
        assert!(fork_history_seed(&[]).is_none());
    }
}
