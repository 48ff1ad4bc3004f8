//! The agent client state machine.

use maestro_core::TokenUsage;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::frame::{Frame, OutboundFrame};
use crate::transport::{ChildTransport, TransportFactory};

/// Grace window between SIGTERM and SIGKILL on interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Cap for connect backoff delays.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Client lifecycle states; transitions are guarded and an illegal call
/// fails with [`AgentError::InvalidState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Built, no subprocess yet.
    Created,
    /// Spawn/handshake in progress.
    Connecting,
    /// Subprocess live, no turn in flight.
    Connected,
    /// A turn is in flight.
    Querying,
    /// Drain and reap in progress.
    Disconnecting,
    /// Subprocess reaped; the client is spent.
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Querying => "querying",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Per-client counters, returned by [`AgentClient::disconnect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetrics {
    /// Frames successfully parsed.
    pub frames_received: u64,
    /// Lines that failed to parse (skipped with a warning).
    pub parse_errors: u64,
    /// Connect-level retries performed.
    pub retries: u64,
    /// Turns completed (result frames seen).
    pub turns: u32,
    /// Usage accumulated from result frames.
    pub usage: TokenUsage,
}

/// Owns one agent subprocess for one session.
pub struct AgentClient<F: TransportFactory> {
    config: AgentConfig,
    factory: F,
    state: ClientState,
    transport: Option<F::Transport>,
    metrics: ClientMetrics,
}

impl<F: TransportFactory> AgentClient<F> {
    /// Build a client in `Created`.
    #[must_use]
    pub fn new(config: AgentConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            state: ClientState::Created,
            transport: None,
            metrics: ClientMetrics::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Metrics so far.
    #[must_use]
    pub fn metrics(&self) -> ClientMetrics {
        self.metrics
    }

    fn guard(&self, operation: &'static str, expected: &[ClientState]) -> AgentResult<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(AgentError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Spawn the subprocess, retrying transient failures with full-jitter
    /// exponential backoff up to `max_retries`.
    pub async fn connect(&mut self) -> AgentResult<()> {
        self.guard("connect", &[ClientState::Created])?;
        self.state = ClientState::Connecting;

        let mut backoff = Backoff::new(self.config.retry_delay_ms, MAX_BACKOFF_MS);
        loop {
            match self.factory.spawn(&self.config).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.state = ClientState::Connected;
                    info!(
                        model = %self.config.model,
                        workdir = %self.config.workdir.display(),
                        attempts = backoff.attempt() + 1,
                        "agent connected"
                    );
                    return Ok(());
                },
                Err(e) if e.is_transient() && backoff.attempt() < self.config.max_retries => {
                    let delay = backoff.next_delay();
                    self.metrics.retries += 1;
                    warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient connect failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    self.state = ClientState::Created;
                    return Err(e);
                },
            }
        }
    }

    /// Start a turn by writing a user frame.
    pub async fn query(&mut self, prompt: &str) -> AgentResult<()> {
        self.guard("query", &[ClientState::Connected])?;
        let transport = self.transport.as_mut().ok_or(AgentError::NotConnected)?;
        let line = OutboundFrame::User {
            prompt: prompt.to_string(),
        }
        .to_line()
        .map_err(|e| AgentError::Fatal(format!("frame encoding: {e}")))?;
        transport.send_line(&line).await?;
        self.state = ClientState::Querying;
        Ok(())
    }

    /// Read the next frame of the in-flight turn.
    ///
    /// Unparsable lines are counted and skipped. Returns `None` when the
    /// child closes its stream; a result frame returns the client to
    /// `Connected` so another turn may start.
    pub async fn next_frame(&mut self) -> AgentResult<Option<Frame>> {
        self.guard("receive", &[ClientState::Querying])?;
        let transport = self.transport.as_mut().ok_or(AgentError::NotConnected)?;
        loop {
            let Some(line) = transport.recv_line().await? else {
                debug!("agent closed its stream");
                self.state = ClientState::Connected;
                return Ok(None);
            };
            if line.is_empty() {
                continue;
            }
            match Frame::parse(&line) {
                Ok(frame) => {
                    self.metrics.frames_received += 1;
                    if let Frame::Result { usage, .. } = &frame {
                        self.metrics.turns += 1;
                        self.metrics.usage.add((*usage).into());
                        self.state = ClientState::Connected;
                    }
                    return Ok(Some(frame));
                },
                Err(e) => {
                    self.metrics.parse_errors += 1;
                    warn!(error = %e, line_len = line.len(), "skipping unparsable frame");
                },
            }
        }
    }

    /// Answer a pending permission request.
    pub async fn respond_permission(
        &mut self,
        tool_use_id: &str,
        allow: bool,
        reason: Option<&str>,
    ) -> AgentResult<()> {
        self.guard("respond_permission", &[ClientState::Querying])?;
        let transport = self.transport.as_mut().ok_or(AgentError::NotConnected)?;
        let line = OutboundFrame::PermissionResponse {
            tool_use_id: tool_use_id.to_string(),
            allow,
            reason: reason.map(ToString::to_string),
        }
        .to_line()
        .map_err(|e| AgentError::Fatal(format!("frame encoding: {e}")))?;
        transport.send_line(&line).await?;
        Ok(())
    }

    /// Soft-cancel the in-flight turn: SIGTERM, then SIGKILL after a
    /// grace window.
    pub async fn interrupt(&mut self) -> AgentResult<()> {
        self.guard(
            "interrupt",
            &[ClientState::Connected, ClientState::Querying],
        )?;
        if let Some(transport) = self.transport.as_mut() {
            transport.terminate(INTERRUPT_GRACE).await?;
        }
        self.state = ClientState::Connected;
        Ok(())
    }

    /// Drain, close, and reap; returns accumulated metrics.
    pub async fn disconnect(&mut self) -> AgentResult<ClientMetrics> {
        self.guard(
            "disconnect",
            &[
                ClientState::Created,
                ClientState::Connected,
                ClientState::Querying,
            ],
        )?;
        self.state = ClientState::Disconnecting;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        self.state = ClientState::Closed;
        info!(
            frames = self.metrics.frames_received,
            turns = self.metrics.turns,
            "agent disconnected"
        );
        Ok(self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::PermissionMode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted transport: canned output lines, captured input lines.
    #[derive(Default)]
    struct Script {
        output: Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
    }

    struct ScriptedTransport {
        script: Arc<Script>,
    }

    #[async_trait]
    impl ChildTransport for ScriptedTransport {
        async fn send_line(&mut self, line: &str) -> AgentResult<()> {
            self.script
                .sent
                .lock()
                .expect("lock")
                .push(line.to_string());
            Ok(())
        }

        async fn recv_line(&mut self) -> AgentResult<Option<String>> {
            Ok(self.script.output.lock().expect("lock").pop_front())
        }

        async fn terminate(&mut self, _grace: Duration) -> AgentResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> AgentResult<()> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        script: Arc<Script>,
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        type Transport = ScriptedTransport;

        async fn spawn(&self, _config: &AgentConfig) -> AgentResult<ScriptedTransport> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(AgentError::Transient("spawn EAGAIN".into()));
            }
            Ok(ScriptedTransport {
                script: Arc::clone(&self.script),
            })
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            cli_path: "/usr/bin/agent".into(),
            workdir: "/tmp".into(),
            model: "test-model".into(),
            allowed_tools: vec![],
            permission_mode: PermissionMode::Default,
            include_partial_messages: false,
            tool_providers: vec![],
            sdk_options: std::collections::BTreeMap::new(),
            max_retries: 2,
            retry_delay_ms: 0,
        }
    }

    fn client_with(
        lines: &[&str],
        failures: u32,
    ) -> (AgentClient<ScriptedFactory>, Arc<Script>) {
        let script = Arc::new(Script {
            output: Mutex::new(lines.iter().map(ToString::to_string).collect()),
            sent: Mutex::new(Vec::new()),
        });
        let factory = ScriptedFactory {
            script: Arc::clone(&script),
            failures_remaining: AtomicU32::new(failures),
        };
        (AgentClient::new(config(), factory), script)
    }

    const RESULT_LINE: &str = r#"{"type":"result","stop_reason":"end_turn","duration_ms":10,"num_turns":1,"usage":{"input_tokens":5,"output_tokens":3}}"#;

    #[tokio::test]
    async fn full_turn_lifecycle() {
        let (mut client, script) = client_with(
            &[
                r#"{"type":"assistant","content":[{"type":"text","text":"hi"}]}"#,
                RESULT_LINE,
            ],
            0,
        );
        assert_eq!(client.state(), ClientState::Created);

        client.connect().await.expect("connect");
        assert_eq!(client.state(), ClientState::Connected);

        client.query("hello").await.expect("query");
        assert_eq!(client.state(), ClientState::Querying);

        let first = client.next_frame().await.expect("frame").expect("some");
        assert!(matches!(first, Frame::Assistant { .. }));
        let second = client.next_frame().await.expect("frame").expect("some");
        assert!(second.is_turn_end());
        assert_eq!(client.state(), ClientState::Connected);

        let metrics = client.disconnect().await.expect("disconnect");
        assert_eq!(metrics.frames_received, 2);
        assert_eq!(metrics.turns, 1);
        assert_eq!(metrics.usage.input_tokens, 5);
        assert_eq!(client.state(), ClientState::Closed);

        let sent = script.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("hello"));
    }

    #[tokio::test]
    async fn connect_retries_transient_failures() {
        let (mut client, _script) = client_with(&[], 2);
        client.connect().await.expect("connect after retries");
        assert_eq!(client.metrics().retries, 2);
    }

    #[tokio::test]
    async fn connect_gives_up_past_max_retries() {
        let (mut client, _script) = client_with(&[], 5);
        let err = client.connect().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.state(), ClientState::Created);
    }

    #[tokio::test]
    async fn illegal_calls_fail_with_invalid_state() {
        let (mut client, _script) = client_with(&[], 0);
        // Query before connect.
        assert!(matches!(
            client.query("x").await.unwrap_err(),
            AgentError::InvalidState { .. }
        ));
        client.connect().await.expect("connect");
        // Receive outside a turn.
        assert!(matches!(
            client.next_frame().await.unwrap_err(),
            AgentError::InvalidState { .. }
        ));
        // Double connect.
        assert!(matches!(
            client.connect().await.unwrap_err(),
            AgentError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn unparsable_lines_are_skipped_and_counted() {
        let (mut client, _script) = client_with(
            &[
                "not json at all",
                r#"{"type":"mystery"}"#,
                RESULT_LINE,
            ],
            0,
        );
        client.connect().await.expect("connect");
        client.query("x").await.expect("query");

        let frame = client.next_frame().await.expect("frame").expect("some");
        assert!(frame.is_turn_end());
        assert_eq!(client.metrics().parse_errors, 2);
    }

    #[tokio::test]
    async fn eof_mid_turn_returns_none() {
        let (mut client, _script) = client_with(&[], 0);
        client.connect().await.expect("connect");
        client.query("x").await.expect("query");
        assert!(client.next_frame().await.expect("frame").is_none());
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn permission_response_reaches_the_child() {
        let (mut client, script) = client_with(&[RESULT_LINE], 0);
        client.connect().await.expect("connect");
        client.query("x").await.expect("query");
        client
            .respond_permission("tu_3", false, Some("restricted"))
            .await
            .expect("respond");

        let sent = script.sent.lock().expect("lock");
        assert!(sent[1].contains("\"allow\":false"));
        assert!(sent[1].contains("tu_3"));
    }

    #[tokio::test]
    async fn disconnect_twice_is_an_error() {
        let (mut client, _script) = client_with(&[], 0);
        client.connect().await.expect("connect");
        client.disconnect().await.expect("first");
        assert!(matches!(
            client.disconnect().await.unwrap_err(),
            AgentError::InvalidState { .. }
        ));
    }
}
