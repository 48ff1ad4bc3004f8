//! Test support: a scripted agent transport and store seeding helpers.
//!
//! The engine is exercised end-to-end in tests by scripting the frames a
//! child process would emit. Nothing here is used by production code.

use async_trait::async_trait;
use chrono::Utc;
use maestro_agent::{AgentConfig, AgentError, AgentResult, ChildTransport, TransportFactory};
use maestro_core::{SessionMode, UserId};
use maestro_store::{SessionConfig, SessionRecord, Store, UserQuotas, UserRecord, UserRole};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared script: canned child output, captured parent input.
///
/// When the output runs dry the transport *hangs* (like a real child that
/// is still working) rather than reporting EOF, so cancellation and
/// timeout paths can be exercised. Scripts ending in a result frame never
/// reach the hang.
#[derive(Debug, Default)]
pub struct Script {
    /// Lines the fake child will emit, in order.
    pub output: Mutex<VecDeque<String>>,
    /// Lines the parent wrote to the fake child.
    pub sent: Mutex<Vec<String>>,
    /// Report EOF instead of hanging once the output is drained.
    pub eof_when_empty: std::sync::atomic::AtomicBool,
}

impl Script {
    /// Build a script from output lines.
    #[must_use]
    pub fn with_output(lines: &[String]) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(lines.iter().cloned().collect()),
            sent: Mutex::new(Vec::new()),
            eof_when_empty: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Build a script that reports EOF after its last line (a child that
    /// exits mid-turn).
    #[must_use]
    pub fn with_output_then_eof(lines: &[String]) -> Arc<Self> {
        let script = Self::with_output(lines);
        script.eof_when_empty.store(true, Ordering::SeqCst);
        script
    }

    /// Lines the parent sent so far.
    #[must_use]
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Append more output (e.g. for a second turn).
    pub fn push_output(&self, lines: &[String]) {
        if let Ok(mut output) = self.output.lock() {
            output.extend(lines.iter().cloned());
        }
    }
}

/// Sentinel output line: popping it makes the transport report EOF once,
/// as if the child died mid-turn. Lines after it serve the next attempt.
pub const EOF_MARKER: &str = "<<eof>>";

/// Transport that replays a [`Script`].
pub struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl ChildTransport for ScriptedTransport {
    async fn send_line(&mut self, line: &str) -> AgentResult<()> {
        if let Ok(mut sent) = self.script.sent.lock() {
            sent.push(line.to_string());
        }
        Ok(())
    }

    async fn recv_line(&mut self) -> AgentResult<Option<String>> {
        loop {
            let line = self
                .script
                .output
                .lock()
                .ok()
                .and_then(|mut o| o.pop_front());
            if let Some(line) = line {
                if line == EOF_MARKER {
                    return Ok(None);
                }
                return Ok(Some(line));
            }
            if self.script.eof_when_empty.load(Ordering::SeqCst) {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> AgentResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> AgentResult<()> {
        Ok(())
    }
}

/// Factory producing [`ScriptedTransport`]s, optionally failing the first
/// N spawns with a transient error (connect-retry testing).
pub struct ScriptedFactory {
    script: Arc<Script>,
    transient_failures: AtomicU32,
}

impl ScriptedFactory {
    /// Factory over a script.
    #[must_use]
    pub fn new(script: Arc<Script>) -> Self {
        Self {
            script,
            transient_failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` spawns with a transient error.
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    type Transport = ScriptedTransport;

    async fn spawn(&self, _config: &AgentConfig) -> AgentResult<ScriptedTransport> {
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(AgentError::Transient("scripted spawn failure".into()));
        }
        Ok(ScriptedTransport {
            script: Arc::clone(&self.script),
        })
    }
}

// -- frame line builders --

/// An assistant frame with a single text block.
#[must_use]
pub fn text_frame(text: &str) -> String {
    format!(
        r#"{{"type":"assistant","content":[{{"type":"text","text":{}}}],"model":"test-model"}}"#,
        serde_json::Value::String(text.to_string())
    )
}

/// An assistant frame invoking one tool.
#[must_use]
pub fn tool_use_frame(tool_use_id: &str, tool_name: &str, input: &serde_json::Value) -> String {
    format!(
        r#"{{"type":"assistant","content":[{{"type":"tool_use","id":"{tool_use_id}","name":"{tool_name}","input":{input}}}],"model":"test-model"}}"#
    )
}

/// An assistant frame carrying one tool result.
#[must_use]
pub fn tool_result_frame(tool_use_id: &str, content: &str, is_error: bool) -> String {
    format!(
        r#"{{"type":"assistant","content":[{{"type":"tool_result","tool_use_id":"{tool_use_id}","content":{},"is_error":{is_error}}}]}}"#,
        serde_json::Value::String(content.to_string())
    )
}

/// A permission-request frame.
#[must_use]
pub fn permission_request_frame(
    tool_use_id: &str,
    tool_name: &str,
    input: &serde_json::Value,
) -> String {
    format!(
        r#"{{"type":"permission_request","tool_use_id":"{tool_use_id}","tool_name":"{tool_name}","input":{input}}}"#
    )
}

/// A stream-event (partial text delta) frame.
#[must_use]
pub fn stream_event_frame(delta: &str) -> String {
    format!(
        r#"{{"type":"stream_event","event":"text_delta","delta":{}}}"#,
        serde_json::Value::String(delta.to_string())
    )
}

/// An end-of-turn result frame.
#[must_use]
pub fn result_frame(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> String {
    format!(
        r#"{{"type":"result","stop_reason":"end_turn","duration_ms":50,"num_turns":1,"total_cost_usd":{cost_usd},"usage":{{"input_tokens":{input_tokens},"output_tokens":{output_tokens}}}}}"#
    )
}

// -- store seeding --

/// Insert a user with the given quotas.
#[must_use]
pub fn seed_user(store: &Store, max_sessions: u32, budget_usd: f64) -> UserId {
    let user = UserRecord {
        id: UserId::new(),
        email: format!("{}@example.com", UserId::new()),
        password_hash: "test-hash".into(),
        role: UserRole::User,
        quotas: UserQuotas {
            max_concurrent_sessions: max_sessions,
            monthly_budget_usd: budget_usd,
        },
        created_at: Utc::now(),
        deleted_at: None,
    };
    store.insert_user(&user).expect("seed user");
    user.id
}

/// Insert a session in CREATED with the given config.
#[must_use]
pub fn seed_session(
    store: &Store,
    user_id: UserId,
    mode: SessionMode,
    config: SessionConfig,
) -> SessionRecord {
    let mut record = SessionRecord::new(user_id, mode, format!("/tmp/maestro-test/{user_id}"));
    record.config = config;
    store.insert_session(&record).expect("seed session");
    record
}
