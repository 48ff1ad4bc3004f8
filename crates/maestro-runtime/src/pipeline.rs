//! The message pipeline: frames in, persistent effects out.
//!
//! One pipeline instance drives one session and is strictly sequential:
//! for every frame, persistence happens first, then hooks, then the
//! permission check, then accounting, then broadcast. The order messages
//! are persisted in is the order the child emitted them.

use chrono::Utc;
use maestro_agent::{AgentClient, AgentError, Frame, TransportFactory, WireBlock};
use maestro_core::{
    ContentBlock, HookKind, PermissionDecisionId, SessionId, TokenUsage, ToolExecutionId, UserId,
};
use maestro_events::{EventBus, MaestroEvent};
use maestro_hooks::HookDispatcher;
use maestro_policy::{EngineDecision, PolicyEngine};
use maestro_store::{
    MessageRecord, NewMessage, PermissionDecisionRecord, PermissionVerdict, Store, StoreError,
    ToolExecutionRecord, ToolStatus,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accountant::CostAccountant;
use crate::error::{RuntimeError, RuntimeResult};

/// What a finished turn reports back to its executor.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Stop reason from the result frame.
    pub stop_reason: Option<String>,
    /// Usage for the turn.
    pub usage: TokenUsage,
    /// Cost accounted for the turn.
    pub cost_usd: f64,
    /// Turn duration as the agent measured it.
    pub duration_ms: u64,
    /// Model turns taken inside the agent.
    pub num_turns: u32,
    /// Last assistant text, for background results.
    pub final_text: Option<String>,
    /// Frames processed.
    pub frames: u64,
}

/// Per-session frame processor.
pub struct MessagePipeline {
    session_id: SessionId,
    user_id: UserId,
    model: String,
    include_partials: bool,
    store: Arc<Store>,
    dispatcher: HookDispatcher,
    policy: PolicyEngine,
    bus: EventBus,
    accountant: Arc<CostAccountant>,
    /// Live-stream subscriber (interactive executor). Bounded; partials
    /// are dropped on overflow, non-partials never.
    subscriber: Option<mpsc::Sender<MessageRecord>>,
    warned_overflow: bool,
}

impl MessagePipeline {
    /// Build a pipeline for one session.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        model: String,
        include_partials: bool,
        store: Arc<Store>,
        dispatcher: HookDispatcher,
        policy: PolicyEngine,
        bus: EventBus,
        accountant: Arc<CostAccountant>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            model,
            include_partials,
            store,
            dispatcher,
            policy,
            bus,
            accountant,
            subscriber: None,
            warned_overflow: false,
        }
    }

    /// Attach a live message subscriber for this turn (interactive mode).
    pub fn set_subscriber(&mut self, tx: Option<mpsc::Sender<MessageRecord>>) {
        self.subscriber = tx;
        self.warned_overflow = false;
    }

    /// Run one full turn: prompt in, frames drained through the effect
    /// chain, result frame out.
    ///
    /// Cancellation (terminate or the per-turn timeout) interrupts the
    /// child and returns [`RuntimeError::Cancelled`]; everything persisted
    /// up to that point is kept.
    pub async fn run_turn<F: TransportFactory>(
        &mut self,
        client: &mut AgentClient<F>,
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RuntimeResult<TurnOutcome> {
        // User-prompt hooks may rewrite or block the prompt.
        let mut payload = Map::new();
        payload.insert("prompt".into(), Value::String(prompt.to_string()));
        let dispatch = self
            .dispatcher
            .dispatch(self.session_id, HookKind::UserPromptSubmit, None, payload)
            .await;
        if !dispatch.continue_execution {
            let reason = dispatch
                .output
                .get("block_reason")
                .and_then(Value::as_str)
                .unwrap_or("blocked by hook");
            return Err(RuntimeError::Validation(format!(
                "prompt rejected: {reason}"
            )));
        }
        let prompt = dispatch
            .output
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or(prompt)
            .to_string();

        // Persisting the prompt is the turn's point of no return; a store
        // failure here fails the turn before the child sees anything.
        let record = self
            .store
            .insert_message(NewMessage::user_prompt(self.session_id, &prompt))?;
        self.broadcast_message(&record).await;

        client.query(&prompt).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut outcome = TurnOutcome::default();
        // Verdicts recorded at tool-use time, answered at permission-request time.
        let mut verdicts: HashMap<String, EngineDecision> = HashMap::new();

        loop {
            enum Step {
                Cancelled,
                TimedOut,
                Frame(maestro_agent::AgentResult<Option<Frame>>),
            }
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                () = tokio::time::sleep_until(deadline) => Step::TimedOut,
                frame = client.next_frame() => Step::Frame(frame),
            };
            let frame = match step {
                Step::Cancelled => {
                    let _ = client.interrupt().await;
                    return Err(RuntimeError::Cancelled("terminated"));
                },
                Step::TimedOut => {
                    let _ = client.interrupt().await;
                    return Err(RuntimeError::Cancelled("timeout"));
                },
                Step::Frame(frame) => frame?,
            };

            let Some(frame) = frame else {
                return Err(RuntimeError::Agent(AgentError::Transient(
                    "agent stream ended before the result frame".into(),
                )));
            };
            outcome.frames += 1;

            match frame {
                Frame::Assistant {
                    content,
                    model,
                    usage,
                } => {
                    self.handle_assistant(client, content, model, usage, &mut outcome, &mut verdicts)
                        .await?;
                },
                Frame::StreamEvent { event, delta, .. } => {
                    self.handle_stream_event(&event, &delta).await?;
                },
                Frame::PermissionRequest {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    self.handle_permission_request(client, &tool_use_id, &tool_name, &input, &mut verdicts)
                        .await?;
                },
                Frame::Result {
                    stop_reason,
                    duration_ms,
                    num_turns,
                    total_cost_usd,
                    usage,
                } => {
                    let usage: TokenUsage = usage.into();
                    // End of turn: account, then stop hooks, then broadcast.
                    let cost = self.accountant.record_turn(
                        self.session_id,
                        self.user_id,
                        &self.model,
                        usage,
                        duration_ms,
                        total_cost_usd,
                    )?;

                    let mut payload = Map::new();
                    payload.insert(
                        "stop_reason".into(),
                        stop_reason.clone().map_or(Value::Null, Value::String),
                    );
                    payload.insert("cost_usd".into(), Value::from(cost));
                    self.dispatcher
                        .dispatch(self.session_id, HookKind::Stop, None, payload)
                        .await;

                    self.bus.publish(MaestroEvent::TurnCompleted {
                        session_id: self.session_id,
                        usage,
                        cost_usd: cost,
                    });

                    outcome.stop_reason = stop_reason;
                    outcome.usage = usage;
                    outcome.cost_usd = cost;
                    outcome.duration_ms = duration_ms;
                    outcome.num_turns = num_turns;
                    return Ok(outcome);
                },
            }
        }
    }

    async fn handle_assistant<F: TransportFactory>(
        &mut self,
        client: &mut AgentClient<F>,
        content: Vec<WireBlock>,
        model: Option<String>,
        usage: maestro_agent::WireUsage,
        outcome: &mut TurnOutcome,
        verdicts: &mut HashMap<String, EngineDecision>,
    ) -> RuntimeResult<()> {
        let blocks: Vec<ContentBlock> = content.into_iter().map(Into::into).collect();
        for block in &blocks {
            if let ContentBlock::Text { text } = block {
                outcome.final_text = Some(text.clone());
            }
        }

        let usage: TokenUsage = usage.into();
        let mut message = NewMessage::agent(self.session_id, blocks.clone());
        message.model = model;
        if !usage.is_empty() {
            message.tokens_in = Some(usage.input_tokens);
            message.tokens_out = Some(usage.output_tokens);
        }
        let record = self.store.insert_message(message)?;
        // Any buffered partials belong to this completion.
        self.store
            .adopt_orphan_partials(self.session_id, record.id)?;
        self.broadcast_message(&record).await;

        for block in blocks {
            match block {
                ContentBlock::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    self.handle_tool_use(client, &tool_use_id, &tool_name, &input, verdicts)
                        .await?;
                },
                ContentBlock::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                } => {
                    self.handle_tool_result(&tool_use_id, &output, is_error)
                        .await?;
                },
                ContentBlock::Text { .. } | ContentBlock::Thinking { .. } => {},
            }
        }
        Ok(())
    }

    /// Pre-hooks, then the permission check — both complete before the
    /// tool is allowed to run.
    async fn handle_tool_use<F: TransportFactory>(
        &mut self,
        client: &mut AgentClient<F>,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
        verdicts: &mut HashMap<String, EngineDecision>,
    ) -> RuntimeResult<()> {
        let mut payload = Map::new();
        payload.insert("tool_name".into(), Value::String(tool_name.to_string()));
        payload.insert("input".into(), input.clone());
        let dispatch = self
            .dispatcher
            .dispatch(
                self.session_id,
                HookKind::PreToolUse,
                Some(tool_use_id),
                payload,
            )
            .await;

        self.ensure_tool_row(tool_use_id, tool_name, input)?;

        if !dispatch.continue_execution {
            // Hook veto: deny without consulting policies.
            let reason = dispatch
                .output
                .get("block_reason")
                .and_then(Value::as_str)
                .map_or_else(|| "blocked_by_hook".to_string(), |r| format!("blocked_by_hook: {r}"));
            self.persist_synthetic_denial(tool_use_id, &reason, PermissionVerdict::NotChecked)
                .await?;
            let _ = client.respond_permission(tool_use_id, false, Some(&reason)).await;
            // The veto is final for this call: record it so a later
            // permission-request frame is answered with the same denial
            // instead of falling through to a fresh policy evaluation.
            verdicts.insert(
                tool_use_id.to_string(),
                EngineDecision {
                    allowed: false,
                    policy_name: None,
                    reason: Some(reason),
                    interrupt: false,
                    cached: false,
                },
            );
            return Ok(());
        }

        let decision = self.policy.evaluate(tool_name, input);
        self.persist_decision(tool_name, input, &decision)?;
        self.bus.publish(MaestroEvent::PermissionDecided {
            session_id: self.session_id,
            tool_name: tool_name.to_string(),
            allowed: decision.allowed,
            policy: decision.policy_name.clone(),
        });

        if decision.allowed {
            self.store.update_tool_permission(
                self.session_id,
                tool_use_id,
                PermissionVerdict::Allow,
                decision.reason.as_deref(),
            )?;
            self.store.mark_tool_running(self.session_id, tool_use_id)?;
            verdicts.insert(tool_use_id.to_string(), decision);
            return Ok(());
        }

        let reason = decision
            .reason
            .clone()
            .unwrap_or_else(|| "denied by policy".to_string());
        self.persist_synthetic_denial(tool_use_id, &reason, PermissionVerdict::Deny)
            .await?;
        let _ = client
            .respond_permission(tool_use_id, false, Some(&reason))
            .await;
        let interrupt = decision.interrupt;
        verdicts.insert(tool_use_id.to_string(), decision);

        if interrupt {
            let _ = client.interrupt().await;
            return Err(RuntimeError::Cancelled("interrupted by policy"));
        }
        Ok(())
    }

    async fn handle_tool_result(
        &mut self,
        tool_use_id: &str,
        output: &Value,
        is_error: bool,
    ) -> RuntimeResult<()> {
        let mut payload = Map::new();
        payload.insert("is_error".into(), Value::Bool(is_error));
        payload.insert("output".into(), output.clone());
        if let Ok(row) = self.store.get_tool_execution(self.session_id, tool_use_id) {
            payload.insert("tool_name".into(), Value::String(row.tool_name));
        }
        self.dispatcher
            .dispatch(
                self.session_id,
                HookKind::PostToolUse,
                Some(tool_use_id),
                payload,
            )
            .await;

        let status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        match self.store.complete_tool_execution(
            self.session_id,
            tool_use_id,
            status,
            Some(output),
            is_error.then_some("tool reported an error"),
        ) {
            Ok(()) => {},
            // A result for a call denied earlier keeps its DENIED row.
            Err(StoreError::NotFound { .. }) => {
                warn!(
                    session_id = %self.session_id,
                    tool_use_id,
                    "tool result without a matching execution row"
                );
            },
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn handle_stream_event(&mut self, event: &str, delta: &Value) -> RuntimeResult<()> {
        if !self.include_partials {
            return Ok(());
        }
        let text = delta
            .as_str()
            .map_or_else(|| delta.to_string(), ToString::to_string);
        let mut message = NewMessage::agent(
            self.session_id,
            vec![ContentBlock::Text { text }],
        );
        message.is_partial = true;
        let record = self.store.insert_message(message)?;
        debug!(
            session_id = %self.session_id,
            sequence = record.sequence,
            event,
            "partial persisted"
        );
        self.broadcast_message(&record).await;
        Ok(())
    }

    async fn handle_permission_request<F: TransportFactory>(
        &mut self,
        client: &mut AgentClient<F>,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
        verdicts: &mut HashMap<String, EngineDecision>,
    ) -> RuntimeResult<()> {
        let decision = if let Some(known) = verdicts.get(tool_use_id) {
            known.clone()
        } else {
            // The child asked about a call we have not vetted yet.
            let decision = self.policy.evaluate(tool_name, input);
            self.persist_decision(tool_name, input, &decision)?;
            verdicts.insert(tool_use_id.to_string(), decision.clone());
            decision
        };
        client
            .respond_permission(tool_use_id, decision.allowed, decision.reason.as_deref())
            .await?;
        Ok(())
    }

    fn ensure_tool_row(
        &self,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> RuntimeResult<()> {
        match self.store.get_tool_execution(self.session_id, tool_use_id) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                self.store.record_tool_start(&ToolExecutionRecord {
                    id: ToolExecutionId::new(),
                    session_id: self.session_id,
                    tool_use_id: tool_use_id.to_string(),
                    tool_name: tool_name.to_string(),
                    input: input.clone(),
                    output: None,
                    status: ToolStatus::Pending,
                    error_message: None,
                    duration_ms: None,
                    permission_decision: PermissionVerdict::NotChecked,
                    permission_reason: None,
                    started_at: Utc::now(),
                    completed_at: None,
                })?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    fn persist_decision(
        &self,
        tool_name: &str,
        input: &Value,
        decision: &EngineDecision,
    ) -> RuntimeResult<()> {
        self.store
            .insert_permission_decision(&PermissionDecisionRecord {
                id: PermissionDecisionId::new(),
                session_id: self.session_id,
                tool_name: tool_name.to_string(),
                input_snapshot: input.clone(),
                allowed: decision.allowed,
                policy_name: decision.policy_name.clone(),
                reason: decision.reason.clone(),
                interrupted: decision.interrupt,
                decided_at: Utc::now(),
            })?;
        Ok(())
    }

    /// Synthetic error result + DENIED tool row for a blocked call.
    async fn persist_synthetic_denial(
        &mut self,
        tool_use_id: &str,
        reason: &str,
        verdict: PermissionVerdict,
    ) -> RuntimeResult<()> {
        self.store.update_tool_permission(
            self.session_id,
            tool_use_id,
            verdict,
            Some(reason),
        )?;
        self.store.complete_tool_execution(
            self.session_id,
            tool_use_id,
            ToolStatus::Denied,
            None,
            Some(reason),
        )?;

        let record = self.store.insert_message(NewMessage::agent(
            self.session_id,
            vec![ContentBlock::error_result(tool_use_id, reason)],
        ))?;
        self.broadcast_message(&record).await;
        Ok(())
    }

    async fn broadcast_message(&mut self, record: &MessageRecord) {
        self.bus.publish(MaestroEvent::MessagePersisted {
            session_id: record.session_id,
            message_id: record.id,
            sequence: record.sequence,
            is_partial: record.is_partial,
        });

        let Some(tx) = self.subscriber.as_ref() else {
            return;
        };
        if record.is_partial {
            // Bounded buffer: partials are droppable, with one warning.
            if tx.try_send(record.clone()).is_err() && !self.warned_overflow {
                warn!(
                    session_id = %self.session_id,
                    "slow subscriber; dropping partial-message frames"
                );
                self.warned_overflow = true;
            }
        } else if tx.send(record.clone()).await.is_err() {
            // Subscriber went away; persistence already happened, so just
            // stop forwarding.
            self.subscriber = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        permission_request_frame, result_frame, seed_session, seed_user, stream_event_frame,
        text_frame, tool_result_frame, tool_use_frame, Script, ScriptedFactory,
    };
    use crate::{accountant::RateTable, options};
    use maestro_config::Config;
    use maestro_core::{Direction, SessionMode};
    use maestro_store::SessionConfig;
    use serde_json::json;

    struct Fixture {
        store: Arc<Store>,
        bus: EventBus,
        pipeline: MessagePipeline,
        client: AgentClient<ScriptedFactory>,
        script: Arc<Script>,
        session_id: SessionId,
    }

    async fn fixture(lines: &[String], session_config: SessionConfig) -> Fixture {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let user_id = seed_user(&store, 5, 100.0);
        let session = seed_session(&store, user_id, SessionMode::Interactive, session_config);
        let global = Config::default();
        let bus = EventBus::new();

        let dispatcher = HookDispatcher::new(
            options::build_hook_registry(&session.config, &global, &store, &bus),
            Arc::clone(&store),
        );
        let policy =
            options::build_policy_engine(&session.config, &global).expect("policy engine");
        let accountant = Arc::new(CostAccountant::new(
            Arc::clone(&store),
            RateTable::builtin(),
        ));

        let pipeline = MessagePipeline::new(
            session.id,
            user_id,
            "test-model".into(),
            session.config.include_partial_messages,
            Arc::clone(&store),
            dispatcher,
            policy,
            bus.clone(),
            accountant,
        );

        let script = Script::with_output(lines);
        let mut client = AgentClient::new(
            options::build_agent_config(&session, &global),
            ScriptedFactory::new(Arc::clone(&script)),
        );
        client.connect().await.expect("connect");

        Fixture {
            store,
            bus,
            pipeline,
            client,
            script,
            session_id: session.id,
        }
    }

    fn allowed_read_config() -> SessionConfig {
        SessionConfig {
            allowed_tools: vec!["Read".into()],
            custom_policies: vec!["file_access".into()],
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn interactive_tool_allowed_flow() {
        // Scenario: prompt -> tool use -> tool result -> final text -> result.
        let lines = vec![
            tool_use_frame("tu_1", "Read", &json!({"path": "/tmp/x"})),
            tool_result_frame("tu_1", "contents of x", false),
            text_frame("the file says: contents of x"),
            result_frame(100, 40, 0.01),
        ];
        let mut f = fixture(&lines, allowed_read_config()).await;

        let outcome = f
            .pipeline
            .run_turn(
                &mut f.client,
                "read /tmp/x",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        assert_eq!(outcome.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(
            outcome.final_text.as_deref(),
            Some("the file says: contents of x")
        );

        // Messages: 1 user, 2 tool-use, 3 tool-result, 4 text.
        let messages = f
            .store
            .messages_by_session(f.session_id, None, None)
            .expect("messages");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].direction, Direction::UserToAgent);
        assert_eq!(
            messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        for pair in messages.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }

        // One tool execution, allowed and successful.
        let tools = f
            .store
            .tool_executions_by_session(f.session_id)
            .expect("tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].status, ToolStatus::Success);
        assert_eq!(tools[0].permission_decision, PermissionVerdict::Allow);
        assert!(tools[0].completed_at.is_some());

        // One allow decision.
        let decisions = f
            .store
            .permissions_by_session(f.session_id, None)
            .expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].allowed);

        // Counters match the log.
        let session = f.store.get_session(f.session_id).expect("session");
        assert_eq!(session.metrics.total_messages, 4);
        assert_eq!(session.metrics.total_tool_calls, 1);
        assert_eq!(session.metrics.total_permission_checks, 1);
        assert!(session.metrics.cost_usd > 0.0);
        assert_eq!(session.metrics.usage.input_tokens, 100);
    }

    #[tokio::test]
    async fn permission_denial_flow() {
        let lines = vec![
            tool_use_frame("tu_1", "Read", &json!({"path": "/etc/passwd"})),
            text_frame("I could not read that file."),
            result_frame(50, 10, 0.002),
        ];
        let mut f = fixture(&lines, allowed_read_config()).await;

        f.pipeline
            .run_turn(
                &mut f.client,
                "read /etc/passwd",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        // Decision row: denied by the file policy, reason names /etc.
        let decisions = f
            .store
            .permissions_by_session(f.session_id, Some(false))
            .expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].policy_name.as_deref(), Some("file_access"));
        assert!(decisions[0].reason.as_deref().unwrap_or("").contains("/etc"));

        // Tool row: denied.
        let tool = f
            .store
            .get_tool_execution(f.session_id, "tu_1")
            .expect("tool");
        assert_eq!(tool.status, ToolStatus::Denied);
        assert_eq!(tool.permission_decision, PermissionVerdict::Deny);

        // A synthetic error tool-result message was persisted.
        let messages = f
            .store
            .messages_by_session(f.session_id, None, None)
            .expect("messages");
        let synthetic = messages
            .iter()
            .find(|m| {
                m.blocks.iter().any(|b| {
                    matches!(b, ContentBlock::ToolResult { is_error: true, .. })
                })
            })
            .expect("synthetic denial message");
        assert_eq!(synthetic.sequence, 3);

        // The denial was pushed to the child.
        let sent = f.script.sent_lines();
        assert!(sent.iter().any(|l| l.contains("\"allow\":false")));
    }

    #[tokio::test]
    async fn hook_block_skips_permission_check() {
        use async_trait::async_trait;
        use maestro_hooks::{Hook, HookContext, HookError, HookOutcome, HookRegistry};

        struct VetoBash;
        #[async_trait]
        impl Hook for VetoBash {
            fn name(&self) -> &str {
                "veto"
            }
            fn kind(&self) -> HookKind {
                HookKind::PreToolUse
            }
            fn priority(&self) -> i32 {
                1
            }
            async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
                if ctx.get_str("tool_name") == Some("Bash") {
                    Ok(HookOutcome::block("no shell today"))
                } else {
                    Ok(HookOutcome::proceed())
                }
            }
        }

        let lines = vec![
            tool_use_frame("tu_1", "Bash", &json!({"command": "ls"})),
            // The child asks about the vetoed call; the recorded denial
            // must answer it without a fresh policy evaluation.
            permission_request_frame("tu_1", "Bash", &json!({"command": "ls"})),
            result_frame(10, 5, 0.001),
        ];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        // Install the vetoing hook in front of everything else.
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(VetoBash));
        f.pipeline.dispatcher = HookDispatcher::new(registry, Arc::clone(&f.store));

        f.pipeline
            .run_turn(
                &mut f.client,
                "run ls",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        let tool = f
            .store
            .get_tool_execution(f.session_id, "tu_1")
            .expect("tool");
        assert_eq!(tool.status, ToolStatus::Denied);
        // Hook veto means the permission layer never ran — not even for
        // the follow-up permission request.
        assert_eq!(tool.permission_decision, PermissionVerdict::NotChecked);
        assert!(
            f.store
                .permissions_by_session(f.session_id, None)
                .expect("decisions")
                .is_empty()
        );
        assert!(
            tool.error_message
                .as_deref()
                .unwrap_or("")
                .contains("blocked_by_hook")
        );

        // Both the veto and the permission-request answer denied the call.
        let sent = f.script.sent_lines();
        let denials = sent.iter().filter(|l| l.contains("\"allow\":false")).count();
        assert_eq!(denials, 2);
        assert!(!sent.iter().any(|l| l.contains("\"allow\":true")));
    }

    #[tokio::test]
    async fn permission_request_answered_from_recorded_verdict() {
        let lines = vec![
            tool_use_frame("tu_1", "Read", &json!({"path": "/tmp/ok"})),
            permission_request_frame("tu_1", "Read", &json!({"path": "/tmp/ok"})),
            result_frame(10, 5, 0.001),
        ];
        let mut f = fixture(&lines, allowed_read_config()).await;

        f.pipeline
            .run_turn(
                &mut f.client,
                "read it",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        let sent = f.script.sent_lines();
        assert!(sent.iter().any(|l| l.contains("\"allow\":true")));
        // The verdict was reused: still exactly one decision row.
        assert_eq!(
            f.store
                .permissions_by_session(f.session_id, None)
                .expect("d")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn partials_persist_and_link_when_enabled() {
        let config = SessionConfig {
            include_partial_messages: true,
            ..SessionConfig::default()
        };
        let lines = vec![
            stream_event_frame("the fi"),
            stream_event_frame("le says hi"),
            text_frame("the file says hi"),
            result_frame(10, 5, 0.001),
        ];
        let mut f = fixture(&lines, config).await;

        f.pipeline
            .run_turn(
                &mut f.client,
                "go",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        let messages = f
            .store
            .messages_by_session(f.session_id, None, None)
            .expect("messages");
        let partials: Vec<_> = messages.iter().filter(|m| m.is_partial).collect();
        assert_eq!(partials.len(), 2);
        let completion = messages
            .iter()
            .find(|m| !m.is_partial && m.direction == Direction::AgentToUser)
            .expect("completion");
        assert!(partials.iter().all(|p| p.parent_message_id == Some(completion.id)));

        // Partials are kept and never counted.
        let session = f.store.get_session(f.session_id).expect("session");
        assert_eq!(session.metrics.total_messages, 2); // user + completion
    }

    #[tokio::test]
    async fn partials_skipped_when_disabled() {
        let lines = vec![
            stream_event_frame("ignored"),
            text_frame("done"),
            result_frame(10, 5, 0.001),
        ];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        f.pipeline
            .run_turn(
                &mut f.client,
                "go",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");
        assert_eq!(f.store.count_messages(f.session_id, true).expect("count"), 2);
    }

    #[tokio::test]
    async fn terminate_mid_turn_keeps_partial_state() {
        // No result frame: the turn would hang; cancellation unwinds it.
        let lines = vec![text_frame("working on it")];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        let cancel = CancellationToken::new();

        // Let the pipeline drain the script, then cancel.
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let err = f
            .pipeline
            .run_turn(
                &mut f.client,
                "go",
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled("terminated")));

        // Everything persisted before the cancel is kept.
        let messages = f
            .store
            .messages_by_session(f.session_id, None, None)
            .expect("messages");
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn timeout_unwinds_the_turn() {
        let lines = vec![text_frame("still thinking")];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        let err = f
            .pipeline
            .run_turn(
                &mut f.client,
                "go",
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled("timeout")));
    }

    #[tokio::test]
    async fn subscriber_receives_non_partial_messages() {
        let lines = vec![text_frame("hello"), result_frame(5, 2, 0.001)];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(8);
        f.pipeline.set_subscriber(Some(tx));

        f.pipeline
            .run_turn(
                &mut f.client,
                "hi",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        let first = rx.recv().await.expect("user message");
        assert_eq!(first.direction, Direction::UserToAgent);
        let second = rx.recv().await.expect("assistant message");
        assert_eq!(second.direction, Direction::AgentToUser);
    }

    #[tokio::test]
    async fn event_bus_sees_turn_completion() {
        let lines = vec![text_frame("hello"), result_frame(5, 2, 0.001)];
        let mut f = fixture(&lines, SessionConfig::default()).await;
        let mut rx = f.bus.subscribe();

        f.pipeline
            .run_turn(
                &mut f.client,
                "hi",
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("turn");

        let mut saw_turn_completed = false;
        while let Some(event) = rx.try_recv() {
            if matches!(&*event, MaestroEvent::TurnCompleted { .. }) {
                saw_turn_completed = true;
            }
        }
        assert!(saw_turn_completed);
    }
}
