//! Built-in hooks installed from configuration.

use async_trait::async_trait;
use chrono::Utc;
use maestro_core::{HookKind, SessionMetrics, ToolExecutionId};
use maestro_events::{EventBus, MaestroEvent};
use maestro_store::{PermissionVerdict, Store, StoreError, ToolExecutionRecord, ToolStatus};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::hook::{Hook, HookContext, HookError, HookOutcome};

/// Structured audit logging for one lifecycle point.
///
/// Register one instance per kind of interest.
pub struct AuditHook {
    kind: HookKind,
}

impl AuditHook {
    /// Audit hook for `kind`.
    #[must_use]
    pub fn for_kind(kind: HookKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Hook for AuditHook {
    fn name(&self) -> &str {
        "audit"
    }

    fn kind(&self) -> HookKind {
        self.kind
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
        info!(
            session_id = %ctx.session_id,
            kind = %ctx.kind,
            tool_use_id = ctx.tool_use_id.as_deref().unwrap_or("-"),
            tool = ctx.get_str("tool_name").unwrap_or("-"),
            "lifecycle event"
        );
        Ok(HookOutcome::proceed())
    }
}

/// Counter updates driven by tool results.
pub struct MetricsHook {
    store: Arc<Store>,
}

impl MetricsHook {
    /// Create over the store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for MetricsHook {
    fn name(&self) -> &str {
        "metrics"
    }

    fn kind(&self) -> HookKind {
        HookKind::PostToolUse
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
        if ctx.get_bool("is_error") {
            let delta = SessionMetrics {
                total_errors: 1,
                ..SessionMetrics::default()
            };
            self.store
                .increment_session_metrics(ctx.session_id, &delta)
                .map_err(|e| HookError(e.to_string()))?;
        }
        Ok(HookOutcome::proceed())
    }
}

/// Guarantees a `ToolExecution` row exists for every observed tool call,
/// even if an upstream persistence step was skipped.
pub struct ToolTrackingHook {
    store: Arc<Store>,
}

impl ToolTrackingHook {
    /// Create over the store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for ToolTrackingHook {
    fn name(&self) -> &str {
        "tool_tracking"
    }

    fn kind(&self) -> HookKind {
        HookKind::PreToolUse
    }

    fn priority(&self) -> i32 {
        30
    }

    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
        let Some(tool_use_id) = ctx.tool_use_id.as_deref() else {
            return Ok(HookOutcome::proceed());
        };
        match self.store.get_tool_execution(ctx.session_id, tool_use_id) {
            Ok(_) => Ok(HookOutcome::proceed()),
            Err(StoreError::NotFound { .. }) => {
                let record = ToolExecutionRecord {
                    id: ToolExecutionId::new(),
                    session_id: ctx.session_id,
                    tool_use_id: tool_use_id.to_string(),
                    tool_name: ctx.get_str("tool_name").unwrap_or("unknown").to_string(),
                    input: ctx.input.get("input").cloned().unwrap_or(Value::Null),
                    output: None,
                    status: ToolStatus::Pending,
                    error_message: None,
                    duration_ms: None,
                    permission_decision: PermissionVerdict::NotChecked,
                    permission_reason: None,
                    started_at: Utc::now(),
                    completed_at: None,
                };
                self.store
                    .record_tool_start(&record)
                    .map_err(|e| HookError(e.to_string()))?;
                let mut output = Map::new();
                output.insert("tool_row_created".into(), Value::Bool(true));
                Ok(HookOutcome::proceed_with(output))
            },
            Err(e) => Err(HookError(e.to_string())),
        }
    }
}

/// Emits transport events for tool activity.
pub struct NotificationHook {
    kind: HookKind,
    bus: EventBus,
}

impl NotificationHook {
    /// Notification hook for `kind` over the bus.
    #[must_use]
    pub fn for_kind(kind: HookKind, bus: EventBus) -> Self {
        Self { kind, bus }
    }
}

#[async_trait]
impl Hook for NotificationHook {
    fn name(&self) -> &str {
        "notification"
    }

    fn kind(&self) -> HookKind {
        self.kind
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
        match ctx.kind {
            HookKind::PreToolUse => {
                if let Some(tool_use_id) = ctx.tool_use_id.clone() {
                    self.bus.publish(MaestroEvent::ToolStarted {
                        session_id: ctx.session_id,
                        tool_use_id,
                        tool_name: ctx.get_str("tool_name").unwrap_or("unknown").to_string(),
                    });
                }
            },
            HookKind::PostToolUse => {
                if let Some(tool_use_id) = ctx.tool_use_id.clone() {
                    self.bus.publish(MaestroEvent::ToolFinished {
                        session_id: ctx.session_id,
                        tool_use_id,
                        is_error: ctx.get_bool("is_error"),
                        duration_ms: ctx
                            .input
                            .get("duration_ms")
                            .and_then(Value::as_u64),
                    });
                }
            },
            // Other kinds are broadcast by the pipeline itself.
            _ => {},
        }
        Ok(HookOutcome::proceed())
    }
}

/// End-of-turn consistency check between the message log and the session
/// counters.
pub struct PersistenceHook {
    store: Arc<Store>,
}

impl PersistenceHook {
    /// Create over the store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for PersistenceHook {
    fn name(&self) -> &str {
        "persistence"
    }

    fn kind(&self) -> HookKind {
        HookKind::Stop
    }

    fn priority(&self) -> i32 {
        95
    }

    async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
        let counted = self
            .store
            .count_messages(ctx.session_id, false)
            .map_err(|e| HookError(e.to_string()))?;
        let session = self
            .store
            .get_session(ctx.session_id)
            .map_err(|e| HookError(e.to_string()))?;
        if session.metrics.total_messages != counted {
            warn!(
                session_id = %ctx.session_id,
                counter = session.metrics.total_messages,
                counted,
                "message counter diverged from the log"
            );
        }
        let mut output = Map::new();
        output.insert("message_count".into(), Value::from(counted));
        Ok(HookOutcome::proceed_with(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{SessionId, SessionMode, UserId};
    use maestro_store::SessionRecord;

    fn session(store: &Store) -> SessionId {
        let record =
            SessionRecord::new(UserId::new(), SessionMode::Interactive, "/tmp/w".into());
        store.insert_session(&record).expect("session");
        record.id
    }

    fn tool_ctx(session_id: SessionId) -> HookContext {
        let mut input = Map::new();
        input.insert("tool_name".into(), Value::String("Read".into()));
        input.insert("input".into(), serde_json::json!({"path": "/tmp/x"}));
        HookContext::new(session_id, HookKind::PreToolUse, input).with_tool_use_id("tu_1")
    }

    #[tokio::test]
    async fn tool_tracking_creates_missing_row() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);
        let hook = ToolTrackingHook::new(Arc::clone(&store));

        let outcome = hook.execute(&tool_ctx(session_id)).await.expect("execute");
        assert!(outcome.output.get("tool_row_created").is_some());

        let row = store.get_tool_execution(session_id, "tu_1").expect("row");
        assert_eq!(row.tool_name, "Read");
        assert_eq!(row.status, ToolStatus::Pending);

        // Second run is a no-op.
        let outcome = hook.execute(&tool_ctx(session_id)).await.expect("execute");
        assert!(outcome.output.get("tool_row_created").is_none());
    }

    #[tokio::test]
    async fn metrics_hook_counts_tool_errors() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);
        let hook = MetricsHook::new(Arc::clone(&store));

        let mut input = Map::new();
        input.insert("is_error".into(), Value::Bool(true));
        let ctx = HookContext::new(session_id, HookKind::PostToolUse, input);
        hook.execute(&ctx).await.expect("execute");

        assert_eq!(
            store.get_session(session_id).expect("s").metrics.total_errors,
            1
        );
    }

    #[tokio::test]
    async fn notification_hook_publishes_tool_events() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let hook = NotificationHook::for_kind(HookKind::PreToolUse, bus);
        hook.execute(&tool_ctx(session_id)).await.expect("execute");

        let event = rx.try_recv().expect("event");
        assert!(matches!(&*event, MaestroEvent::ToolStarted { tool_name, .. }
            if tool_name == "Read"));
    }

    #[tokio::test]
    async fn persistence_hook_reports_count() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);
        store
            .insert_message(maestro_store::NewMessage::user_prompt(session_id, "hi"))
            .expect("msg");

        let hook = PersistenceHook::new(Arc::clone(&store));
        let ctx = HookContext::new(session_id, HookKind::Stop, Map::new());
        let outcome = hook.execute(&ctx).await.expect("execute");
        assert_eq!(
            outcome.output.get("message_count").and_then(Value::as_u64),
            Some(1)
        );
    }
}
