//! Sequential hook dispatch with audit persistence.

use chrono::Utc;
use maestro_core::{HookExecutionId, HookKind, SessionId, SessionMetrics};
use maestro_store::{HookExecutionRecord, Store};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::hook::{HookContext, HookOutcome};
use crate::registry::HookRegistry;

/// Result of dispatching one kind.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Composed output: event payload overlaid with every hook's output,
    /// last write per key winning.
    pub output: Map<String, Value>,
    /// `false` when some hook short-circuited the chain.
    pub continue_execution: bool,
    /// Number of hooks that failed (errors are swallowed, not raised).
    pub errors: u64,
}

/// Fires a session's hooks and records every invocation.
pub struct HookDispatcher {
    registry: HookRegistry,
    store: Arc<Store>,
}

impl HookDispatcher {
    /// Create a dispatcher over a built registry.
    #[must_use]
    pub fn new(registry: HookRegistry, store: Arc<Store>) -> Self {
        Self { registry, store }
    }

    /// Whether any hooks are registered for `kind`.
    #[must_use]
    pub fn has_hooks(&self, kind: HookKind) -> bool {
        !self.registry.hooks_for(kind).is_empty()
    }

    /// Dispatch all hooks of `kind` sequentially.
    ///
    /// Each hook receives the composed output of its predecessors as
    /// input. A hook returning `continue_execution = false` stops the
    /// chain; a hook that errors is recorded with
    /// `continue_execution = true` (errors never block execution) and
    /// bumps the session's error counter.
    pub async fn dispatch(
        &self,
        session_id: SessionId,
        kind: HookKind,
        tool_use_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> DispatchResult {
        let mut composed = payload;
        let mut continue_execution = true;
        let mut errors: u64 = 0;

        for hook in self.registry.hooks_for(kind) {
            let mut ctx = HookContext::new(session_id, kind, composed.clone());
            if let Some(id) = tool_use_id {
                ctx = ctx.with_tool_use_id(id);
            }

            let started = Utc::now();
            let result = hook.execute(&ctx).await;
            let duration_ms =
                u64::try_from((Utc::now() - started).num_milliseconds().max(0)).unwrap_or(0);

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        hook = hook.name(),
                        kind = %kind,
                        error = %e,
                        "hook failed; continuing"
                    );
                    errors += 1;
                    let mut output = Map::new();
                    output.insert("error".into(), Value::String(e.to_string()));
                    HookOutcome {
                        output,
                        continue_execution: true,
                    }
                },
            };

            self.persist(
                session_id,
                kind,
                hook.name(),
                tool_use_id,
                &ctx.input,
                &outcome,
                duration_ms,
            );

            for (key, value) in &outcome.output {
                composed.insert(key.clone(), value.clone());
            }

            if !outcome.continue_execution {
                debug!(
                    session_id = %session_id,
                    hook = hook.name(),
                    kind = %kind,
                    "hook short-circuited the chain"
                );
                continue_execution = false;
                break;
            }
        }

        if errors > 0 {
            let delta = SessionMetrics {
                total_errors: errors,
                ..SessionMetrics::default()
            };
            if let Err(e) = self.store.increment_session_metrics(session_id, &delta) {
                warn!(session_id = %session_id, error = %e, "failed to count hook errors");
            }
        }

        DispatchResult {
            output: composed,
            continue_execution,
            errors,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        session_id: SessionId,
        kind: HookKind,
        hook_name: &str,
        tool_use_id: Option<&str>,
        input: &Map<String, Value>,
        outcome: &HookOutcome,
        duration_ms: u64,
    ) {
        let record = HookExecutionRecord {
            id: HookExecutionId::new(),
            session_id,
            hook_kind: kind,
            hook_name: hook_name.to_string(),
            tool_use_id: tool_use_id.map(ToString::to_string),
            input_snapshot: Value::Object(input.clone()),
            output_snapshot: Value::Object(outcome.output.clone()),
            continue_execution: outcome.continue_execution,
            duration_ms,
            executed_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_hook_execution(&record) {
            warn!(
                session_id = %session_id,
                hook = hook_name,
                error = %e,
                "failed to persist hook execution"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{Hook, HookError};
    use async_trait::async_trait;
    use maestro_core::SessionMode;
    use maestro_store::SessionRecord;

    struct Renamer {
        name: String,
        priority: i32,
        value: &'static str,
    }

    #[async_trait]
    impl Hook for Renamer {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> HookKind {
            HookKind::PreToolUse
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn execute(&self, ctx: &HookContext) -> Result<HookOutcome, HookError> {
            // Later hooks must see earlier hooks' writes.
            let mut output = Map::new();
            let seen = ctx.get_str("label").unwrap_or("none").to_string();
            output.insert("label".into(), Value::String(self.value.into()));
            output.insert(format!("saw_by_{}", self.name), Value::String(seen));
            Ok(HookOutcome::proceed_with(output))
        }
    }

    struct Failing;

    #[async_trait]
    impl Hook for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn kind(&self) -> HookKind {
            HookKind::PreToolUse
        }
        fn priority(&self) -> i32 {
            1
        }
        async fn execute(&self, _ctx: &HookContext) -> Result<HookOutcome, HookError> {
            Err(HookError("boom".into()))
        }
    }

    struct Blocking;

    #[async_trait]
    impl Hook for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }
        fn kind(&self) -> HookKind {
            HookKind::PreToolUse
        }
        fn priority(&self) -> i32 {
            5
        }
        async fn execute(&self, _ctx: &HookContext) -> Result<HookOutcome, HookError> {
            Ok(HookOutcome::block("not on my watch"))
        }
    }

    fn session(store: &Store) -> SessionId {
        let record = SessionRecord::new(
            maestro_core::UserId::new(),
            SessionMode::Interactive,
            "/tmp/w".into(),
        );
        store.insert_session(&record).expect("session");
        record.id
    }

    #[tokio::test]
    async fn outputs_compose_last_write_wins() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);

        let mut registry = HookRegistry::new();
        registry.register(Arc::new(Renamer {
            name: "first".into(),
            priority: 1,
            value: "from_first",
        }));
        registry.register(Arc::new(Renamer {
            name: "second".into(),
            priority: 2,
            value: "from_second",
        }));
        let dispatcher = HookDispatcher::new(registry, Arc::clone(&store));

        let result = dispatcher
            .dispatch(session_id, HookKind::PreToolUse, Some("tu_1"), Map::new())
            .await;

        assert!(result.continue_execution);
        // Last write wins.
        assert_eq!(
            result.output.get("label").and_then(Value::as_str),
            Some("from_second")
        );
        // The second hook saw the first hook's write.
        assert_eq!(
            result.output.get("saw_by_second").and_then(Value::as_str),
            Some("from_first")
        );

        let rows = store.hooks_by_session(session_id, None).expect("rows");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn failing_hook_continues_and_counts() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);

        let mut registry = HookRegistry::new();
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Renamer {
            name: "after".into(),
            priority: 2,
            value: "ran",
        }));
        let dispatcher = HookDispatcher::new(registry, Arc::clone(&store));

        let result = dispatcher
            .dispatch(session_id, HookKind::PreToolUse, None, Map::new())
            .await;

        assert!(result.continue_execution);
        assert_eq!(result.errors, 1);
        assert_eq!(result.output.get("label").and_then(Value::as_str), Some("ran"));

        let rows = store.hooks_by_session(session_id, None).expect("rows");
        assert_eq!(rows.len(), 2);
        // The failing hook's row records continue_execution = true.
        assert!(rows.iter().all(|r| r.continue_execution));

        let loaded = store.get_session(session_id).expect("session");
        assert_eq!(loaded.metrics.total_errors, 1);
        assert_eq!(loaded.metrics.total_hook_executions, 2);
        assert_eq!(loaded.metrics.total_retries, 0);
    }

    #[tokio::test]
    async fn blocking_hook_stops_the_chain() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let session_id = session(&store);

        let mut registry = HookRegistry::new();
        registry.register(Arc::new(Blocking));
        registry.register(Arc::new(Renamer {
            name: "never".into(),
            priority: 50,
            value: "unreached",
        }));
        let dispatcher = HookDispatcher::new(registry, Arc::clone(&store));

        let result = dispatcher
            .dispatch(session_id, HookKind::PreToolUse, Some("tu_9"), Map::new())
            .await;

        assert!(!result.continue_execution);
        assert!(result.output.get("label").is_none());
        assert_eq!(
            result.output.get("block_reason").and_then(Value::as_str),
            Some("not on my watch")
        );

        let rows = store.hooks_by_session(session_id, None).expect("rows");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].continue_execution);
    }
}
