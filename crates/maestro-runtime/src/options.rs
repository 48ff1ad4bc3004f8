//! Per-session machinery built from configuration.
//!
//! The executors share one `Options`-building path: session configuration
//! merged with global configuration yields the policy engine, the hook
//! registry, and the subprocess launch config.

use maestro_agent::AgentConfig;
use maestro_config::Config;
use maestro_core::HookKind;
use maestro_events::EventBus;
use maestro_hooks::{
    AuditHook, HookRegistry, MetricsHook, NotificationHook, PersistenceHook, ToolTrackingHook,
};
use maestro_policy::{builtin, PermissionModePolicy, Policy, PolicyEngine, PolicySettings};
use maestro_store::{SessionConfig, SessionRecord, Store};
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeResult};

/// Build the ordered policy engine for a session.
///
/// The permission-mode shorthand always evaluates first; the session's
/// custom policies follow in their configured order. An unknown policy
/// name is a validation error — a session must never run with fewer
/// policies than it asked for.
pub fn build_policy_engine(
    session_config: &SessionConfig,
    global: &Config,
) -> RuntimeResult<PolicyEngine> {
    let settings = PolicySettings {
        restricted_paths: global.restricted_paths.clone(),
        allowed_paths: Vec::new(),
        blocked_commands: global.blocked_commands.clone(),
    };

    let mut policies: Vec<Arc<dyn Policy>> = vec![Arc::new(PermissionModePolicy::new(
        session_config.permission_mode,
    ))];
    for name in &session_config.custom_policies {
        let policy = builtin::from_name(name, &settings)
            .ok_or_else(|| RuntimeError::Validation(format!("unknown policy: {name}")))?;
        policies.push(policy);
    }
    Ok(PolicyEngine::new(policies))
}

/// Build the hook registry for a session from its enabled kinds and the
/// globally toggled built-ins.
pub fn build_hook_registry(
    session_config: &SessionConfig,
    global: &Config,
    store: &Arc<Store>,
    bus: &EventBus,
) -> HookRegistry {
    let mut registry = HookRegistry::new();
    let enabled = |kind: HookKind| session_config.hooks_enabled.contains(&kind);

    if global.hooks.audit {
        for kind in HookKind::ALL {
            if enabled(kind) {
                registry.register(Arc::new(AuditHook::for_kind(kind)));
            }
        }
    }
    if enabled(HookKind::PreToolUse) {
        registry.register(Arc::new(ToolTrackingHook::new(Arc::clone(store))));
        if global.hooks.notification {
            registry.register(Arc::new(NotificationHook::for_kind(
                HookKind::PreToolUse,
                bus.clone(),
            )));
        }
    }
    if enabled(HookKind::PostToolUse) {
        if global.hooks.metrics {
            registry.register(Arc::new(MetricsHook::new(Arc::clone(store))));
        }
        if global.hooks.notification {
            registry.register(Arc::new(NotificationHook::for_kind(
                HookKind::PostToolUse,
                bus.clone(),
            )));
        }
    }
    if enabled(HookKind::Stop) {
        registry.register(Arc::new(PersistenceHook::new(Arc::clone(store))));
    }
    registry
}

/// Build the subprocess launch configuration for a session.
#[must_use]
pub fn build_agent_config(session: &SessionRecord, global: &Config) -> AgentConfig {
    let model = session
        .config
        .sdk_options
        .get("model")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(&global.default_model)
        .to_string();
    AgentConfig {
        cli_path: global.agent_cli_path.clone(),
        workdir: session.workdir_path.clone().into(),
        model,
        allowed_tools: session.config.allowed_tools.clone(),
        permission_mode: session.config.permission_mode,
        include_partial_messages: session.config.include_partial_messages,
        tool_providers: Vec::new(),
        sdk_options: session.config.sdk_options.clone(),
        max_retries: session.config.max_retries,
        retry_delay_ms: session.config.retry_delay_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{PermissionMode, SessionMode, UserId};
    use serde_json::json;

    #[test]
    fn custom_policies_resolve_in_order() {
        let mut session_config = SessionConfig::default();
        session_config.custom_policies =
            vec!["file_access".to_string(), "command".to_string()];
        let engine = build_policy_engine(&session_config, &Config::default()).expect("engine");
        assert_eq!(
            engine.policy_names(),
            vec!["permission_mode", "file_access", "command"]
        );
    }

    #[test]
    fn unknown_policy_is_a_validation_error() {
        let mut session_config = SessionConfig::default();
        session_config.custom_policies = vec!["telepathy".to_string()];
        let err = build_policy_engine(&session_config, &Config::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
    }

    #[test]
    fn registry_respects_enabled_kinds() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let bus = EventBus::new();

        let mut session_config = SessionConfig::default();
        session_config.hooks_enabled = vec![HookKind::PreToolUse];
        let registry =
            build_hook_registry(&session_config, &Config::default(), &store, &bus);
        // audit + tool_tracking + notification for the one enabled kind.
        assert_eq!(registry.len(), 3);

        session_config.hooks_enabled = vec![];
        let registry =
            build_hook_registry(&session_config, &Config::default(), &store, &bus);
        assert!(registry.is_empty());
    }

    #[test]
    fn agent_config_prefers_session_model() {
        let mut session = SessionRecord::new(
            UserId::new(),
            SessionMode::Interactive,
            "/srv/sessions/a".into(),
        );
        session
            .config
            .sdk_options
            .insert("model".into(), json!("claude-opus-4-20250514"));
        let agent = build_agent_config(&session, &Config::default());
        assert_eq!(agent.model, "claude-opus-4-20250514");
        assert_eq!(agent.workdir, std::path::PathBuf::from("/srv/sessions/a"));

        session.config.sdk_options.remove("model");
        let agent = build_agent_config(&session, &Config::default());
        assert_eq!(agent.model, Config::default().default_model);
    }
}
