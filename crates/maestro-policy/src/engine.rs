//! The policy engine: ordered evaluation with a per-session cache.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::decision::{EngineDecision, Policy, PolicyDecision};

/// Evaluates an ordered policy list for one session.
///
/// Decisions are cached by `sha256(tool_name, canonical(input))` for the
/// session's lifetime; replacing the policy set invalidates the cache.
/// Policies are deterministic, so a cache hit is observationally identical
/// to re-evaluation — but every check, cached or not, is still reported to
/// the caller for audit persistence.
pub struct PolicyEngine {
    policies: Vec<Arc<dyn Policy>>,
    cache: Mutex<HashMap<[u8; 32], EngineDecision>>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("policies", &self.policies.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Create an engine with an ordered policy list.
    #[must_use]
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self {
            policies,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Names of the installed policies, in evaluation order.
    #[must_use]
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name().to_string()).collect()
    }

    /// Replace the policy set, invalidating the decision cache.
    pub fn set_policies(&mut self, policies: Vec<Arc<dyn Policy>>) {
        self.policies = policies;
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Evaluate one tool call.
    ///
    /// The first non-abstain decision wins; if every policy abstains the
    /// call is allowed with no deciding policy recorded.
    pub fn evaluate(&self, tool_name: &str, input: &Value) -> EngineDecision {
        let key = cache_key(tool_name, input);
        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(&key)
        {
            trace!(tool = tool_name, "policy cache hit");
            let mut decision = hit.clone();
            decision.cached = true;
            return decision;
        }

        let decision = self.evaluate_uncached(tool_name, input);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, decision.clone());
        }
        decision
    }

    fn evaluate_uncached(&self, tool_name: &str, input: &Value) -> EngineDecision {
        for policy in &self.policies {
            match policy.evaluate(tool_name, input) {
                PolicyDecision::Abstain => {},
                PolicyDecision::Allow => {
                    debug!(tool = tool_name, policy = policy.name(), "tool call allowed");
                    return EngineDecision {
                        allowed: true,
                        policy_name: Some(policy.name().to_string()),
                        reason: None,
                        interrupt: false,
                        cached: false,
                    };
                },
                PolicyDecision::Deny { reason, interrupt } => {
                    debug!(
                        tool = tool_name,
                        policy = policy.name(),
                        reason = %reason,
                        "tool call denied"
                    );
                    return EngineDecision {
                        allowed: false,
                        policy_name: Some(policy.name().to_string()),
                        reason: Some(reason),
                        interrupt,
                        cached: false,
                    };
                },
            }
        }
        EngineDecision::all_abstained()
    }
}

/// Hash of the tool name and canonicalized input.
fn cache_key(tool_name: &str, input: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(input).as_bytes());
    hasher.finalize().into()
}

/// Render JSON with object keys sorted, so logically equal inputs hash
/// equal regardless of key order on the wire.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        },
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        },
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{CommandPolicy, FileAccessPolicy};
    use serde_json::json;

    struct CountingPolicy {
        calls: std::sync::atomic::AtomicUsize,
        decision: PolicyDecision,
    }

    impl Policy for CountingPolicy {
        fn name(&self) -> &str {
            "counting"
        }

        fn evaluate(&self, _tool_name: &str, _input: &Value) -> PolicyDecision {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.decision.clone()
        }
    }

    fn engine_with(policies: Vec<Arc<dyn Policy>>) -> PolicyEngine {
        PolicyEngine::new(policies)
    }

    #[test]
    fn first_non_abstain_wins() {
        let engine = engine_with(vec![
            Arc::new(CommandPolicy::new(vec!["rm -rf".into()])),
            Arc::new(FileAccessPolicy::new(vec!["/etc".into()], vec![])),
        ]);

        // The command policy abstains for Read; the file policy decides.
        let decision = engine.evaluate("Read", &json!({"path": "/etc/shadow"}));
        assert!(!decision.allowed);
        assert_eq!(decision.policy_name.as_deref(), Some("file_access"));
    }

    #[test]
    fn earlier_allow_shadows_later_deny() {
        struct AllowAll;
        impl Policy for AllowAll {
            fn name(&self) -> &str {
                "allow_all"
            }
            fn evaluate(&self, _: &str, _: &Value) -> PolicyDecision {
                PolicyDecision::Allow
            }
        }

        let engine = engine_with(vec![
            Arc::new(AllowAll),
            Arc::new(FileAccessPolicy::new(vec!["/etc".into()], vec![])),
        ]);
        let decision = engine.evaluate("Read", &json!({"path": "/etc/shadow"}));
        assert!(decision.allowed);
        assert_eq!(decision.policy_name.as_deref(), Some("allow_all"));
    }

    #[test]
    fn all_abstain_defaults_to_allow_without_policy() {
        let engine = engine_with(vec![Arc::new(CommandPolicy::new(vec![]))]);
        let decision = engine.evaluate("Read", &json!({"path": "/tmp/x"}));
        assert!(decision.allowed);
        assert!(decision.policy_name.is_none());
    }

    #[test]
    fn decisions_are_cached_per_input() {
        let counting = Arc::new(CountingPolicy {
            calls: std::sync::atomic::AtomicUsize::new(0),
            decision: PolicyDecision::Allow,
        });
        let engine = engine_with(vec![counting.clone()]);

        let input = json!({"path": "/tmp/x"});
        let first = engine.evaluate("Read", &input);
        let second = engine.evaluate("Read", &input);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(counting.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A different input is a different key.
        engine.evaluate("Read", &json!({"path": "/tmp/y"}));
        assert_eq!(counting.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn key_order_does_not_change_the_cache_key() {
        let counting = Arc::new(CountingPolicy {
            calls: std::sync::atomic::AtomicUsize::new(0),
            decision: PolicyDecision::Allow,
        });
        let engine = engine_with(vec![counting.clone()]);

        engine.evaluate("Bash", &json!({"command": "ls", "timeout": 5}));
        engine.evaluate("Bash", &json!({"timeout": 5, "command": "ls"}));
        assert_eq!(counting.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn replacing_policies_invalidates_cache() {
        let counting = Arc::new(CountingPolicy {
            calls: std::sync::atomic::AtomicUsize::new(0),
            decision: PolicyDecision::Allow,
        });
        let mut engine = engine_with(vec![counting.clone()]);
        let input = json!({"path": "/tmp/x"});
        engine.evaluate("Read", &input);

        engine.set_policies(vec![counting.clone()]);
        let decision = engine.evaluate("Read", &input);
        assert!(!decision.cached);
        assert_eq!(counting.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn replay_is_deterministic() {
        let engine = engine_with(vec![Arc::new(FileAccessPolicy::new(
            vec!["/etc".into()],
            vec![],
        ))]);
        let input = json!({"path": "/etc/passwd"});
        let first = engine.evaluate("Read", &input);
        let again = engine.evaluate_uncached("Read", &input);
        assert_eq!(first.allowed, again.allowed);
        assert_eq!(first.reason, again.reason);
        assert_eq!(first.policy_name, again.policy_name);
    }
}
