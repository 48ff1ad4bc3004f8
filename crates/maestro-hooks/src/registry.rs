//! Hook registry.

use maestro_core::HookKind;
use std::sync::Arc;

use crate::hook::Hook;

/// Ordered collection of a session's hooks.
///
/// Hooks are kept sorted by `(kind, priority, insertion index)` so
/// dispatch order is stable across restarts for the same configuration.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<(usize, Arc<dyn Hook>)>,
    next_index: usize,
}

impl HookRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push((self.next_index, hook));
        self.next_index += 1;
        self.hooks.sort_by(|(ia, a), (ib, b)| {
            (a.kind() as u8, a.priority(), *ia).cmp(&(b.kind() as u8, b.priority(), *ib))
        });
    }

    /// Hooks subscribed to `kind`, in dispatch order.
    #[must_use]
    pub fn hooks_for(&self, kind: HookKind) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .iter()
            .filter(|(_, h)| h.kind() == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    /// Total registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{HookContext, HookError, HookOutcome};
    use async_trait::async_trait;

    struct Named {
        name: String,
        kind: HookKind,
        priority: i32,
    }

    #[async_trait]
    impl Hook for Named {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> HookKind {
            self.kind
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn execute(&self, _ctx: &HookContext) -> Result<HookOutcome, HookError> {
            Ok(HookOutcome::proceed())
        }
    }

    fn named(name: &str, kind: HookKind, priority: i32) -> Arc<dyn Hook> {
        Arc::new(Named {
            name: name.into(),
            kind,
            priority,
        })
    }

    #[test]
    fn hooks_sorted_by_priority_then_registration() {
        let mut registry = HookRegistry::new();
        registry.register(named("late", HookKind::PreToolUse, 200));
        registry.register(named("early", HookKind::PreToolUse, 10));
        registry.register(named("mid_a", HookKind::PreToolUse, 100));
        registry.register(named("mid_b", HookKind::PreToolUse, 100));
        registry.register(named("other", HookKind::Stop, 1));

        let order: Vec<String> = registry
            .hooks_for(HookKind::PreToolUse)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(order, vec!["early", "mid_a", "mid_b", "late"]);
        assert_eq!(registry.hooks_for(HookKind::Stop).len(), 1);
        assert!(registry.hooks_for(HookKind::PreCompact).is_empty());
    }
}
