//! Maestro Hooks — lifecycle callbacks around agent activity.
//!
//! Hooks fire at fixed points (before/after tool use, on prompt submit,
//! at end of turn, …). For one kind, all enabled hooks run **sequentially
//! in priority order**; each hook sees the composed output of the hooks
//! before it, and any hook can stop the chain (and the tool call that
//! triggered it) by returning `continue_execution = false`.
//!
//! A hook that fails never blocks execution: the failure is recorded,
//! counted, and the chain continues. Every invocation — success, failure,
//! or short-circuit — produces a persisted audit row.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod builtin;
pub mod dispatcher;
pub mod hook;
pub mod registry;

pub use builtin::{AuditHook, MetricsHook, NotificationHook, PersistenceHook, ToolTrackingHook};
pub use dispatcher::{DispatchResult, HookDispatcher};
pub use hook::{Hook, HookContext, HookError, HookOutcome};
pub use registry::HookRegistry;
