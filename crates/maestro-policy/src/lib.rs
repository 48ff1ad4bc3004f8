//! Maestro Policy — ordered permission evaluation for tool calls.
//!
//! A policy is a named rule that, given a tool name and its input,
//! returns [`PolicyDecision::Allow`], [`PolicyDecision::Deny`], or
//! [`PolicyDecision::Abstain`]. The engine walks policies in registration
//! order and the **first non-abstain decision wins**, which makes policy
//! order part of a session's configuration and keeps evaluation
//! deterministic and replayable.
//!
//! An evaluation error anywhere denies the call; allowing on failure is
//! never the default.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod builtin;
pub mod decision;
pub mod engine;

pub use builtin::{CommandPolicy, FileAccessPolicy, PermissionModePolicy, PolicySettings};
pub use decision::{EngineDecision, Policy, PolicyDecision};
pub use engine::PolicyEngine;
