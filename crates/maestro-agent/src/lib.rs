//! Maestro Agent — the subprocess client for the external agent CLI.
//!
//! One [`AgentClient`] owns one agent subprocess for one session. The
//! protocol is line-delimited JSON over stdio: the parent writes user
//! prompts and permission responses, the child emits [`Frame`]s until a
//! result frame ends the turn.
//!
//! The client is written against the [`ChildTransport`] trait; production
//! code spawns a real subprocess via [`ProcessFactory`], tests script
//! frames with an in-memory transport.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod transport;

pub use backoff::Backoff;
pub use client::{AgentClient, ClientMetrics, ClientState};
pub use config::{AgentConfig, ProviderTransport, ToolProvider};
pub use error::{AgentError, AgentResult};
pub use frame::{Frame, OutboundFrame, WireBlock, WireUsage};
pub use transport::{ChildTransport, ProcessFactory, ProcessTransport, TransportFactory};
