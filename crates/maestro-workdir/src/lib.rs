//! Maestro Workdir — per-session filesystem roots.
//!
//! Every session owns one directory under `<storage_root>/active/<id>`.
//! The manager creates them, deep-copies them for forks, and turns them
//! into compressed archives with a deterministic manifest when a session
//! ends. Compression and copying are blocking work and always run on the
//! blocking pool so session workers are never starved.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod archive;
pub mod error;
pub mod manager;

pub use archive::ArchiveOutput;
pub use error::{WorkdirError, WorkdirResult};
pub use manager::WorkdirManager;
