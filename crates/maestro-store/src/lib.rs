//! Maestro Store — transactional persistence for sessions and tasks.
//!
//! One SQLite database holds every entity: sessions, messages, tool
//! executions, hook executions, permission decisions, archives, tasks,
//! task executions, users, and metric snapshots. Raw agent frames are
//! parsed upstream; the store only sees typed records.
//!
//! Two contracts matter more than anything else here:
//!
//! - **Per-session message ordering.** Sequence numbers are allocated
//!   inside the insert transaction (`MAX(sequence) + 1` under SQLite's
//!   writer lock), and a `UNIQUE(session_id, sequence)` constraint backs
//!   the invariant.
//! - **Atomic counters.** Metric updates are in-place
//!   `SET x = x + ?` statements; nothing in this crate reads a counter to
//!   write it back.
//!
//! All operations are fast in-process writes; callers on the async side
//! invoke them directly, the same way the audit store bridges its
//! embedded backend.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod records;
mod schema;
pub mod store;

mod queries;

pub use error::{StoreError, StoreResult};
pub use records::{
    ArchiveRecord, ArchiveStatus, HookExecutionRecord, MessageRecord, MetricsSnapshotRecord,
    NewMessage, PermissionDecisionRecord, PermissionVerdict, SessionConfig, SessionFilter,
    SessionRecord, TaskExecutionRecord, TaskExecutionStatus, TaskRecord, TaskTrigger,
    ToolExecutionRecord, ToolStatus, UserQuotas, UserRecord, UserRole,
};
pub use store::Store;
