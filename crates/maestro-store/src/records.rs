//! Typed rows for every persisted entity.
//!
//! Records are the store's public vocabulary; SQL never leaks out of this
//! crate. Enum columns are stored as their snake_case names and parsed
//! back strictly — an unknown name in the database is a [`StoreError::Fatal`],
//! never a silent default.

use chrono::{DateTime, Utc};
use maestro_core::{
    ArchiveId, Compression, ContentBlock, Direction, HookExecutionId, HookKind, ManifestEntry,
    MessageId, PermissionDecisionId, PermissionMode, SessionId, SessionMetrics, SessionMode,
    SessionStatus, TaskExecutionId, TaskId, ToolExecutionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StoreError;

/// Per-session configuration captured at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Tools the agent may use.
    pub allowed_tools: Vec<String>,
    /// Global permission shorthand.
    pub permission_mode: PermissionMode,
    /// Hook kinds enabled for this session.
    pub hooks_enabled: Vec<HookKind>,
    /// Ordered custom policy names; order is evaluation order.
    pub custom_policies: Vec<String>,
    /// Maximum transient-failure retries.
    pub max_retries: u32,
    /// Base retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-turn timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether streaming partial messages are requested.
    pub include_partial_messages: bool,
    /// Opaque options forwarded to the agent CLI.
    #[serde(default)]
    pub sdk_options: BTreeMap<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allowed_tools: Vec::new(),
            permission_mode: PermissionMode::Default,
            hooks_enabled: HookKind::ALL.to_vec(),
            custom_policies: Vec::new(),
            max_retries: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 300_000,
            include_partial_messages: false,
            sdk_options: BTreeMap::new(),
        }
    }
}

/// A session row — the aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Execution mode.
    pub mode: SessionMode,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Absolute working-directory path.
    pub workdir_path: String,
    /// Parent session (forks only).
    pub parent_session_id: Option<SessionId>,
    /// Configuration snapshot.
    pub config: SessionConfig,
    /// Monotonic counters.
    pub metrics: SessionMetrics,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First transition to ACTIVE.
    pub started_at: Option<DateTime<Utc>>,
    /// First terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// Set iff status is ARCHIVED.
    pub archive_id: Option<ArchiveId>,
}

impl SessionRecord {
    /// Build a fresh record in CREATED state.
    #[must_use]
    pub fn new(user_id: UserId, mode: SessionMode, workdir_path: String) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            user_id,
            mode,
            status: SessionStatus::Created,
            workdir_path,
            parent_session_id: None,
            config: SessionConfig::default(),
            metrics: SessionMetrics::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            archive_id: None,
        }
    }
}

/// Filter for session listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Only sessions in this state.
    pub status: Option<SessionStatus>,
    /// Only sessions in this mode.
    pub mode: Option<SessionMode>,
}

/// Insert shape for a message; the store assigns id, sequence, and
/// creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Session the message belongs to.
    pub session_id: SessionId,
    /// Who produced it.
    pub direction: Direction,
    /// Ordered content blocks.
    pub blocks: Vec<ContentBlock>,
    /// Model that produced it, if agent-side.
    pub model: Option<String>,
    /// Input tokens attributed to this message.
    pub tokens_in: Option<u64>,
    /// Output tokens attributed to this message.
    pub tokens_out: Option<u64>,
    /// Cost attributed to this message.
    pub cost_usd: Option<f64>,
    /// Whether this is a streaming partial.
    pub is_partial: bool,
}

impl NewMessage {
    /// A plain user prompt.
    #[must_use]
    pub fn user_prompt(session_id: SessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            direction: Direction::UserToAgent,
            blocks: vec![ContentBlock::text(text)],
            model: None,
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            is_partial: false,
        }
    }

    /// An agent-side message with the given blocks.
    #[must_use]
    pub fn agent(session_id: SessionId, blocks: Vec<ContentBlock>) -> Self {
        Self {
            session_id,
            direction: Direction::AgentToUser,
            blocks,
            model: None,
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            is_partial: false,
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message identifier.
    pub id: MessageId,
    /// Session the message belongs to.
    pub session_id: SessionId,
    /// 1-based, strictly increasing per session.
    pub sequence: u64,
    /// Who produced it.
    pub direction: Direction,
    /// Ordered content blocks.
    pub blocks: Vec<ContentBlock>,
    /// Model that produced it, if agent-side.
    pub model: Option<String>,
    /// Input tokens attributed to this message.
    pub tokens_in: Option<u64>,
    /// Output tokens attributed to this message.
    pub tokens_out: Option<u64>,
    /// Cost attributed to this message.
    pub cost_usd: Option<f64>,
    /// Whether this is a streaming partial.
    pub is_partial: bool,
    /// Completion message a partial belongs to.
    pub parent_message_id: Option<MessageId>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Recorded, not yet started.
    Pending,
    /// Allowed and running inside the agent.
    Running,
    /// Completed without error.
    Success,
    /// Completed with an error.
    Error,
    /// Blocked by a hook or denied by policy.
    Denied,
}

impl ToolStatus {
    /// Whether the status requires `completed_at`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Denied)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "denied" => Ok(Self::Denied),
            other => Err(StoreError::Fatal(format!("unknown tool status: {other}"))),
        }
    }
}

/// Outcome of the permission layer for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionVerdict {
    /// Policy allowed the call.
    Allow,
    /// Policy denied the call.
    Deny,
    /// The permission layer never ran (hook-blocked or bypassed).
    NotChecked,
}

impl PermissionVerdict {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::NotChecked => "not_checked",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "not_checked" => Ok(Self::NotChecked),
            other => Err(StoreError::Fatal(format!(
                "unknown permission verdict: {other}"
            ))),
        }
    }
}

/// One row per tool invocation, denormalized for fast querying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// Row identifier.
    pub id: ToolExecutionId,
    /// Session the call belongs to.
    pub session_id: SessionId,
    /// Correlation id from the agent; unique per session.
    pub tool_use_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Tool input, verbatim.
    pub input: Value,
    /// Tool output, once finished.
    pub output: Option<Value>,
    /// Lifecycle state.
    pub status: ToolStatus,
    /// Error text for ERROR/DENIED.
    pub error_message: Option<String>,
    /// Wall-clock duration once terminal.
    pub duration_ms: Option<u64>,
    /// What the permission layer decided.
    pub permission_decision: PermissionVerdict,
    /// Policy reason, when denied or explicitly allowed.
    pub permission_reason: Option<String>,
    /// When the call was first observed.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Audit row for one hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecutionRecord {
    /// Row identifier.
    pub id: HookExecutionId,
    /// Session the hook ran on.
    pub session_id: SessionId,
    /// Lifecycle point.
    pub hook_kind: HookKind,
    /// Registered hook name.
    pub hook_name: String,
    /// Tool call that triggered it, if tool-scoped.
    pub tool_use_id: Option<String>,
    /// Input as the hook saw it.
    pub input_snapshot: Value,
    /// Output the hook produced.
    pub output_snapshot: Value,
    /// Whether downstream execution continued.
    pub continue_execution: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// When the hook ran.
    pub executed_at: DateTime<Utc>,
}

/// Audit row for one policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecisionRecord {
    /// Row identifier.
    pub id: PermissionDecisionId,
    /// Session the check ran on.
    pub session_id: SessionId,
    /// Tool that was checked.
    pub tool_name: String,
    /// Input as the policy saw it.
    pub input_snapshot: Value,
    /// Whether the call was allowed.
    pub allowed: bool,
    /// Name of the first non-abstaining policy.
    pub policy_name: Option<String>,
    /// Human-readable reason.
    pub reason: Option<String>,
    /// Whether a deny asked for the turn to be interrupted.
    pub interrupted: bool,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// Archive lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    /// Row created, work not started.
    Pending,
    /// Compression in progress.
    InProgress,
    /// Blob and manifest written.
    Completed,
    /// Archival failed; `error` holds the cause.
    Failed,
}

impl ArchiveStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Fatal(format!("unknown archive status: {other}"))),
        }
    }
}

/// One archive per archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Archive identifier.
    pub id: ArchiveId,
    /// The archived session; unique.
    pub session_id: SessionId,
    /// Blob location.
    pub path: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Compression used.
    pub compression: Compression,
    /// Deterministic manifest, sorted by relpath.
    pub manifest: Vec<ManifestEntry>,
    /// Lifecycle state.
    pub status: ArchiveStatus,
    /// Failure cause, if failed.
    pub error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub archived_at: Option<DateTime<Utc>>,
}

/// A reusable prompt template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Owning user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Template with `{{var}}` placeholders.
    pub prompt_template: String,
    /// Opaque options forwarded to sessions created for this task.
    pub sdk_options: BTreeMap<String, Value>,
    /// Tools allowed for executions.
    pub allowed_tools: Vec<String>,
    /// Default variable values.
    pub variables: BTreeMap<String, String>,
    /// Cron expression, when scheduling was ever enabled.
    pub schedule_cron: Option<String>,
    /// Whether the scheduler fires this task.
    pub schedule_enabled: bool,
    /// Whether to hand results to the report renderer.
    pub generate_report: bool,
    /// Renderer format, when reporting.
    pub report_format: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Next scheduled fire time, maintained by the scheduler.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Total executions recorded.
    pub exec_count: u64,
    /// Successful executions.
    pub success_count: u64,
    /// Failed executions.
    pub failure_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Build a fresh manual-only task.
    #[must_use]
    pub fn new(user_id: UserId, name: impl Into<String>, template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            user_id,
            name: name.into(),
            prompt_template: template.into(),
            sdk_options: BTreeMap::new(),
            allowed_tools: Vec::new(),
            variables: BTreeMap::new(),
            schedule_cron: None,
            schedule_enabled: false,
            generate_report: false,
            report_format: None,
            tags: Vec::new(),
            next_fire_at: None,
            exec_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// What caused a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTrigger {
    /// Fired by a user from the UI/CLI.
    Manual,
    /// Fired by the cron scheduler.
    Scheduled,
    /// Fired through the API.
    Api,
}

impl TaskTrigger {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            other => Err(StoreError::Fatal(format!("unknown task trigger: {other}"))),
        }
    }
}

/// Lifecycle of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    /// Created, not yet running.
    Pending,
    /// Background session in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskExecutionStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Fatal(format!(
                "unknown task execution status: {other}"
            ))),
        }
    }
}

/// One manual-or-cron fire of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    /// Execution identifier.
    pub id: TaskExecutionId,
    /// The task fired.
    pub task_id: TaskId,
    /// Background session created for this fire.
    pub session_id: SessionId,
    /// What caused the fire.
    pub trigger: TaskTrigger,
    /// Variables after merging overrides over task defaults.
    pub variables: BTreeMap<String, String>,
    /// Lifecycle state.
    pub status: TaskExecutionStatus,
    /// Final agent output, on success.
    pub result: Option<String>,
    /// Failure cause.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the background turn started.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Turn-level retries performed.
    pub retry_count: u32,
}

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Full control.
    Admin,
    /// Normal user.
    User,
    /// Read-only.
    Viewer,
}

impl UserRole {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Viewer => "viewer",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "viewer" => Ok(Self::Viewer),
            other => Err(StoreError::Fatal(format!("unknown user role: {other}"))),
        }
    }
}

/// Per-user limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserQuotas {
    /// Maximum simultaneously live (non-terminal) sessions.
    pub max_concurrent_sessions: u32,
    /// Monthly budget in USD.
    pub monthly_budget_usd: f64,
}

/// A user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User identifier.
    pub id: UserId,
    /// Login email.
    pub email: String,
    /// Password hash (opaque to the engine).
    pub password_hash: String,
    /// Role.
    pub role: UserRole,
    /// Limits.
    pub quotas: UserQuotas,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshotRecord {
    /// Monotonic row id.
    pub id: i64,
    /// The session snapshotted.
    pub session_id: SessionId,
    /// Counter values at capture time.
    pub metrics: SessionMetrics,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

// -- enum <-> column helpers for core enums --

pub(crate) fn session_status_to_str(status: SessionStatus) -> String {
    status.to_string()
}

pub(crate) fn session_status_parse(s: &str) -> Result<SessionStatus, StoreError> {
    match s {
        "created" => Ok(SessionStatus::Created),
        "connecting" => Ok(SessionStatus::Connecting),
        "active" => Ok(SessionStatus::Active),
        "waiting_user" => Ok(SessionStatus::WaitingUser),
        "processing" => Ok(SessionStatus::Processing),
        "paused" => Ok(SessionStatus::Paused),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        "terminated" => Ok(SessionStatus::Terminated),
        "archived" => Ok(SessionStatus::Archived),
        other => Err(StoreError::Fatal(format!("unknown session status: {other}"))),
    }
}

pub(crate) fn session_mode_parse(s: &str) -> Result<SessionMode, StoreError> {
    match s {
        "interactive" => Ok(SessionMode::Interactive),
        "background" => Ok(SessionMode::Background),
        "forked" => Ok(SessionMode::Forked),
        other => Err(StoreError::Fatal(format!("unknown session mode: {other}"))),
    }
}

pub(crate) fn direction_parse(s: &str) -> Result<Direction, StoreError> {
    match s {
        "user_to_agent" => Ok(Direction::UserToAgent),
        "agent_to_user" => Ok(Direction::AgentToUser),
        other => Err(StoreError::Fatal(format!("unknown direction: {other}"))),
    }
}

pub(crate) fn hook_kind_parse(s: &str) -> Result<HookKind, StoreError> {
    HookKind::from_name(s).ok_or_else(|| StoreError::Fatal(format!("unknown hook kind: {s}")))
}

pub(crate) fn compression_parse(s: &str) -> Result<Compression, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Fatal(format!("bad compression column: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            SessionStatus::Created,
            SessionStatus::WaitingUser,
            SessionStatus::Archived,
        ] {
            let parsed = session_status_parse(&session_status_to_str(status)).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(session_status_parse("zombie").is_err());
    }

    #[test]
    fn tool_status_terminality() {
        assert!(ToolStatus::Denied.is_terminal());
        assert!(ToolStatus::Success.is_terminal());
        assert!(!ToolStatus::Running.is_terminal());
    }

    #[test]
    fn default_config_enables_all_hooks() {
        let config = SessionConfig::default();
        assert_eq!(config.hooks_enabled.len(), HookKind::ALL.len());
        assert!(!config.include_partial_messages);
    }
}
