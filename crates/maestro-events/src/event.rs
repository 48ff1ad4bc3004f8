//! Event payloads published by the engine.

use maestro_core::{
    HookKind, MessageId, SessionId, SessionStatus, TaskExecutionId, TaskId, TokenUsage,
};
use serde::{Deserialize, Serialize};

/// One engine event.
///
/// The set is closed and matches the persisted effects of the message
/// pipeline one-to-one, so a subscriber that misses events can always
/// reconstruct state from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MaestroEvent {
    /// A message row was written.
    MessagePersisted {
        /// Session the message belongs to.
        session_id: SessionId,
        /// The new row's id.
        message_id: MessageId,
        /// Per-session sequence number.
        sequence: u64,
        /// Whether this is a streaming partial.
        is_partial: bool,
    },
    /// A tool execution row moved to RUNNING.
    ToolStarted {
        /// Session the tool call belongs to.
        session_id: SessionId,
        /// Correlation id from the agent.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
    },
    /// A tool execution reached a terminal status.
    ToolFinished {
        /// Session the tool call belongs to.
        session_id: SessionId,
        /// Correlation id from the agent.
        tool_use_id: String,
        /// Whether the tool failed (or was denied).
        is_error: bool,
        /// Wall-clock duration, when known.
        duration_ms: Option<u64>,
    },
    /// A hook invocation was recorded.
    HookFired {
        /// Session the hook ran on.
        session_id: SessionId,
        /// Lifecycle point.
        kind: HookKind,
        /// Hook name.
        hook: String,
        /// Whether downstream execution continues.
        continue_execution: bool,
    },
    /// A permission evaluation was recorded.
    PermissionDecided {
        /// Session the check ran on.
        session_id: SessionId,
        /// Tool that was checked.
        tool_name: String,
        /// Whether the call was allowed.
        allowed: bool,
        /// Name of the deciding policy, if any.
        policy: Option<String>,
    },
    /// The session moved to a new lifecycle state.
    SessionStatusChanged {
        /// The session.
        session_id: SessionId,
        /// Previous state.
        from: SessionStatus,
        /// New state.
        to: SessionStatus,
    },
    /// A turn finished and its usage was accounted.
    TurnCompleted {
        /// The session.
        session_id: SessionId,
        /// Tokens consumed by the turn.
        usage: TokenUsage,
        /// Cost attributed to the turn, in USD.
        cost_usd: f64,
    },
    /// The scheduler fired a task.
    TaskFired {
        /// The task.
        task_id: TaskId,
        /// The execution row created for this fire.
        execution_id: TaskExecutionId,
        /// Background session driving the execution.
        session_id: SessionId,
    },
}

impl MaestroEvent {
    /// Session this event concerns, if it is session-scoped.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::MessagePersisted { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolFinished { session_id, .. }
            | Self::HookFired { session_id, .. }
            | Self::PermissionDecided { session_id, .. }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::TurnCompleted { session_id, .. }
            | Self::TaskFired { session_id, .. } => Some(*session_id),
        }
    }

    /// Whether a lagging subscriber may drop this event.
    ///
    /// Only partial-message frames are droppable; everything else either
    /// must reach the subscriber or is cheap to replay from the store.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::MessagePersisted { is_partial: true, .. })
    }

    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessagePersisted { .. } => "message_persisted",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::HookFired { .. } => "hook_fired",
            Self::PermissionDecided { .. } => "permission_decided",
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::TaskFired { .. } => "task_fired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_partials_are_droppable() {
        let session_id = SessionId::new();
        let partial = MaestroEvent::MessagePersisted {
            session_id,
            message_id: MessageId::new(),
            sequence: 3,
            is_partial: true,
        };
        let full = MaestroEvent::MessagePersisted {
            session_id,
            message_id: MessageId::new(),
            sequence: 4,
            is_partial: false,
        };
        assert!(partial.is_droppable());
        assert!(!full.is_droppable());
        assert!(
            !MaestroEvent::SessionStatusChanged {
                session_id,
                from: SessionStatus::Active,
                to: SessionStatus::Processing,
            }
            .is_droppable()
        );
    }

    #[test]
    fn events_are_tagged_json() {
        let event = MaestroEvent::PermissionDecided {
            session_id: SessionId::new(),
            tool_name: "Read".into(),
            allowed: false,
            policy: Some("file_access".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "permission_decided");
        assert_eq!(json["allowed"], false);
    }
}
