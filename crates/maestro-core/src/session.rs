//! Session state machine and configuration enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Execution mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Long-lived streaming conversation; partial messages enabled.
    Interactive,
    /// One-shot turn with turn-level retry; no partials.
    Background,
    /// Continuation of a parent session with copied history and workdir.
    Forked,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Background => write!(f, "background"),
            Self::Forked => write!(f, "forked"),
        }
    }
}

/// Global permission shorthand applied before custom policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// No shorthand; custom policies decide.
    #[default]
    Default,
    /// Edit-class tools are allowed without asking.
    AcceptEdits,
    /// Every tool is allowed.
    Bypass,
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::AcceptEdits => write!(f, "accept_edits"),
            Self::Bypass => write!(f, "bypass"),
        }
    }
}

/// Session lifecycle states.
///
/// The legal transition graph is encoded in [`SessionStatus::can_transition`];
/// every status update anywhere in the system must go through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, agent not yet spawned.
    Created,
    /// Agent subprocess is being spawned and handshaken.
    Connecting,
    /// Agent connected, idle between turns.
    Active,
    /// Waiting on user input (interactive only).
    WaitingUser,
    /// A turn is in flight.
    Processing,
    /// Suspended by the user.
    Paused,
    /// Finished normally.
    Completed,
    /// Finished with a fatal error.
    Failed,
    /// Cancelled by the user or a timeout policy.
    Terminated,
    /// Workdir archived; the terminal state.
    Archived,
}

impl SessionStatus {
    /// Whether a transition from `self` to `to` is an edge of the graph.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use SessionStatus::{
            Active, Archived, Completed, Connecting, Created, Failed, Paused, Processing,
            Terminated, WaitingUser,
        };
        matches!(
            (self, to),
            (Created, Connecting | Terminated)
                | (Connecting, Active | Failed)
                | (
                    Active,
                    WaitingUser | Processing | Paused | Completed | Failed | Terminated
                )
                | (WaitingUser, Active | Processing | Terminated)
                | (Processing, Active | Completed | Failed)
                | (Paused, Active | Terminated)
                | (Completed | Failed | Terminated, Archived)
        )
    }

    /// Validate a transition, returning the error the coordinator surfaces.
    pub fn transition(self, to: Self) -> Result<Self, InvalidStateTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidStateTransition { from: self, to })
        }
    }

    /// Terminal states other than [`SessionStatus::Archived`] can still be
    /// archived; `Archived` itself is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::Archived
        )
    }

    /// States that count against the per-user concurrent-session quota.
    #[must_use]
    pub fn counts_against_quota(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::WaitingUser => "waiting_user",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// Attempted an edge that is not part of the session state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session state transition: {from} -> {to}")]
pub struct InvalidStateTransition {
    /// State the session was in.
    pub from: SessionStatus,
    /// State the caller asked for.
    pub to: SessionStatus,
}
