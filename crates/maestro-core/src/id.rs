//! Entity identifiers.
//!
//! Every identifier is an opaque 128-bit value (UUID v4) wrapped in a
//! newtype so that a `SessionId` can never be passed where a `TaskId` is
//! expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the canonical hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id!(
    /// Identifier of a session (the aggregate root).
    SessionId
);
define_id!(
    /// Identifier of a user.
    UserId
);
define_id!(
    /// Identifier of a persisted message.
    MessageId
);
define_id!(
    /// Identifier of a tool execution row.
    ToolExecutionId
);
define_id!(
    /// Identifier of a hook execution audit row.
    HookExecutionId
);
define_id!(
    /// Identifier of a permission decision audit row.
    PermissionDecisionId
);
define_id!(
    /// Identifier of a session archive.
    ArchiveId
);
define_id!(
    /// Identifier of a task (reusable prompt template).
    TaskId
);
define_id!(
    /// Identifier of a single task execution.
    TaskExecutionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn id_roundtrips_through_string() {
        let id = SessionId::new();
        let parsed = SessionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_serializes_as_bare_uuid() {
        let id = TaskId::from_uuid(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
