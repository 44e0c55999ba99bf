use std::fmt;
use std::str::FromStr;

use snafu::ensure;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult, InvalidIdSnafu};

// String-backed wrappers: server-issued ids are opaque, so no format is assumed.
macro_rules! define_opaque_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> ChatResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-opaque-id",
                        id_type: $id_type,
                        raw,
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> ChatResult<Self> {
                Self::parse(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_opaque_id!(MessageId, "message-id");
define_opaque_id!(ChatIdentity, "chat-id");

impl MessageId {
    /// Mints an id for an optimistic, not yet persisted message.
    pub fn new_local() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Identifier for one streaming generation session.
///
/// This must change on every send/retry so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Bumped whenever the active chat is switched, cleared or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        assert!(ChatIdentity::parse("   ").is_err());
        assert_eq!(ChatIdentity::parse(" c1 ").map(|id| id.to_string()).ok(), Some("c1".to_string()));
    }

    #[test]
    fn local_message_ids_are_unique() {
        assert_ne!(MessageId::new_local(), MessageId::new_local());
    }
}
