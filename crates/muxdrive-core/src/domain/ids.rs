//! Typed entity identifiers
//!
//! UUID-backed newtypes so a tenant id can never be passed where a
//! transfer id is expected. Serialized transparently as the UUID string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| EngineError::InvalidArgument(format!("invalid id: {e}")))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a cloud-drive tenant.
    TenantId
);
uuid_id!(
    /// Identifier of a tenant group (one API-key scope).
    GroupId
);
uuid_id!(
    /// Identifier of a scheduled sync task.
    TaskId
);
uuid_id!(
    /// Identifier of a transfer record.
    TransferId
);
