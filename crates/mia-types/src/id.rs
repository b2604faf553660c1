//! Identifier types.
//!
//! Every identifier wraps a random UUID v4 and renders with a short
//! prefix (`client:`, `proc:`, `req:`) so log lines stay greppable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new identifier with a random UUID v4.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the inner UUID.
            #[must_use]
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one client connection attached to the gateway.
    ///
    /// A client gets a fresh id on every attach; ids are never reused
    /// after the connection closes.
    ClientId,
    "client"
);

uuid_id!(
    /// Identifier of the supervised backend process record.
    ///
    /// Stable for the lifetime of a supervisor, across restarts. The OS
    /// pid changes on restart, this id does not.
    ProcessId,
    "proc"
);

uuid_id!(
    /// Identifier of a single request forwarded to the backend.
    RequestId,
    "req"
);
