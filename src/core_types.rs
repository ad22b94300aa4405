//! Core types used throughout the system
//!
//! Identifiers are UUID-backed newtypes so an order id can never be bound
//! where an account id is expected. All of them are stored as `UUID`
//! columns in PostgreSQL and serialized as plain strings on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the inner UUID value
            pub fn inner(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Account ID - internal primary key of a brokerage account.
    AccountId
);

uuid_id!(
    /// Order ID - the id the order-placement path assigned to the order.
    ///
    /// The clearing broker echoes it back as `order_id` on every
    /// settlement confirmation.
    OrderId
);

uuid_id!(
    /// Execution ID - internal primary key of a stored execution row.
    ExecutionId
);

uuid_id!(
    /// ACH relationship (bank link) ID
    RelationshipId
);

uuid_id!(
    /// Deposit / withdrawal ID
    TransferId
);

uuid_id!(
    /// Trade failure record ID
    FailureId
);
