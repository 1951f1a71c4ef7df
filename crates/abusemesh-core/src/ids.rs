//! Entity identifiers.
//!
//! All four id kinds in the data model are 128-bit UUIDs; each gets its own
//! newtype so the type checker catches an `EventId` passed where a
//! `NodeId` was expected.

use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub struct IdParseError {
    source: uuid::Error,
}

macro_rules! define_uuid_id {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(
            Serialize,
            Deserialize,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Debug,
        )]
        pub struct $name(Uuid);

        impl ::bincode::Encode for $name {
            fn encode<E: ::bincode::enc::Encoder>(
                &self,
                encoder: &mut E,
            ) -> Result<(), ::bincode::error::EncodeError> {
                self.0.as_u128().encode(encoder)
            }
        }

        impl<Context> ::bincode::Decode<Context> for $name {
            fn decode<D: ::bincode::de::Decoder<Context = Context>>(
                decoder: &mut D,
            ) -> Result<Self, ::bincode::error::DecodeError> {
                Ok(Self(Uuid::from_u128(u128::decode(decoder)?)))
            }
        }

        impl<'de, Context> ::bincode::BorrowDecode<'de, Context> for $name {
            fn borrow_decode<D: ::bincode::de::BorrowDecoder<'de, Context = Context>>(
                decoder: &mut D,
            ) -> Result<Self, ::bincode::error::DecodeError> {
                Ok(Self(Uuid::from_u128(u128::decode(decoder)?)))
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
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
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s).context(IdParseSnafu)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_uuid_id!(
    /// Identifies a single event in the replicated log. Unique across the
    /// entire mesh; duplicate ingestion of the same `EventId` is a no-op.
    EventId
);
define_uuid_id!(
    /// Identifies a participating node (and, by extension, the client or
    /// server session bound to it).
    NodeId
);
define_uuid_id!(
    /// Identifies an abuse report, referenced by confirmations, delist
    /// requests and delist acceptances.
    ReportId
);
define_uuid_id!(
    /// Identifies a peer session, allocated by the server during
    /// `NegotiateNeighborship` and echoed by the client on every call bound
    /// to that session.
    SessionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_display_and_from_str() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().expect("valid uuid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_string() {
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn distinct_ids_are_not_equal() {
        assert_ne!(EventId::new(), EventId::new());
    }
}
