//! Value objects shared by the library workflows.

use common::CorrelationId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! library_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

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

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<CorrelationId> for $name {
            fn from(id: CorrelationId) -> Self {
                Self(id.as_uuid())
            }
        }

        impl From<$name> for CorrelationId {
            fn from(id: $name) -> Self {
                CorrelationId::from_uuid(id.0)
            }
        }
    };
}

library_id!(
    /// Identifier of a book in the catalog; also the Book saga's correlation id.
    BookId
);

library_id!(
    /// Identifier of a library member.
    MemberId
);

library_id!(
    /// Identifier of a reservation; also the Reservation saga's correlation id.
    ReservationId
);

library_id!(
    /// Identifier of one check-out, shared by the CheckOut and BookReturn sagas.
    CheckOutId
);

/// Money amount represented in cents to avoid floating point issues.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Money {
    /// Amount in cents (e.g., 1000 = $10.00)
    cents: i64,
}

impl Money {
    pub const fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub const fn cents(&self) -> i64 {
        self.cents
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_convert_to_correlation_ids() {
        let book = BookId::new();
        let correlation = CorrelationId::from(book);
        assert_eq!(correlation.as_uuid(), book.as_uuid());
        assert_eq!(BookId::from(correlation), book);
    }

    #[test]
    fn ids_serialize_as_bare_uuids() {
        let member = MemberId::new();
        let json = serde_json::to_string(&member).unwrap();
        assert_eq!(json, format!("\"{}\"", member.as_uuid()));
    }

    #[test]
    fn money_display() {
        assert_eq!(Money::from_cents(12345).to_string(), "$123.45");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-250).to_string(), "-$2.50");
    }
}
