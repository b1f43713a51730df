use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is its own type so an order id can never be passed where a
/// variant id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
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

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
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

uuid_id!(
    /// Identifier of an order aggregate.
    OrderId
);

uuid_id!(
    /// Identifier of a single order line. Doubles as the correlation id of
    /// the ledger rows that reserve, confirm or release its stock.
    OrderItemId
);

uuid_id!(
    /// Identifier of a storefront user.
    UserId
);

uuid_id!(
    /// Identifier of a sellable product variant.
    VariantId
);

uuid_id!(
    /// Identifier of the catalog product a variant belongs to.
    ProductId
);

uuid_id!(
    /// Identifier of a saved delivery address.
    AddressId
);

uuid_id!(
    /// Identifier of a payment gateway attempt.
    PaymentId
);

uuid_id!(
    /// Identifier of a shipping method.
    ShippingMethodId
);

uuid_id!(
    /// Identifier of an inventory ledger row.
    LedgerEntryId
);

uuid_id!(
    /// Identifier of an outbox row.
    OutboxMessageId
);
