//! Shopping cart lines and delivery addresses.

use chrono::{DateTime, Utc};
use common::{AddressId, UserId, VariantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One line of a user's cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub user_id: UserId,
    pub variant_id: VariantId,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(user_id: UserId, variant_id: VariantId, quantity: u32) -> Self {
        Self {
            user_id,
            variant_id,
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address field {0} is required")]
    MissingField(&'static str),

    #[error("Invalid postal code: {0}")]
    InvalidPostalCode(String),
}

/// A saved delivery address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub user_id: UserId,
    pub recipient: String,
    pub phone: String,
    pub line1: String,
    pub city: String,
    pub postal_code: String,
    pub created_at: DateTime<Utc>,
}

/// An inline address supplied at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAddress {
    pub recipient: String,
    pub phone: String,
    pub line1: String,
    pub city: String,
    pub postal_code: String,
}

impl NewAddress {
    pub fn validate(&self) -> Result<(), AddressError> {
        for (name, value) in [
            ("recipient", &self.recipient),
            ("phone", &self.phone),
            ("line1", &self.line1),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
        ] {
            if value.trim().is_empty() {
                return Err(AddressError::MissingField(name));
            }
        }

        let postal = self.postal_code.trim();
        if !postal.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ' ') {
            return Err(AddressError::InvalidPostalCode(postal.to_string()));
        }

        Ok(())
    }

    /// Validates and assigns the address to a user.
    pub fn into_address(self, user_id: UserId, now: DateTime<Utc>) -> Result<Address, AddressError> {
        self.validate()?;
        Ok(Address {
            id: AddressId::new(),
            user_id,
            recipient: self.recipient.trim().to_string(),
            phone: self.phone.trim().to_string(),
            line1: self.line1.trim().to_string(),
            city: self.city.trim().to_string(),
            postal_code: self.postal_code.trim().to_string(),
            created_at: now,
        })
    }
}
