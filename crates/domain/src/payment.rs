//! Payment gateway attempts.

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Money;

/// The status of one gateway attempt.
///
/// ```text
/// Pending ──► VerificationInProgress ──┬──► Success
///    │                 │               └──► Failed
///    └─────────────────┴──► Failed | Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentStatus {
    #[default]
    Pending,
    VerificationInProgress,
    Success,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success | PaymentStatus::Failed | PaymentStatus::Expired
        )
    }

    /// Returns true while the outcome is still unknown.
    pub fn is_unresolved(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::VerificationInProgress => "VerificationInProgress",
            PaymentStatus::Success => "Success",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Expired => "Expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            PaymentStatus::Pending,
            PaymentStatus::VerificationInProgress,
            PaymentStatus::Success,
            PaymentStatus::Failed,
            PaymentStatus::Expired,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("Payment {payment_id} is already {status}")]
    AlreadyResolved {
        payment_id: PaymentId,
        status: PaymentStatus,
    },
}

/// Verification details returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationDetails {
    pub reference_id: Option<String>,
    pub card_mask: Option<String>,
    pub fee: Option<Money>,
}

/// One gateway attempt for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: PaymentId,
    pub order_id: OrderId,
    /// Gateway token identifying the attempt.
    pub authority: String,
    pub payment_url: String,
    pub status: PaymentStatus,
    pub amount: Money,
    pub reference_id: Option<String>,
    pub card_mask: Option<String>,
    pub fee: Option<Money>,
    pub verify_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub version: Version,
}

impl PaymentTransaction {
    pub fn new(
        order_id: OrderId,
        authority: impl Into<String>,
        payment_url: impl Into<String>,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            authority: authority.into(),
            payment_url: payment_url.into(),
            status: PaymentStatus::Pending,
            amount,
            reference_id: None,
            card_mask: None,
            fee: None,
            verify_attempts: 0,
            created_at: now,
            updated_at: now,
            verified_at: None,
            version: Version::initial(),
        }
    }

    /// Marks a verification call as started.
    pub fn begin_verification(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.ensure_unresolved()?;
        self.status = PaymentStatus::VerificationInProgress;
        self.verify_attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        details: VerificationDetails,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        self.ensure_unresolved()?;
        self.status = PaymentStatus::Success;
        self.reference_id = details.reference_id;
        self.card_mask = details.card_mask;
        self.fee = details.fee;
        self.verified_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.ensure_unresolved()?;
        self.status = PaymentStatus::Failed;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.ensure_unresolved()?;
        self.status = PaymentStatus::Expired;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_unresolved(&self) -> Result<(), PaymentError> {
        if self.status.is_terminal() {
            return Err(PaymentError::AlreadyResolved {
                payment_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}
