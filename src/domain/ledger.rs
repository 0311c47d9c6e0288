//! Double-entry ledger types.
//!
//! Every economic event posts exactly two entries with opposite directions
//! and equal amounts: one against the merchant bucket, one against the
//! clearing counter-account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Amount;

/// Ledger account category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Merchant,
    Clearing,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merchant => "merchant",
            Self::Clearing => "clearing",
        }
    }
}

impl std::str::FromStr for Bucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merchant" => Ok(Self::Merchant),
            "clearing" => Ok(Self::Clearing),
            other => Err(format!("unknown ledger bucket: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            other => Err(format!("unknown ledger direction: {other}")),
        }
    }
}

/// Economic event a ledger pair records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEvent {
    PaymentConfirmed,
    Refund,
}

impl LedgerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentConfirmed => "PAYMENT_CONFIRMED",
            Self::Refund => "REFUND",
        }
    }

    /// Direction of the merchant-bucket leg; the clearing leg is always the
    /// opposite. A confirmed payment credits the merchant, a refund debits.
    pub fn merchant_direction(&self) -> Direction {
        match self {
            Self::PaymentConfirmed => Direction::Credit,
            Self::Refund => Direction::Debit,
        }
    }
}

impl std::str::FromStr for LedgerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYMENT_CONFIRMED" => Ok(Self::PaymentConfirmed),
            "REFUND" => Ok(Self::Refund),
            other => Err(format!("unknown ledger event: {other}")),
        }
    }
}

/// An immutable ledger posting. Entries are appended in balanced pairs and
/// never mutated or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub order_id: String,
    pub merchant_id: String,
    pub asset: String,
    pub amount_minor: Amount,
    pub bucket: Bucket,
    pub direction: Direction,
    pub event_type: LedgerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}
