//! Payment orders and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Amount;

/// Status of a payment order.
///
/// ```text
/// PENDING --> CONFIRMING --> PAID --> SETTLED
///    |             |          |
///    |             |          +-----> REFUNDED
///    +-------------+----------------> FAILED (timeout; PENDING only)
/// ```
///
/// SETTLED, REFUNDED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order created, no payment observed yet.
    Pending,
    /// A payment was observed but is not yet verified.
    Confirming,
    /// The on-chain transfer was verified and posted to the ledger.
    Paid,
    /// Settlement delay elapsed; funds belong to the merchant.
    Settled,
    /// The payment was reversed.
    Refunded,
    /// The order timed out before any payment arrived.
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Refunded | Self::Failed)
    }

    /// Database/wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirming => "CONFIRMING",
            Self::Paid => "PAID",
            Self::Settled => "SETTLED",
            Self::Refunded => "REFUNDED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMING" => Ok(Self::Confirming),
            "PAID" => Ok(Self::Paid),
            "SETTLED" => Ok(Self::Settled),
            "REFUNDED" => Ok(Self::Refunded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A payment order.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub merchant_id: String,
    pub amount_minor: Amount,
    pub asset: String,
    pub chain: String,
    pub status: OrderStatus,
    /// The merchant-controlled wallet the customer pays into.
    pub deposit_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_wallet_address: Option<String>,
    pub order_idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_block: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create an order. The store assigns id, status and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub merchant_id: String,
    pub amount_minor: Amount,
    pub asset: String,
    pub chain: String,
    pub deposit_address: String,
    pub idempotency_key: String,
}
