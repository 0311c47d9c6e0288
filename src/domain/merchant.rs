//! Merchant accounts. Read-only from the payment core's perspective.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Merchant {
    pub id: String,
    pub name: String,
    /// Presented by clients in the `X-API-Key` header.
    #[serde(skip_serializing)]
    pub api_key: String,
    pub merchant_wallet_address: String,
    pub created_at: DateTime<Utc>,
}
