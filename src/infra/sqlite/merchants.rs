//! Merchant store.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::Merchant;
use crate::infra::{PaymentError, Result};

#[derive(Clone)]
pub struct SqliteMerchantStore {
    pool: SqlitePool,
}

impl SqliteMerchantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a merchant with a freshly generated id.
    pub async fn create(
        &self,
        name: &str,
        merchant_wallet_address: &str,
        api_key: &str,
    ) -> Result<Merchant> {
        let merchant = Merchant {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            merchant_wallet_address: merchant_wallet_address.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO merchants (id, name, api_key, merchant_wallet_address, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&merchant.id)
        .bind(&merchant.name)
        .bind(&merchant.api_key)
        .bind(&merchant.merchant_wallet_address)
        .bind(merchant.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(merchant)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Merchant>> {
        let row = sqlx::query_as::<_, MerchantRow>(
            "SELECT id, name, api_key, merchant_wallet_address, created_at FROM merchants WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Merchant::try_from).transpose()
    }

    /// Resolve the merchant presenting this API key, if any.
    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Merchant>> {
        let row = sqlx::query_as::<_, MerchantRow>(
            "SELECT id, name, api_key, merchant_wallet_address, created_at FROM merchants WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Merchant::try_from).transpose()
    }
}

#[derive(Debug, FromRow)]
struct MerchantRow {
    id: String,
    name: String,
    api_key: String,
    merchant_wallet_address: String,
    created_at: String,
}

impl TryFrom<MerchantRow> for Merchant {
    type Error = PaymentError;

    fn try_from(row: MerchantRow) -> Result<Self> {
        let created_at = parse_timestamp(&row.created_at)?;
        Ok(Merchant {
            id: row.id,
            name: row.name,
            api_key: row.api_key,
            merchant_wallet_address: row.merchant_wallet_address,
            created_at,
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PaymentError::Internal(format!("invalid timestamp {s:?}: {e}")))
}
