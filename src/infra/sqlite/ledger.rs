//! Append-only double-entry ledger store.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

use super::merchants::parse_timestamp;
use crate::domain::{signed_balance, Amount, Bucket, Direction, LedgerEntry, LedgerEvent};
use crate::infra::{is_unique_violation, PaymentError, Result};

/// Outcome of posting a balanced pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    /// Both legs inserted.
    Pair,
    /// A pair for this `(order, event)` already exists; nothing inserted.
    AlreadyPosted,
}

#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the balanced pair for one economic event inside the caller's
    /// transaction: the merchant leg in the event's direction and the
    /// clearing leg in the opposite direction, equal amounts.
    ///
    /// The unique index on `(order_id, event_type, bucket)` turns a retry
    /// into [`Posted::AlreadyPosted`]; callers treat that as success.
    #[allow(clippy::too_many_arguments)]
    pub async fn post_pair(
        conn: &mut SqliteConnection,
        order_id: &str,
        merchant_id: &str,
        asset: &str,
        amount: Amount,
        event: LedgerEvent,
        tx_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Posted> {
        let merchant_dir = event.merchant_direction();
        let clearing_dir = match merchant_dir {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        };

        for (bucket, direction) in [
            (Bucket::Merchant, merchant_dir),
            (Bucket::Clearing, clearing_dir),
        ] {
            let inserted = sqlx::query(
                r#"
                INSERT INTO ledger_entries (
                    id, order_id, merchant_id, asset, amount_minor,
                    bucket, direction, event_type, tx_hash, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(order_id)
            .bind(merchant_id)
            .bind(asset)
            .bind(amount.to_string())
            .bind(bucket.as_str())
            .bind(direction.as_str())
            .bind(event.as_str())
            .bind(tx_hash)
            .bind(now.to_rfc3339())
            .execute(&mut *conn)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(Posted::AlreadyPosted),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Posted::Pair)
    }

    /// Signed `sum(credit) - sum(debit)` over a merchant/asset/bucket, as a
    /// decimal string. Summed in Rust: decimal TEXT amounts exceed SQLite's
    /// integer range.
    pub async fn balance(
        &self,
        merchant_id: &str,
        asset: &str,
        bucket: Bucket,
    ) -> Result<String> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT direction, amount_minor FROM ledger_entries
            WHERE merchant_id = ? AND asset = ? AND bucket = ?
            "#,
        )
        .bind(merchant_id)
        .bind(asset)
        .bind(bucket.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut credits = U256::ZERO;
        let mut debits = U256::ZERO;
        for (direction, amount) in rows {
            let value = Amount::from_decimal(&amount)
                .map_err(|e| PaymentError::Internal(format!("stored amount invalid: {e}")))?
                .value();
            match direction.parse::<Direction>().map_err(PaymentError::Internal)? {
                Direction::Credit => credits += value,
                Direction::Debit => debits += value,
            }
        }

        Ok(signed_balance(credits, debits))
    }

    /// All postings for an order, oldest first.
    pub async fn entries_for_order(&self, order_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT id, order_id, merchant_id, asset, amount_minor,
                   bucket, direction, event_type, tx_hash, created_at
            FROM ledger_entries
            WHERE order_id = ?
            ORDER BY created_at ASC, bucket ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: String,
    order_id: String,
    merchant_id: String,
    asset: String,
    amount_minor: String,
    bucket: String,
    direction: String,
    event_type: String,
    tx_hash: Option<String>,
    created_at: String,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = PaymentError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: row.id,
            order_id: row.order_id,
            merchant_id: row.merchant_id,
            asset: row.asset,
            amount_minor: Amount::from_decimal(&row.amount_minor)
                .map_err(|e| PaymentError::Internal(format!("stored amount invalid: {e}")))?,
            bucket: row.bucket.parse().map_err(PaymentError::Internal)?,
            direction: row.direction.parse().map_err(PaymentError::Internal)?,
            event_type: row.event_type.parse().map_err(PaymentError::Internal)?,
            tx_hash: row.tx_hash,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::tests::test_pool;

    const ONE_TOKEN: &str = "1000000000000000000";

    async fn post(
        pool: &SqlitePool,
        order_id: &str,
        event: LedgerEvent,
        amount: &str,
    ) -> Posted {
        let mut conn = pool.acquire().await.unwrap();
        SqliteLedgerStore::post_pair(
            &mut conn,
            order_id,
            "m1",
            "USDT",
            Amount::from_decimal(amount).unwrap(),
            event,
            Some("0xTX"),
            Utc::now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn pair_is_balanced_and_unique() {
        let pool = test_pool().await;
        let store = SqliteLedgerStore::new(pool.clone());

        let first = post(&pool, "o1", LedgerEvent::PaymentConfirmed, ONE_TOKEN).await;
        assert_eq!(first, Posted::Pair);

        // A retry is absorbed by the (order, event, bucket) uniqueness.
        let retry = post(&pool, "o1", LedgerEvent::PaymentConfirmed, ONE_TOKEN).await;
        assert_eq!(retry, Posted::AlreadyPosted);

        let entries = store.entries_for_order("o1").await.unwrap();
        assert_eq!(entries.len(), 2);

        let merchant_leg = entries.iter().find(|e| e.bucket == Bucket::Merchant).unwrap();
        let clearing_leg = entries.iter().find(|e| e.bucket == Bucket::Clearing).unwrap();
        assert_eq!(merchant_leg.direction, Direction::Credit);
        assert_eq!(clearing_leg.direction, Direction::Debit);
        assert_eq!(merchant_leg.amount_minor, clearing_leg.amount_minor);
    }

    #[tokio::test]
    async fn balances_are_signed_big_integers() {
        let pool = test_pool().await;
        let store = SqliteLedgerStore::new(pool.clone());

        post(&pool, "o1", LedgerEvent::PaymentConfirmed, ONE_TOKEN).await;

        assert_eq!(
            store.balance("m1", "USDT", Bucket::Merchant).await.unwrap(),
            ONE_TOKEN
        );
        assert_eq!(
            store.balance("m1", "USDT", Bucket::Clearing).await.unwrap(),
            format!("-{ONE_TOKEN}")
        );
        // Unknown merchant/asset sums to zero.
        assert_eq!(store.balance("m2", "USDT", Bucket::Merchant).await.unwrap(), "0");
        assert_eq!(store.balance("m1", "USDC", Bucket::Merchant).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn refund_reverses_directions_and_restores_balances() {
        let pool = test_pool().await;
        let store = SqliteLedgerStore::new(pool.clone());

        post(&pool, "o1", LedgerEvent::PaymentConfirmed, ONE_TOKEN).await;
        post(&pool, "o1", LedgerEvent::Refund, ONE_TOKEN).await;

        let entries = store.entries_for_order("o1").await.unwrap();
        assert_eq!(entries.len(), 4);

        let refund_merchant = entries
            .iter()
            .find(|e| e.event_type == LedgerEvent::Refund && e.bucket == Bucket::Merchant)
            .unwrap();
        assert_eq!(refund_merchant.direction, Direction::Debit);

        assert_eq!(store.balance("m1", "USDT", Bucket::Merchant).await.unwrap(), "0");
        assert_eq!(store.balance("m1", "USDT", Bucket::Clearing).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn distinct_events_for_one_order_both_post() {
        let pool = test_pool().await;
        let store = SqliteLedgerStore::new(pool.clone());

        assert_eq!(
            post(&pool, "o1", LedgerEvent::PaymentConfirmed, ONE_TOKEN).await,
            Posted::Pair
        );
        assert_eq!(post(&pool, "o1", LedgerEvent::Refund, ONE_TOKEN).await, Posted::Pair);
        // But each event posts at most once.
        assert_eq!(
            post(&pool, "o1", LedgerEvent::Refund, ONE_TOKEN).await,
            Posted::AlreadyPosted
        );
        assert_eq!(store.entries_for_order("o1").await.unwrap().len(), 4);
    }
}
