//! Order store: idempotent creation and guarded state transitions.
//!
//! Every transition is a conditional UPDATE whose WHERE clause names the
//! expected prior status; "applied vs no-op" is decided solely by the
//! affected-row count. Concurrent workers and sweepers can therefore race
//! freely: the second writer observes zero rows and backs off.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, warn};
use uuid::Uuid;

use super::merchants::parse_timestamp;
use crate::domain::{Amount, NewOrder, Order, OrderStatus};
use crate::infra::{is_unique_violation, PaymentError, Result};

/// Outcome of a guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Exactly one row changed.
    Applied,
    /// The guard did not match; another writer got there first.
    Noop,
}

impl Transition {
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    fn from_rows_affected(rows: u64) -> Self {
        if rows == 1 {
            Self::Applied
        } else {
            Self::Noop
        }
    }
}

#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new PENDING order, or return the existing row when the
    /// `(merchant_id, idempotency_key)` pair was already used. The second
    /// return value is `false` for a replayed creation.
    ///
    /// The prior-lookup path and the unique-violation path produce the same
    /// observable result, so a race between two identical requests is
    /// harmless.
    pub async fn create(&self, new: NewOrder) -> Result<(Order, bool)> {
        if let Some(existing) = self
            .find_by_idempotency_key(&new.merchant_id, &new.idempotency_key)
            .await?
        {
            return Ok((existing, false));
        }

        let order = Order {
            id: Uuid::new_v4().to_string(),
            merchant_id: new.merchant_id,
            amount_minor: new.amount_minor,
            asset: new.asset,
            chain: new.chain,
            status: OrderStatus::Pending,
            deposit_address: new.deposit_address,
            customer_wallet_address: None,
            order_idempotency_key: new.idempotency_key,
            refund_idempotency_key: None,
            tx_hash: None,
            confirmed_block: None,
            paid_at: None,
            created_at: Utc::now(),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (
                id, merchant_id, amount_minor, asset, chain, status,
                deposit_address, order_idempotency_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.merchant_id)
        .bind(order.amount_minor.to_string())
        .bind(&order.asset)
        .bind(&order.chain)
        .bind(order.status.as_str())
        .bind(&order.deposit_address)
        .bind(&order.order_idempotency_key)
        .bind(order.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(order_id = %order.id, merchant_id = %order.merchant_id, "order inserted");
                Ok((order, true))
            }
            Err(e) if is_unique_violation(&e) => {
                // Lost the race to a concurrent identical request.
                let existing = self
                    .find_by_idempotency_key(
                        &order.merchant_id,
                        &order.order_idempotency_key,
                    )
                    .await?
                    .ok_or_else(|| {
                        PaymentError::Internal(
                            "idempotency conflict but no existing order".to_string(),
                        )
                    })?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&select_order("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        merchant_id: &str,
        key: &str,
    ) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&select_order(
            "WHERE merchant_id = ? AND order_idempotency_key = ?",
        ))
        .bind(merchant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    /// The order a refund idempotency key was already recorded against, if
    /// any. Used to replay the prior refund outcome.
    pub async fn find_by_refund_key(
        &self,
        order_id: &str,
        refund_key: &str,
    ) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&select_order(
            "WHERE id = ? AND refund_idempotency_key = ?",
        ))
        .bind(order_id)
        .bind(refund_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    /// Guarded PENDING/CONFIRMING -> PAID. Records the observed tx hash,
    /// the confirming block when known, and the paid-at instant.
    ///
    /// A unique violation on `orders.tx_hash` means another order already
    /// claimed this transaction; that serializes to a no-op just like a
    /// failed guard.
    pub async fn transition_to_paid(
        conn: &mut SqliteConnection,
        id: &str,
        tx_hash: &str,
        confirmed_block: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'PAID', tx_hash = ?, confirmed_block = ?, paid_at = ?
            WHERE id = ? AND status IN ('PENDING', 'CONFIRMING')
            "#,
        )
        .bind(tx_hash)
        .bind(confirmed_block)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(conn)
        .await;

        match updated {
            Ok(result) => Ok(Transition::from_rows_affected(result.rows_affected())),
            Err(e) if is_unique_violation(&e) => {
                warn!(order_id = %id, tx_hash = %tx_hash, "tx hash already claimed by another order");
                Ok(Transition::Noop)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Guarded PAID -> REFUNDED, recording the refund idempotency key.
    pub async fn transition_to_refunded(
        conn: &mut SqliteConnection,
        id: &str,
        refund_key: &str,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'REFUNDED', refund_idempotency_key = ?
            WHERE id = ? AND status = 'PAID'
            "#,
        )
        .bind(refund_key)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(Transition::from_rows_affected(result.rows_affected()))
    }

    /// Ids of PAID orders whose settlement delay has elapsed.
    pub async fn find_for_settlement(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM orders WHERE status = 'PAID' AND paid_at <= ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Ids of PENDING orders older than the order TTL.
    pub async fn find_for_timeout(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM orders WHERE status = 'PENDING' AND created_at <= ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Guarded PAID -> SETTLED.
    pub async fn mark_settled(&self, id: &str) -> Result<Transition> {
        let result =
            sqlx::query("UPDATE orders SET status = 'SETTLED' WHERE id = ? AND status = 'PAID'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(Transition::from_rows_affected(result.rows_affected()))
    }

    /// Guarded PENDING -> FAILED.
    pub async fn mark_failed(&self, id: &str) -> Result<Transition> {
        let result =
            sqlx::query("UPDATE orders SET status = 'FAILED' WHERE id = ? AND status = 'PENDING'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(Transition::from_rows_affected(result.rows_affected()))
    }

    /// PAID orders awaiting settlement for a merchant/asset.
    pub async fn count_unsettled_paid(&self, merchant_id: &str, asset: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE merchant_id = ? AND asset = ? AND status = 'PAID'",
        )
        .bind(merchant_id)
        .bind(asset)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

fn select_order(where_clause: &str) -> String {
    format!(
        r#"
        SELECT id, merchant_id, amount_minor, asset, chain, status,
               deposit_address, customer_wallet_address,
               order_idempotency_key, refund_idempotency_key,
               tx_hash, confirmed_block, paid_at, created_at
        FROM orders {where_clause}
        "#
    )
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    merchant_id: String,
    amount_minor: String,
    asset: String,
    chain: String,
    status: String,
    deposit_address: String,
    customer_wallet_address: Option<String>,
    order_idempotency_key: String,
    refund_idempotency_key: Option<String>,
    tx_hash: Option<String>,
    confirmed_block: Option<i64>,
    paid_at: Option<String>,
    created_at: String,
}

impl TryFrom<OrderRow> for Order {
    type Error = PaymentError;

    fn try_from(row: OrderRow) -> Result<Self> {
        let amount_minor = Amount::from_decimal(&row.amount_minor)
            .map_err(|e| PaymentError::Internal(format!("stored amount invalid: {e}")))?;
        let status: OrderStatus = row
            .status
            .parse()
            .map_err(PaymentError::Internal)?;
        let paid_at = row.paid_at.as_deref().map(parse_timestamp).transpose()?;
        let created_at = parse_timestamp(&row.created_at)?;

        Ok(Order {
            id: row.id,
            merchant_id: row.merchant_id,
            amount_minor,
            asset: row.asset,
            chain: row.chain,
            status,
            deposit_address: row.deposit_address,
            customer_wallet_address: row.customer_wallet_address,
            order_idempotency_key: row.order_idempotency_key,
            refund_idempotency_key: row.refund_idempotency_key,
            tx_hash: row.tx_hash,
            confirmed_block: row.confirmed_block,
            paid_at,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::tests::test_pool;
    use crate::infra::sqlite::SqliteMerchantStore;

    async fn seed_merchant(pool: &SqlitePool) -> String {
        let merchants = SqliteMerchantStore::new(pool.clone());
        merchants
            .create("Acme", "0xAAA", "pg_orders_test")
            .await
            .unwrap()
            .id
    }

    fn new_order(merchant_id: &str, key: &str) -> NewOrder {
        NewOrder {
            merchant_id: merchant_id.to_string(),
            amount_minor: Amount::from_decimal("1000000000000000000").unwrap(),
            asset: "USDT".to_string(),
            chain: "BSC".to_string(),
            deposit_address: "0xAAA".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_merchant_and_key() {
        let pool = test_pool().await;
        let merchant_id = seed_merchant(&pool).await;
        let store = SqliteOrderStore::new(pool);

        let (first, inserted) = store.create(new_order(&merchant_id, "k1")).await.unwrap();
        assert!(inserted);
        assert_eq!(first.status, OrderStatus::Pending);

        let (replay, inserted) = store.create(new_order(&merchant_id, "k1")).await.unwrap();
        assert!(!inserted);
        assert_eq!(replay.id, first.id);
        assert_eq!(replay.deposit_address, first.deposit_address);

        let (other, inserted) = store.create(new_order(&merchant_id, "k2")).await.unwrap();
        assert!(inserted);
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn paid_transition_applies_once() {
        let pool = test_pool().await;
        let merchant_id = seed_merchant(&pool).await;
        let store = SqliteOrderStore::new(pool.clone());
        let (order, _) = store.create(new_order(&merchant_id, "k1")).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let first =
            SqliteOrderStore::transition_to_paid(&mut conn, &order.id, "0xTX1", Some(42), now)
                .await
                .unwrap();
        assert!(first.was_applied());

        // Second writer loses the guard.
        let second =
            SqliteOrderStore::transition_to_paid(&mut conn, &order.id, "0xTX1", Some(42), now)
                .await
                .unwrap();
        assert_eq!(second, Transition::Noop);
        drop(conn);

        let paid = store.get(&order.id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.tx_hash.as_deref(), Some("0xTX1"));
        assert_eq!(paid.confirmed_block, Some(42));
        assert!(paid.paid_at.is_some());
    }

    #[tokio::test]
    async fn tx_hash_is_claimed_by_one_order_only() {
        let pool = test_pool().await;
        let merchant_id = seed_merchant(&pool).await;
        let store = SqliteOrderStore::new(pool.clone());
        let (o1, _) = store.create(new_order(&merchant_id, "k1")).await.unwrap();
        let (o2, _) = store.create(new_order(&merchant_id, "k2")).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        assert!(
            SqliteOrderStore::transition_to_paid(&mut conn, &o1.id, "0xSAME", None, now)
                .await
                .unwrap()
                .was_applied()
        );

        // The unique index on tx_hash serializes the second claim to a no-op.
        let second =
            SqliteOrderStore::transition_to_paid(&mut conn, &o2.id, "0xSAME", None, now)
                .await
                .unwrap();
        assert_eq!(second, Transition::Noop);
        drop(conn);
        assert_eq!(
            store.get(&o2.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn terminal_states_reject_paid_transition() {
        let pool = test_pool().await;
        let merchant_id = seed_merchant(&pool).await;
        let store = SqliteOrderStore::new(pool.clone());
        let (order, _) = store.create(new_order(&merchant_id, "k1")).await.unwrap();

        assert!(store.mark_failed(&order.id).await.unwrap().was_applied());

        let mut conn = pool.acquire().await.unwrap();
        let after = SqliteOrderStore::transition_to_paid(
            &mut conn,
            &order.id,
            "0xLATE",
            None,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(after, Transition::Noop);
        drop(conn);
        assert_eq!(
            store.get(&order.id).await.unwrap().unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn sweep_queries_respect_cutoffs() {
        let pool = test_pool().await;
        let merchant_id = seed_merchant(&pool).await;
        let store = SqliteOrderStore::new(pool.clone());
        let (paid, _) = store.create(new_order(&merchant_id, "k1")).await.unwrap();
        let (pending, _) = store.create(new_order(&merchant_id, "k2")).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        SqliteOrderStore::transition_to_paid(&mut conn, &paid.id, "0xTX", None, Utc::now())
            .await
            .unwrap();
        drop(conn);

        let future = Utc::now() + chrono::Duration::hours(1);
        let past = Utc::now() - chrono::Duration::hours(1);

        assert_eq!(store.find_for_settlement(future).await.unwrap(), vec![paid.id.clone()]);
        assert!(store.find_for_settlement(past).await.unwrap().is_empty());

        assert_eq!(store.find_for_timeout(future).await.unwrap(), vec![pending.id.clone()]);
        assert!(store.find_for_timeout(past).await.unwrap().is_empty());

        assert!(store.mark_settled(&paid.id).await.unwrap().was_applied());
        assert!(store.mark_failed(&pending.id).await.unwrap().was_applied());
        // Both are terminal now; the guards turn re-runs into no-ops.
        assert_eq!(store.mark_settled(&paid.id).await.unwrap(), Transition::Noop);
        assert_eq!(store.mark_failed(&pending.id).await.unwrap(), Transition::Noop);
    }
}
