//! The state-transition engine.
//!
//! Transitions are the only operations that both mutate order status and
//! write ledger entries, and they do so atomically: one transaction holds
//! the guarded status update and the balanced ledger pair, and rolls back
//! as a unit on any error or deadline. The guarded update decides who won
//! a race; the ledger uniqueness makes a retried winner idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::chain::{Verification, VerifierRegistry};
use crate::domain::{Amount, LedgerEvent, Merchant, Order, OrderStatus};
use crate::infra::sqlite::{Posted, SqliteLedgerStore, SqliteMerchantStore, SqliteOrderStore};
use crate::infra::{PaymentError, RecentTxCache, Result};
use crate::metrics::Counters;

/// Outcome of processing a detected payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// This call verified the transfer and posted the ledger pair.
    Confirmed,
    /// The order was already past PENDING/CONFIRMING; nothing changed.
    AlreadyProcessed { status: OrderStatus },
}

impl PaymentOutcome {
    /// Status to report to the submitter.
    pub fn status(&self) -> OrderStatus {
        match self {
            Self::Confirmed => OrderStatus::Paid,
            Self::AlreadyProcessed { status } => *status,
        }
    }
}

/// Outcome of a refund request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundOutcome {
    pub status: OrderStatus,
    /// True when an idempotency-key replay (or an already-REFUNDED order)
    /// returned the prior outcome instead of performing the refund.
    pub replayed: bool,
}

enum TxResult {
    Applied,
    LostRace,
}

pub struct PaymentEngine {
    pool: SqlitePool,
    orders: SqliteOrderStore,
    merchants: SqliteMerchantStore,
    verifiers: Arc<VerifierRegistry>,
    dedupe: Arc<RecentTxCache>,
    counters: Arc<Counters>,
    db_timeout: Duration,
}

impl PaymentEngine {
    pub fn new(
        pool: SqlitePool,
        verifiers: Arc<VerifierRegistry>,
        dedupe: Arc<RecentTxCache>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            orders: SqliteOrderStore::new(pool.clone()),
            merchants: SqliteMerchantStore::new(pool.clone()),
            pool,
            verifiers,
            dedupe,
            counters,
            db_timeout: Duration::from_secs(3),
        }
    }

    /// Verify one detected payment against the chain and, on success, apply
    /// the PAYMENT_CONFIRMED transition.
    ///
    /// `amount_override`, when present, replaces the order amount as both
    /// the expected on-chain value and the posted ledger amount, so the
    /// ledger always records exactly what the verifier matched.
    pub async fn process_payment(
        &self,
        order_id: &str,
        tx_hash: &str,
        amount_override: Option<Amount>,
    ) -> Result<PaymentOutcome> {
        let order = self.load_order(order_id).await?;

        // PAID and beyond: replaying the event must not touch the ledger.
        // FAILED orders flow through to the guarded update's no-op path.
        if matches!(
            order.status,
            OrderStatus::Paid | OrderStatus::Settled | OrderStatus::Refunded
        ) {
            return Ok(PaymentOutcome::AlreadyProcessed {
                status: order.status,
            });
        }

        let merchant = self.load_merchant(&order.merchant_id).await?;
        if merchant.merchant_wallet_address.is_empty() {
            return Err(PaymentError::MissingWalletAddress(merchant.id));
        }

        let expected = amount_override.unwrap_or(order.amount_minor);

        let verifier = self
            .verifiers
            .resolve(&order.asset, &order.chain)
            .ok_or_else(|| PaymentError::UnsupportedChain {
                asset: order.asset.clone(),
                chain: order.chain.clone(),
            })?;

        let verification = verifier
            .verify(tx_hash, &merchant.merchant_wallet_address, expected)
            .await?;

        match verification {
            Verification::Verified { block_number } => {
                self.confirm(&order, tx_hash, block_number, expected).await
            }
            Verification::NotFound => Err(PaymentError::VerificationFailed {
                tx_hash: tx_hash.to_string(),
                reason: "transaction not found on chain".to_string(),
            }),
            Verification::Mismatch => Err(PaymentError::VerificationFailed {
                tx_hash: tx_hash.to_string(),
                reason: "no matching transfer to the deposit address".to_string(),
            }),
        }
    }

    /// Guarded PAID transition plus balanced ledger pair, in one
    /// transaction under the DB deadline.
    async fn confirm(
        &self,
        order: &Order,
        tx_hash: &str,
        block_number: Option<u64>,
        amount: Amount,
    ) -> Result<PaymentOutcome> {
        let confirmed_block = block_number.and_then(|b| i64::try_from(b).ok());

        let result = timeout(self.db_timeout, async {
            let mut tx = self.pool.begin().await?;
            let now = Utc::now();

            let transition = SqliteOrderStore::transition_to_paid(
                &mut *tx,
                &order.id,
                tx_hash,
                confirmed_block,
                now,
            )
            .await?;

            if !transition.was_applied() {
                // Another worker or a competing tx-hash claim got here
                // first; there is nothing to post.
                tx.commit().await?;
                return Ok::<_, PaymentError>(TxResult::LostRace);
            }

            let posted = SqliteLedgerStore::post_pair(
                &mut *tx,
                &order.id,
                &order.merchant_id,
                &order.asset,
                amount,
                LedgerEvent::PaymentConfirmed,
                Some(tx_hash),
                now,
            )
            .await?;
            if posted == Posted::AlreadyPosted {
                warn!(order_id = %order.id, "ledger pair already present for fresh PAID transition");
            }

            tx.commit().await?;
            Ok(TxResult::Applied)
        })
        .await
        .map_err(|_| PaymentError::Timeout("payment confirmation"))??;

        match result {
            TxResult::Applied => {
                self.dedupe.record(tx_hash).await;
                self.counters.inc_payments_detected();
                info!(
                    order_id = %order.id,
                    merchant_id = %order.merchant_id,
                    asset = %order.asset,
                    amount_minor = %amount,
                    tx_hash = %tx_hash,
                    "payment confirmed"
                );
                Ok(PaymentOutcome::Confirmed)
            }
            TxResult::LostRace => {
                let current = self.load_order(&order.id).await?;
                Ok(PaymentOutcome::AlreadyProcessed {
                    status: current.status,
                })
            }
        }
    }

    /// Refund a PAID order: guarded REFUNDED transition plus the reversed
    /// ledger pair, in one transaction.
    pub async fn refund(
        &self,
        order_id: &str,
        refund_key: &str,
        amount: Option<Amount>,
        refund_tx_hash: Option<&str>,
    ) -> Result<RefundOutcome> {
        // Key replay returns the prior outcome unchanged.
        if let Some(prior) = timeout(
            self.db_timeout,
            self.orders.find_by_refund_key(order_id, refund_key),
        )
        .await
        .map_err(|_| PaymentError::Timeout("refund key lookup"))??
        {
            return Ok(RefundOutcome {
                status: prior.status,
                replayed: true,
            });
        }

        let order = self.load_order(order_id).await?;
        match order.status {
            OrderStatus::Refunded => {
                return Ok(RefundOutcome {
                    status: OrderStatus::Refunded,
                    replayed: true,
                })
            }
            OrderStatus::Settled => {
                return Err(PaymentError::CannotRefundSettled(order.id))
            }
            OrderStatus::Pending | OrderStatus::Confirming | OrderStatus::Failed => {
                return Err(PaymentError::OrderNotPaid(order.id))
            }
            OrderStatus::Paid => {}
        }

        let amount = amount.unwrap_or(order.amount_minor);
        if amount > order.amount_minor {
            return Err(PaymentError::RefundExceedsOrder);
        }

        let result = timeout(self.db_timeout, async {
            let mut tx = self.pool.begin().await?;
            let now = Utc::now();

            let transition =
                SqliteOrderStore::transition_to_refunded(&mut *tx, &order.id, refund_key).await?;
            if !transition.was_applied() {
                tx.commit().await?;
                return Ok::<_, PaymentError>(TxResult::LostRace);
            }

            let posted = SqliteLedgerStore::post_pair(
                &mut *tx,
                &order.id,
                &order.merchant_id,
                &order.asset,
                amount,
                LedgerEvent::Refund,
                refund_tx_hash,
                now,
            )
            .await?;
            if posted == Posted::AlreadyPosted {
                warn!(order_id = %order.id, "refund pair already present for fresh REFUNDED transition");
            }

            tx.commit().await?;
            Ok(TxResult::Applied)
        })
        .await
        .map_err(|_| PaymentError::Timeout("refund"))??;

        match result {
            TxResult::Applied => {
                self.counters.inc_refunds_processed();
                info!(
                    order_id = %order.id,
                    merchant_id = %order.merchant_id,
                    amount_minor = %amount,
                    "refund processed"
                );
                Ok(RefundOutcome {
                    status: OrderStatus::Refunded,
                    replayed: false,
                })
            }
            TxResult::LostRace => {
                // The guard failed between the status check and the update.
                let current = self.load_order(&order.id).await?;
                match current.status {
                    OrderStatus::Refunded => Ok(RefundOutcome {
                        status: OrderStatus::Refunded,
                        replayed: true,
                    }),
                    OrderStatus::Settled => Err(PaymentError::CannotRefundSettled(current.id)),
                    _ => Err(PaymentError::OrderNotPaid(current.id)),
                }
            }
        }
    }

    async fn load_order(&self, id: &str) -> Result<Order> {
        timeout(self.db_timeout, self.orders.get(id))
            .await
            .map_err(|_| PaymentError::Timeout("order load"))??
            .ok_or_else(|| PaymentError::OrderNotFound(id.to_string()))
    }

    async fn load_merchant(&self, id: &str) -> Result<Merchant> {
        timeout(self.db_timeout, self.merchants.get(id))
            .await
            .map_err(|_| PaymentError::Timeout("merchant load"))??
            .ok_or_else(|| PaymentError::MerchantNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainVerifier, Verification};
    use crate::domain::{Bucket, NewOrder};
    use crate::infra::sqlite::tests::test_pool;
    use async_trait::async_trait;

    const ONE_TOKEN: &str = "1000000000000000000";

    /// Verifier returning a fixed outcome, for driving the engine without
    /// a chain.
    struct StaticVerifier(Verification);

    #[async_trait]
    impl ChainVerifier for StaticVerifier {
        async fn verify(
            &self,
            _tx_hash: &str,
            _destination: &str,
            _expected: Amount,
        ) -> Result<Verification> {
            Ok(self.0)
        }
    }

    struct Harness {
        engine: PaymentEngine,
        orders: SqliteOrderStore,
        ledger: SqliteLedgerStore,
        counters: Arc<Counters>,
        merchant_id: String,
    }

    async fn harness(verification: Verification) -> Harness {
        let pool = test_pool().await;
        let merchants = SqliteMerchantStore::new(pool.clone());
        let merchant = merchants
            .create("Acme", "0xAAA", "pg_engine_test")
            .await
            .unwrap();

        let mut registry = VerifierRegistry::new();
        registry.register("USDT", "BSC", Arc::new(StaticVerifier(verification)));

        let counters = Arc::new(Counters::new());
        let engine = PaymentEngine::new(
            pool.clone(),
            Arc::new(registry),
            Arc::new(RecentTxCache::new(Duration::from_secs(120))),
            counters.clone(),
        );

        Harness {
            engine,
            orders: SqliteOrderStore::new(pool.clone()),
            ledger: SqliteLedgerStore::new(pool),
            counters,
            merchant_id: merchant.id,
        }
    }

    async fn create_order(h: &Harness, key: &str, amount: &str) -> Order {
        let (order, _) = h
            .orders
            .create(NewOrder {
                merchant_id: h.merchant_id.clone(),
                amount_minor: Amount::from_decimal(amount).unwrap(),
                asset: "USDT".to_string(),
                chain: "BSC".to_string(),
                deposit_address: "0xAAA".to_string(),
                idempotency_key: key.to_string(),
            })
            .await
            .unwrap();
        order
    }

    #[tokio::test]
    async fn verified_payment_confirms_and_posts_pair() {
        let h = harness(Verification::Verified {
            block_number: Some(123),
        })
        .await;
        let order = create_order(&h, "k1", ONE_TOKEN).await;

        let outcome = h
            .engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::Confirmed);

        let paid = h.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.tx_hash.as_deref(), Some("0xTX1"));
        assert_eq!(paid.confirmed_block, Some(123));

        assert_eq!(h.ledger.entries_for_order(&order.id).await.unwrap().len(), 2);
        assert_eq!(
            h.ledger
                .balance(&h.merchant_id, "USDT", Bucket::Merchant)
                .await
                .unwrap(),
            ONE_TOKEN
        );
        assert_eq!(
            h.ledger
                .balance(&h.merchant_id, "USDT", Bucket::Clearing)
                .await
                .unwrap(),
            format!("-{ONE_TOKEN}")
        );
        assert_eq!(h.counters.payments_detected(), 1);
    }

    #[tokio::test]
    async fn resubmission_is_a_noop_with_one_ledger_pair() {
        let h = harness(Verification::Verified { block_number: None }).await;
        let order = create_order(&h, "k1", ONE_TOKEN).await;

        h.engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        let second = h
            .engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        assert_eq!(
            second,
            PaymentOutcome::AlreadyProcessed {
                status: OrderStatus::Paid
            }
        );

        assert_eq!(h.ledger.entries_for_order(&order.id).await.unwrap().len(), 2);
        assert_eq!(h.counters.payments_detected(), 1);
    }

    #[tokio::test]
    async fn mismatch_leaves_order_pending() {
        let h = harness(Verification::Mismatch).await;
        let order = create_order(&h, "k1", ONE_TOKEN).await;

        let err = h
            .engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::VerificationFailed { .. }));

        let unchanged = h.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, OrderStatus::Pending);
        assert!(h.ledger.entries_for_order(&order.id).await.unwrap().is_empty());
        assert_eq!(h.counters.payments_detected(), 0);
    }

    #[tokio::test]
    async fn unknown_order_and_unsupported_chain_are_permanent_errors() {
        let h = harness(Verification::Verified { block_number: None }).await;

        let err = h
            .engine
            .process_payment("missing", "0xTX", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::OrderNotFound(_)));

        let (order, _) = h
            .orders
            .create(NewOrder {
                merchant_id: h.merchant_id.clone(),
                amount_minor: Amount::from_decimal(ONE_TOKEN).unwrap(),
                asset: "USDC".to_string(),
                chain: "POLYGON".to_string(),
                deposit_address: "0xAAA".to_string(),
                idempotency_key: "k-other".to_string(),
            })
            .await
            .unwrap();
        let err = h
            .engine
            .process_payment(&order.id, "0xTX", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedChain { .. }));
    }

    #[tokio::test]
    async fn failed_order_hits_the_guarded_noop_path() {
        let h = harness(Verification::Verified { block_number: None }).await;
        let order = create_order(&h, "k1", ONE_TOKEN).await;
        h.orders.mark_failed(&order.id).await.unwrap();

        let outcome = h
            .engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::AlreadyProcessed {
                status: OrderStatus::Failed
            }
        );
        assert!(h.ledger.entries_for_order(&order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn amount_override_is_what_the_ledger_records() {
        let h = harness(Verification::Verified { block_number: None }).await;
        let order = create_order(&h, "k1", "2000000000000000000").await;

        let override_amount = Amount::from_decimal(ONE_TOKEN).unwrap();
        h.engine
            .process_payment(&order.id, "0xTX1", Some(override_amount))
            .await
            .unwrap();

        let entries = h.ledger.entries_for_order(&order.id).await.unwrap();
        assert!(entries.iter().all(|e| e.amount_minor == override_amount));
    }

    #[tokio::test]
    async fn refund_restores_balances_and_is_terminal() {
        let h = harness(Verification::Verified { block_number: None }).await;
        let order = create_order(&h, "k1", ONE_TOKEN).await;
        h.engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();

        let outcome = h.engine.refund(&order.id, "r1", None, None).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Refunded);
        assert!(!outcome.replayed);

        assert_eq!(
            h.ledger
                .balance(&h.merchant_id, "USDT", Bucket::Merchant)
                .await
                .unwrap(),
            "0"
        );
        assert_eq!(
            h.ledger
                .balance(&h.merchant_id, "USDT", Bucket::Clearing)
                .await
                .unwrap(),
            "0"
        );
        assert_eq!(h.counters.refunds_processed(), 1);

        // Replay with the same key is a no-op returning the prior outcome.
        let replay = h.engine.refund(&order.id, "r1", None, None).await.unwrap();
        assert_eq!(replay.status, OrderStatus::Refunded);
        assert!(replay.replayed);
        assert_eq!(h.counters.refunds_processed(), 1);
        assert_eq!(h.ledger.entries_for_order(&order.id).await.unwrap().len(), 4);

        // A PaymentDetected replay against the refunded order is inert.
        let after = h
            .engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        assert_eq!(
            after,
            PaymentOutcome::AlreadyProcessed {
                status: OrderStatus::Refunded
            }
        );
    }

    #[tokio::test]
    async fn partial_refund_debits_only_the_requested_amount() {
        let h = harness(Verification::Verified { block_number: None }).await;
        let order = create_order(&h, "k1", "2000000000000000000").await;
        h.engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();

        let half = Amount::from_decimal(ONE_TOKEN).unwrap();
        h.engine
            .refund(&order.id, "r1", Some(half), Some("0xRTX"))
            .await
            .unwrap();

        assert_eq!(
            h.ledger
                .balance(&h.merchant_id, "USDT", Bucket::Merchant)
                .await
                .unwrap(),
            ONE_TOKEN
        );
    }

    #[tokio::test]
    async fn refund_guards() {
        let h = harness(Verification::Verified { block_number: None }).await;

        // Not paid yet.
        let order = create_order(&h, "k1", ONE_TOKEN).await;
        let err = h.engine.refund(&order.id, "r1", None, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::OrderNotPaid(_)));

        // Refund larger than the order.
        h.engine
            .process_payment(&order.id, "0xTX1", None)
            .await
            .unwrap();
        let too_much = Amount::from_decimal("2000000000000000000").unwrap();
        let err = h
            .engine
            .refund(&order.id, "r1", Some(too_much), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::RefundExceedsOrder));

        // Settled orders cannot be refunded.
        h.orders.mark_settled(&order.id).await.unwrap();
        let err = h.engine.refund(&order.id, "r1", None, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::CannotRefundSettled(_)));

        // Unknown order.
        let err = h.engine.refund("missing", "r1", None, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::OrderNotFound(_)));
    }
}
