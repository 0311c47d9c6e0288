//! Asynchronous verification pipeline.
//!
//! A bounded queue of verification jobs drained by a small worker pool.
//! Submission never blocks: if the queue has room the caller gets an
//! Accepted response and a worker verifies later; if the queue is full the
//! verification runs inline on the caller's deadline instead of being
//! dropped. That fallback trades submitter latency for liveness under
//! saturation.
//!
//! # Configuration
//!
//! - `VERIFY_WORKERS` - worker count (default: 4)
//! - `VERIFY_QUEUE_CAPACITY` - queue bound (default: 1000)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::domain::{Amount, OrderStatus};
use crate::infra::engine::PaymentEngine;
use crate::infra::sqlite::SqliteOrderStore;
use crate::infra::{PaymentError, RecentTxCache, Result};

/// One unit of verification work.
#[derive(Debug, Clone)]
pub struct VerifyJob {
    pub order_id: String,
    pub tx_hash: String,
    pub merchant_id: String,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let workers = std::env::var("VERIFY_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(4);

        let queue_capacity = std::env::var("VERIFY_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1000);

        Self {
            workers,
            queue_capacity,
        }
    }
}

/// What the submitter is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Job enqueued; verification happens asynchronously.
    Enqueued,
    /// This tx hash was processed moments ago; nothing to do.
    RecentDuplicate,
    /// The queue was full and the verification ran inline to completion.
    Completed { status: OrderStatus },
}

/// Bounded single-producer/multi-consumer verification pipeline.
pub struct VerificationPipeline {
    jobs: mpsc::Sender<VerifyJob>,
    engine: Arc<PaymentEngine>,
    orders: SqliteOrderStore,
    dedupe: Arc<RecentTxCache>,
}

impl VerificationPipeline {
    /// Build the pipeline and spawn its workers.
    pub fn spawn(
        config: PipelineConfig,
        engine: Arc<PaymentEngine>,
        orders: SqliteOrderStore,
        dedupe: Arc<RecentTxCache>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (jobs_tx, jobs_rx) = mpsc::channel::<VerifyJob>(config.queue_capacity);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "starting verification workers"
        );

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let rx = jobs_rx.clone();
            let engine = engine.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, rx, engine)));
        }

        (
            Self {
                jobs: jobs_tx,
                engine,
                orders,
                dedupe,
            },
            handles,
        )
    }

    /// Submit a detected payment for verification.
    ///
    /// Order not found is the only error the caller sees from the enqueue
    /// path; verification errors surface only when the inline fallback
    /// runs.
    pub async fn submit(
        &self,
        order_id: &str,
        tx_hash: &str,
        amount_override: Option<Amount>,
    ) -> Result<SubmitOutcome> {
        // The job carries the merchant so workers skip one lookup; this
        // also rejects unknown orders before anything is queued.
        let order = timeout(Duration::from_secs(3), self.orders.get(order_id))
            .await
            .map_err(|_| PaymentError::Timeout("order lookup"))??
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))?;

        if self.dedupe.seen_recently(tx_hash).await {
            debug!(order_id = %order_id, tx_hash = %tx_hash, "recent duplicate tx hash");
            return Ok(SubmitOutcome::RecentDuplicate);
        }

        // Overridden amounts take the inline path: the queue carries only
        // the (order, tx) identity and workers verify the stored amount.
        if amount_override.is_none() {
            let job = VerifyJob {
                order_id: order_id.to_string(),
                tx_hash: tx_hash.to_string(),
                merchant_id: order.merchant_id.clone(),
            };
            match self.jobs.try_send(job) {
                Ok(()) => return Ok(SubmitOutcome::Enqueued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(order_id = %order_id, "verification queue full, verifying inline");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(order_id = %order_id, "verification queue closed, verifying inline");
                }
            }
        }

        let outcome = self
            .engine
            .process_payment(order_id, tx_hash, amount_override)
            .await?;
        Ok(SubmitOutcome::Completed {
            status: outcome.status(),
        })
    }

    /// Close the queue. Workers drain what is already enqueued and exit.
    pub fn shutdown(self) {
        drop(self.jobs);
    }
}

async fn worker_loop(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<VerifyJob>>>,
    engine: Arc<PaymentEngine>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            info!(worker_id, "verification queue closed, worker exiting");
            return;
        };

        debug!(
            worker_id,
            order_id = %job.order_id,
            tx_hash = %job.tx_hash,
            merchant_id = %job.merchant_id,
            "processing verification job"
        );

        // Workers run on their own deadline: the submitter already got its
        // Accepted response and may be long gone.
        match engine.process_payment(&job.order_id, &job.tx_hash, None).await {
            Ok(outcome) => {
                debug!(
                    worker_id,
                    order_id = %job.order_id,
                    status = %outcome.status(),
                    "verification job finished"
                );
            }
            Err(err @ (PaymentError::Rpc(_) | PaymentError::Timeout(_))) => {
                // Transient: drop the job. The client resubmits, and the
                // dedupe cache plus DB uniqueness make that safe.
                warn!(
                    worker_id,
                    order_id = %job.order_id,
                    tx_hash = %job.tx_hash,
                    error = %err,
                    "transient failure, dropping job"
                );
            }
            Err(err) => {
                error!(
                    worker_id,
                    order_id = %job.order_id,
                    tx_hash = %job.tx_hash,
                    error = %err,
                    "verification job failed"
                );
            }
        }
    }
}
