//! Background sweepers.
//!
//! Two periodic tasks on independent intervals:
//!
//! - settlement: PAID orders whose settlement delay elapsed become SETTLED
//! - timeout: PENDING orders older than the order TTL become FAILED
//!
//! Sweeps are idempotent by construction. Every transition is guarded, so
//! a late or doubled run only produces no-ops, and per-order failures are
//! logged without aborting the rest of the sweep.
//!
//! # Configuration
//!
//! - `SETTLEMENT_DELAY_SECS` - PAID -> SETTLED delay (default: 300)
//! - `SETTLEMENT_INTERVAL_SECS` - settlement sweep period (default: 600)
//! - `ORDER_TTL_SECS` - PENDING -> FAILED timeout (default: 1800)
//! - `TIMEOUT_INTERVAL_SECS` - timeout sweep period (default: 300)

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::infra::sqlite::SqliteOrderStore;
use crate::infra::Result;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How long a PAID order rests before settlement.
    pub settlement_delay: Duration,
    pub settlement_interval: Duration,
    /// How long a PENDING order may wait for a payment.
    pub order_ttl: Duration,
    pub timeout_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            settlement_delay: Duration::from_secs(300),
            settlement_interval: Duration::from_secs(600),
            order_ttl: Duration::from_secs(1800),
            timeout_interval: Duration::from_secs(300),
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Self {
        let secs = |var: &str, default: u64| {
            std::env::var(var)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        Self {
            settlement_delay: secs("SETTLEMENT_DELAY_SECS", 300),
            settlement_interval: secs("SETTLEMENT_INTERVAL_SECS", 600),
            order_ttl: secs("ORDER_TTL_SECS", 1800),
            timeout_interval: secs("TIMEOUT_INTERVAL_SECS", 300),
        }
    }
}

/// Control messages for a running sweeper task.
#[derive(Debug)]
pub enum SweeperMessage {
    Shutdown,
}

pub struct Sweeper {
    config: SweeperConfig,
    orders: SqliteOrderStore,
}

impl Sweeper {
    pub fn new(config: SweeperConfig, orders: SqliteOrderStore) -> Self {
        Self { config, orders }
    }

    /// One settlement pass. Returns how many orders were settled.
    pub async fn run_settlement_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.settlement_delay)
                .unwrap_or(chrono::Duration::zero());
        let candidates = self.orders.find_for_settlement(cutoff).await?;

        let mut settled = 0;
        for order_id in candidates {
            match self.orders.mark_settled(&order_id).await {
                Ok(transition) if transition.was_applied() => {
                    settled += 1;
                    info!(order_id = %order_id, "order settled");
                }
                Ok(_) => {
                    debug!(order_id = %order_id, "settlement lost the guard, skipping");
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "failed to settle order");
                }
            }
        }
        Ok(settled)
    }

    /// One timeout pass. Returns how many orders were failed.
    pub async fn run_timeout_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.order_ttl)
                .unwrap_or(chrono::Duration::zero());
        let candidates = self.orders.find_for_timeout(cutoff).await?;

        let mut failed = 0;
        for order_id in candidates {
            match self.orders.mark_failed(&order_id).await {
                Ok(transition) if transition.was_applied() => {
                    failed += 1;
                    info!(order_id = %order_id, "order failed by timeout");
                }
                Ok(_) => {
                    debug!(order_id = %order_id, "timeout lost the guard, skipping");
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "failed to time out order");
                }
            }
        }
        Ok(failed)
    }
}

/// Spawn the settlement and timeout sweepers as background tasks.
///
/// Each task runs until it receives [`SweeperMessage::Shutdown`] (or the
/// process exits). Sweep errors are logged, never fatal.
pub fn spawn_sweepers(
    config: SweeperConfig,
    orders: SqliteOrderStore,
) -> (Vec<JoinHandle<()>>, mpsc::Sender<SweeperMessage>) {
    let (control_tx, mut control_rx) = mpsc::channel::<SweeperMessage>(4);
    let (settle_shutdown_tx, settle_shutdown_rx) = mpsc::channel::<()>(1);
    let (timeout_shutdown_tx, timeout_shutdown_rx) = mpsc::channel::<()>(1);

    // Fan the single control channel out to both loops.
    let fanout = tokio::spawn(async move {
        if control_rx.recv().await.is_some() {
            let _ = settle_shutdown_tx.send(()).await;
            let _ = timeout_shutdown_tx.send(()).await;
        }
    });

    let settlement_sweeper = Sweeper::new(config.clone(), orders.clone());
    let settlement_period = config.settlement_interval;
    let settlement = tokio::spawn(run_settlement_loop(
        settlement_sweeper,
        settlement_period,
        settle_shutdown_rx,
    ));

    let timeout_period = config.timeout_interval;
    let timeout_sweeper = Sweeper::new(config, orders);
    let timeout_task = tokio::spawn(run_timeout_loop(
        timeout_sweeper,
        timeout_period,
        timeout_shutdown_rx,
    ));

    (vec![fanout, settlement, timeout_task], control_tx)
}

async fn run_settlement_loop(
    sweeper: Sweeper,
    period: Duration,
    mut shutdown: mpsc::Receiver<()>,
) {
    info!(period_secs = period.as_secs(), "starting settlement sweeper");
    let mut ticker = interval(period);
    // The first tick fires immediately; skip it so a fresh process does not
    // sweep before anything can be due.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweeper.run_settlement_once().await {
                    warn!(error = %e, "settlement sweep failed");
                }
            }
            _ = shutdown.recv() => {
                info!("settlement sweeper shutting down");
                return;
            }
        }
    }
}

async fn run_timeout_loop(sweeper: Sweeper, period: Duration, mut shutdown: mpsc::Receiver<()>) {
    info!(period_secs = period.as_secs(), "starting timeout sweeper");
    let mut ticker = interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweeper.run_timeout_once().await {
                    warn!(error = %e, "timeout sweep failed");
                }
            }
            _ = shutdown.recv() => {
                info!("timeout sweeper shutting down");
                return;
            }
        }
    }
}
