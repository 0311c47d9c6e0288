//! Infrastructure layer for the payment service.
//!
//! Contains:
//! - SQLite stores (orders, merchants, ledger)
//! - the state-transition engine (atomic status + ledger updates)
//! - the verification pipeline (bounded queue + worker pool)
//! - background sweepers (settlement, timeout)
//! - the recent-tx dedupe cache

mod dedupe;
mod engine;
mod error;
mod pipeline;
pub mod sqlite;
mod sweeper;

pub use dedupe::{DedupeStats, RecentTxCache};
pub use engine::{PaymentEngine, PaymentOutcome, RefundOutcome};
pub use error::{is_unique_violation, PaymentError, Result};
pub use pipeline::{PipelineConfig, SubmitOutcome, VerificationPipeline, VerifyJob};
pub use sweeper::{spawn_sweepers, Sweeper, SweeperConfig, SweeperMessage};
