//! paygate - crypto payment acceptance service.
//!
//! Merchants create payment orders denominated in an on-chain token;
//! customers pay the merchant's deposit address; the service verifies the
//! transfer against a chain RPC, records it in a double-entry ledger, and
//! settles or times orders out in the background.
//!
//! ## Modules
//!
//! - [`domain`] - core types (orders, merchants, ledger entries, amounts)
//! - [`infra`] - SQLite stores, the state-transition engine, the
//!   verification pipeline, sweepers and the dedupe cache
//! - [`chain`] - on-chain transfer verification (BSC-USD reference)
//! - [`auth`] - API-key authentication
//! - [`api`] - REST endpoints
//! - [`metrics`] - service counters

pub mod api;
pub mod auth;
pub mod chain;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod server;

// Re-export commonly used types
pub use domain::{Amount, Bucket, Direction, LedgerEntry, LedgerEvent, Merchant, Order, OrderStatus};

pub use infra::{
    PaymentEngine, PaymentError, PaymentOutcome, RecentTxCache, Result, SubmitOutcome,
    VerificationPipeline,
};
