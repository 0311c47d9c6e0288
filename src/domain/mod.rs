//! Core domain types for the payment service.
//!
//! - [`Amount`] - minor-unit token amounts (big-integer, decimal strings at rest)
//! - [`Order`] / [`OrderStatus`] - payment orders and their lifecycle
//! - [`Merchant`] - merchant accounts
//! - [`LedgerEntry`] and friends - double-entry postings

mod amount;
mod ledger;
mod merchant;
mod order;

pub use amount::{signed_balance, Amount, AmountParseError};
pub use ledger::{Bucket, Direction, LedgerEntry, LedgerEvent};
pub use merchant::Merchant;
pub use order::{NewOrder, Order, OrderStatus};
