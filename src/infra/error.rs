//! Error types for the payment infrastructure.

use thiserror::Error;

/// Errors that can occur in the payment core.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Order not found
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Merchant not found
    #[error("merchant not found: {0}")]
    MerchantNotFound(String),

    /// Merchant has no receiving wallet configured
    #[error("merchant wallet address not set for merchant {0}")]
    MissingWalletAddress(String),

    /// Malformed amount string
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The on-chain transfer could not be verified (absent or mismatched)
    #[error("on-chain verification failed for tx {tx_hash}: {reason}")]
    VerificationFailed { tx_hash: String, reason: String },

    /// No verifier registered for this (asset, chain) pair
    #[error("unsupported asset/chain pair: {asset}/{chain}")]
    UnsupportedChain { asset: String, chain: String },

    /// Transient RPC-layer failure; the client is expected to resubmit
    #[error("chain rpc error: {0}")]
    Rpc(String),

    /// Refund refused: the order has not reached PAID
    #[error("order {0} is not paid; cannot refund")]
    OrderNotPaid(String),

    /// Refund refused: the order is already settled
    #[error("cannot refund settled order {0}")]
    CannotRefundSettled(String),

    /// Refund amount exceeds the order amount
    #[error("refund amount exceeds order amount")]
    RefundExceedsOrder,

    /// Refund amount missing or not a positive decimal
    #[error("invalid refund amount")]
    InvalidRefundAmount,

    /// A deadline fired before the operation finished
    #[error("deadline exceeded during {0}")]
    Timeout(&'static str),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Whether a sqlx error is a unique-constraint violation. The stores use
/// this to turn idempotent retries into their first outcome instead of an
/// error.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_identifiers() {
        let err = PaymentError::OrderNotFound("ord-123".to_string());
        assert!(err.to_string().contains("ord-123"));

        let err = PaymentError::VerificationFailed {
            tx_hash: "0xabc".to_string(),
            reason: "amount mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0xabc"));
        assert!(msg.contains("amount mismatch"));

        let err = PaymentError::UnsupportedChain {
            asset: "USDT".to_string(),
            chain: "TRON".to_string(),
        };
        assert!(err.to_string().contains("USDT/TRON"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PaymentError>();
    }
}
