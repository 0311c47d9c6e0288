//! Structured API error responses.
//!
//! Every failure response is `{"error": <kind>, "message": <text>}` with a
//! stable machine-readable kind that clients can branch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::infra::PaymentError;

/// Error kinds surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidJson,
    MissingFields,
    MissingIdempotencyKey,
    MerchantNotFound,
    OrderNotFound,
    MissingWalletAddress,
    InvalidAmount,
    OnchainVerificationFailed,
    OrderNotPaid,
    CannotRefundSettled,
    RefundExceedsOrder,
    InvalidRefundAmount,
    DbError,
}

impl ErrorKind {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidJson
            | ErrorKind::MissingFields
            | ErrorKind::MissingIdempotencyKey
            | ErrorKind::MerchantNotFound
            | ErrorKind::MissingWalletAddress
            | ErrorKind::InvalidAmount
            | ErrorKind::OnchainVerificationFailed
            | ErrorKind::RefundExceedsOrder
            | ErrorKind::InvalidRefundAmount => StatusCode::BAD_REQUEST,

            ErrorKind::OrderNotFound => StatusCode::NOT_FOUND,

            ErrorKind::OrderNotPaid | ErrorKind::CannotRefundSettled => StatusCode::CONFLICT,

            ErrorKind::DbError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An API error response body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(rename = "error")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Database(e) => {
                ApiError::new(ErrorKind::DbError, format!("database error: {e}"))
            }
            PaymentError::OrderNotFound(_) => {
                ApiError::new(ErrorKind::OrderNotFound, "order not found")
            }
            PaymentError::MerchantNotFound(_) => {
                ApiError::new(ErrorKind::MerchantNotFound, "merchant not found")
            }
            PaymentError::MissingWalletAddress(_) => ApiError::new(
                ErrorKind::MissingWalletAddress,
                "merchant wallet address not set",
            ),
            PaymentError::InvalidAmount(msg) => ApiError::new(ErrorKind::InvalidAmount, msg),
            PaymentError::VerificationFailed { reason, .. } => ApiError::new(
                ErrorKind::OnchainVerificationFailed,
                format!("transfer not verified: {reason}"),
            ),
            PaymentError::UnsupportedChain { asset, chain } => ApiError::new(
                ErrorKind::OnchainVerificationFailed,
                format!("no verifier for {asset} on {chain}"),
            ),
            PaymentError::Rpc(msg) => ApiError::new(
                ErrorKind::OnchainVerificationFailed,
                format!("chain rpc unavailable, retry later: {msg}"),
            ),
            PaymentError::OrderNotPaid(_) => ApiError::new(
                ErrorKind::OrderNotPaid,
                "order not paid yet; cannot refund",
            ),
            PaymentError::CannotRefundSettled(_) => ApiError::new(
                ErrorKind::CannotRefundSettled,
                "cannot refund a SETTLED order",
            ),
            PaymentError::RefundExceedsOrder => ApiError::new(
                ErrorKind::RefundExceedsOrder,
                "refund amount cannot exceed order amount",
            ),
            PaymentError::InvalidRefundAmount => ApiError::new(
                ErrorKind::InvalidRefundAmount,
                "refund amount must be a positive decimal",
            ),
            PaymentError::Timeout(op) => {
                ApiError::new(ErrorKind::DbError, format!("deadline exceeded during {op}"))
            }
            PaymentError::Internal(msg) => ApiError::new(ErrorKind::DbError, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ErrorKind::InvalidJson.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::OrderNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::OrderNotPaid.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::CannotRefundSettled.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorKind::DbError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_shape_is_error_and_message() {
        let err = ApiError::new(ErrorKind::OrderNotFound, "order not found");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "order_not_found");
        assert_eq!(json["message"], "order not found");
    }

    #[test]
    fn payment_errors_translate() {
        let err: ApiError = PaymentError::OrderNotFound("o1".to_string()).into();
        assert_eq!(err.kind, ErrorKind::OrderNotFound);

        let err: ApiError = PaymentError::VerificationFailed {
            tx_hash: "0x1".to_string(),
            reason: "no matching transfer".to_string(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::OnchainVerificationFailed);

        let err: ApiError = PaymentError::CannotRefundSettled("o1".to_string()).into();
        assert_eq!(err.kind, ErrorKind::CannotRefundSettled);

        let err: ApiError = PaymentError::Internal("boom".to_string()).into();
        assert_eq!(err.kind, ErrorKind::DbError);
    }
}
