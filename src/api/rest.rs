//! REST endpoints.
//!
//! Merchant-scoped routes (orders, refunds, payment events) sit behind the
//! API-key middleware; merchant onboarding, reconciliation, metrics and
//! health checks are open.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::info;

use crate::api::error::{ApiError, ErrorKind};
use crate::auth::generate_api_key;
use crate::domain::{Amount, Bucket, NewOrder, Order, OrderStatus};
use crate::infra::SubmitOutcome;
use crate::server::AppState;

/// Routes that require a merchant API key.
pub fn authed_router() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/get", get(get_order))
        .route("/orders/refund", post(refund_order))
        .route("/events/payment-detected", post(payment_detected))
}

/// Open routes.
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/merchants", post(create_merchant))
        .route("/reconciliation", get(reconciliation))
        .route("/debug/metrics", get(debug_metrics))
        .route("/health", get(health))
        .route("/dbhealth", get(dbhealth))
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(_) => Err(ApiError::new(ErrorKind::InvalidJson, "invalid JSON body")),
    }
}

// ============================================================================
// Merchants
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateMerchantRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    merchant_wallet_address: String,
}

#[derive(Debug, Serialize)]
struct CreateMerchantResponse {
    id: String,
    api_key: String,
    merchant_wallet_address: String,
}

async fn create_merchant(
    State(state): State<AppState>,
    payload: Result<Json<CreateMerchantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateMerchantResponse>), ApiError> {
    let req = parse_body(payload)?;
    if req.name.is_empty() || req.merchant_wallet_address.is_empty() {
        return Err(ApiError::new(
            ErrorKind::MissingFields,
            "name and merchant_wallet_address are required",
        ));
    }

    let api_key = generate_api_key();
    let merchant = state
        .merchants
        .create(&req.name, &req.merchant_wallet_address, &api_key)
        .await?;

    info!(merchant_id = %merchant.id, name = %merchant.name, "merchant created");
    Ok((
        StatusCode::CREATED,
        Json(CreateMerchantResponse {
            id: merchant.id,
            api_key,
            merchant_wallet_address: merchant.merchant_wallet_address,
        }),
    ))
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateOrderRequest {
    #[serde(default)]
    merchant_id: String,
    #[serde(default)]
    amount_minor: String,
    #[serde(default)]
    asset: String,
    #[serde(default)]
    chain: String,
    #[serde(default)]
    idempotency_key: String,
}

#[derive(Debug, Serialize)]
struct CreateOrderResponse {
    order_id: String,
    deposit_address: String,
    status: OrderStatus,
}

async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    let req = parse_body(payload)?;

    if req.merchant_id.is_empty() || req.asset.is_empty() || req.chain.is_empty() {
        return Err(ApiError::new(
            ErrorKind::MissingFields,
            "merchant_id, amount_minor (>0), asset and chain are required",
        ));
    }
    let amount = Amount::from_decimal(&req.amount_minor).map_err(|_| {
        ApiError::new(
            ErrorKind::MissingFields,
            "merchant_id, amount_minor (>0), asset and chain are required",
        )
    })?;
    if req.idempotency_key.is_empty() {
        return Err(ApiError::new(
            ErrorKind::MissingIdempotencyKey,
            "idempotency_key is required",
        ));
    }

    let merchant = state
        .merchants
        .get(&req.merchant_id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::MerchantNotFound, "merchant not found"))?;

    let (order, inserted) = state
        .orders
        .create(NewOrder {
            merchant_id: merchant.id,
            amount_minor: amount,
            asset: req.asset,
            chain: req.chain,
            // Customers pay straight into the merchant's receiving wallet.
            deposit_address: merchant.merchant_wallet_address,
            idempotency_key: req.idempotency_key,
        })
        .await?;

    if inserted {
        state.counters.inc_orders_created();
        info!(
            order_id = %order.id,
            merchant_id = %order.merchant_id,
            asset = %order.asset,
            amount_minor = %order.amount_minor,
            "order created"
        );
    }

    Ok(Json(CreateOrderResponse {
        order_id: order.id,
        deposit_address: order.deposit_address,
        status: order.status,
    }))
}

#[derive(Debug, Deserialize)]
struct OrderIdQuery {
    id: Option<String>,
}

async fn get_order(
    State(state): State<AppState>,
    Query(query): Query<OrderIdQuery>,
) -> Result<Json<Order>, ApiError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::new(ErrorKind::MissingFields, "missing query param: id"))?;

    let order = state
        .orders
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::OrderNotFound, "order not found"))?;

    Ok(Json(order))
}

// ============================================================================
// Refunds
// ============================================================================

#[derive(Debug, Deserialize)]
struct RefundRequest {
    #[serde(default)]
    amount_minor: Option<String>,
    #[serde(default)]
    refundtxhash: Option<String>,
    #[serde(default)]
    refund_idempotency_key: String,
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    order_id: String,
    status: OrderStatus,
    message: String,
}

async fn refund_order(
    State(state): State<AppState>,
    Query(query): Query<OrderIdQuery>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> Result<Json<RefundResponse>, ApiError> {
    let order_id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::new(ErrorKind::MissingFields, "missing query param: id"))?;
    let req = parse_body(payload)?;

    if req.refund_idempotency_key.is_empty() {
        return Err(ApiError::new(
            ErrorKind::MissingIdempotencyKey,
            "refund_idempotency_key is required",
        ));
    }

    let amount = match req.amount_minor.as_deref() {
        None => None,
        Some(s) => Some(Amount::from_decimal(s).map_err(|_| {
            ApiError::new(
                ErrorKind::InvalidRefundAmount,
                "refund amount must be a positive decimal",
            )
        })?),
    };

    let outcome = state
        .engine
        .refund(
            &order_id,
            &req.refund_idempotency_key,
            amount,
            req.refundtxhash.as_deref(),
        )
        .await?;

    let message = if outcome.replayed {
        "no-op (already refunded)"
    } else {
        "refund recorded"
    };
    Ok(Json(RefundResponse {
        order_id,
        status: outcome.status,
        message: message.to_string(),
    }))
}

// ============================================================================
// Payment events
// ============================================================================

#[derive(Debug, Deserialize)]
struct PaymentDetectedRequest {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    tx_hash: String,
    #[serde(default)]
    amount_minor: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentDetectedResponse {
    order_id: String,
    status: OrderStatus,
    message: String,
}

async fn payment_detected(
    State(state): State<AppState>,
    payload: Result<Json<PaymentDetectedRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentDetectedResponse>), ApiError> {
    let req = parse_body(payload)?;
    if req.order_id.is_empty() || req.tx_hash.is_empty() {
        return Err(ApiError::new(
            ErrorKind::MissingFields,
            "order_id and tx_hash are required",
        ));
    }

    let amount_override = match req.amount_minor.as_deref() {
        None => None,
        Some(s) => Some(Amount::from_decimal(s).map_err(|_| {
            ApiError::new(ErrorKind::InvalidAmount, "invalid amount_minor format")
        })?),
    };

    let outcome = state
        .pipeline
        .submit(&req.order_id, &req.tx_hash, amount_override)
        .await?;

    let (code, status, message) = match outcome {
        SubmitOutcome::Enqueued => (
            StatusCode::ACCEPTED,
            OrderStatus::Pending,
            "verification enqueued",
        ),
        SubmitOutcome::RecentDuplicate => (
            StatusCode::OK,
            OrderStatus::Paid,
            "recent duplicate tx hash",
        ),
        SubmitOutcome::Completed { status } => (StatusCode::OK, status, "payment processed"),
    };

    Ok((
        code,
        Json(PaymentDetectedResponse {
            order_id: req.order_id,
            status,
            message: message.to_string(),
        }),
    ))
}

// ============================================================================
// Reconciliation / metrics / health
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReconciliationQuery {
    merchant_id: Option<String>,
    asset: Option<String>,
}

async fn reconciliation(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (Some(merchant_id), Some(asset)) = (
        query.merchant_id.filter(|s| !s.is_empty()),
        query.asset.filter(|s| !s.is_empty()),
    ) else {
        return Err(ApiError::new(
            ErrorKind::MissingFields,
            "merchant_id and asset are required",
        ));
    };

    let result = timeout(Duration::from_secs(2), async {
        let merchant_balance = state
            .ledger
            .balance(&merchant_id, &asset, Bucket::Merchant)
            .await?;
        let clearing_balance = state
            .ledger
            .balance(&merchant_id, &asset, Bucket::Clearing)
            .await?;
        let unsettled = state
            .orders
            .count_unsettled_paid(&merchant_id, &asset)
            .await?;
        Ok::<_, crate::infra::PaymentError>((merchant_balance, clearing_balance, unsettled))
    })
    .await
    .map_err(|_| ApiError::new(ErrorKind::DbError, "reconciliation deadline exceeded"))?;

    let (merchant_balance, clearing_balance, unsettled) = result?;
    Ok(Json(serde_json::json!({
        "merchant_id": merchant_id,
        "asset": asset,
        "merchant_balance_minor": merchant_balance,
        "clearing_balance_minor": clearing_balance,
        "unsettled_paid_count": unsettled,
    })))
}

async fn debug_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.counters.snapshot())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn dbhealth(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let ping = timeout(
        Duration::from_secs(2),
        sqlx::query("SELECT 1").execute(&state.pool),
    )
    .await;

    match ping {
        Ok(Ok(_)) => Ok(Json(serde_json::json!({ "ok": true }))),
        _ => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false })),
        )),
    }
}
