//! API-key authentication backed by the merchants table.
//!
//! Clients present their key in the `X-API-Key` header; the middleware
//! resolves it against `merchants.api_key` and injects the authenticated
//! merchant id as a request extension.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use rand::Rng;
use tokio::time::timeout;
use tracing::warn;

use crate::infra::sqlite::SqliteMerchantStore;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Prefix on generated merchant API keys.
pub const API_KEY_PREFIX: &str = "pg_";

/// Generate a fresh merchant API key: prefix + 24 random bytes, URL-safe
/// base64.
pub fn generate_api_key() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 24] = rng.gen();
    let random_part =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    format!("{API_KEY_PREFIX}{random_part}")
}

/// Identity of the merchant whose key authenticated the request.
#[derive(Debug, Clone)]
pub struct MerchantAuth {
    pub merchant_id: String,
}

/// Middleware state.
#[derive(Clone)]
pub struct AuthState {
    pub merchants: SqliteMerchantStore,
}

/// Authentication middleware for merchant-scoped endpoints.
pub async fn api_key_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return auth_error(StatusCode::UNAUTHORIZED, "missing X-API-Key header");
    };

    let lookup = timeout(Duration::from_secs(2), state.merchants.find_by_api_key(key)).await;
    match lookup {
        Ok(Ok(Some(merchant))) => {
            request.extensions_mut().insert(MerchantAuth {
                merchant_id: merchant.id,
            });
            next.run(request).await
        }
        Ok(Ok(None)) => auth_error(StatusCode::UNAUTHORIZED, "invalid API key"),
        Ok(Err(e)) => {
            warn!(error = %e, "api key lookup failed");
            auth_error(StatusCode::INTERNAL_SERVER_ERROR, "authentication unavailable")
        }
        Err(_) => {
            warn!("api key lookup timed out");
            auth_error(StatusCode::INTERNAL_SERVER_ERROR, "authentication unavailable")
        }
    }
}

fn auth_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({
            "error": "unauthorized",
            "message": message,
        })),
    )
        .into_response()
}
