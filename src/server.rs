//! HTTP server bootstrap.
//!
//! This module wires together:
//! - configuration
//! - the SQLite pool and migrations
//! - the verifier registry, engine, pipeline and sweepers
//! - the Axum router

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthState;
use crate::chain::{AutoApproveVerifier, BscUsdtVerifier, VerifierRegistry};
use crate::infra::sqlite::{SqliteLedgerStore, SqliteMerchantStore, SqliteOrderStore};
use crate::infra::{
    spawn_sweepers, PaymentEngine, PipelineConfig, RecentTxCache, SweeperConfig,
    VerificationPipeline,
};
use crate::metrics::Counters;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Reference-chain RPC endpoint.
    pub bsc_rpc_url: String,
    /// Cap on concurrent RPC verifications.
    pub verify_concurrency: usize,
    /// How long a processed tx hash suppresses duplicates.
    pub dedupe_ttl: Duration,
    /// Auto-approve transfers on unsupported (asset, chain) pairs.
    /// Development only.
    pub dev_auto_approve: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:paygate.db".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .expect("Invalid listen address");

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let bsc_rpc_url = std::env::var("BSC_RPC_URL")
            .unwrap_or_else(|_| "https://bsc-dataseed.binance.org/".to_string());

        let verify_concurrency = std::env::var("VERIFY_CONCURRENCY")
            .ok()
            .and_then(|p| p.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(20);

        let dedupe_ttl = std::env::var("DEDUPE_TTL_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let dev_auto_approve = std::env::var("DEV_AUTO_APPROVE")
            .map(|v| matches!(v.trim(), "1" | "true" | "on"))
            .unwrap_or(false);

        Self {
            database_url,
            listen_addr,
            max_connections,
            bsc_rpc_url,
            verify_concurrency,
            dedupe_ttl,
            dev_auto_approve,
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub merchants: SqliteMerchantStore,
    pub orders: SqliteOrderStore,
    pub ledger: SqliteLedgerStore,
    pub engine: Arc<PaymentEngine>,
    pub pipeline: Arc<VerificationPipeline>,
    pub counters: Arc<Counters>,
}

impl AppState {
    /// Build the full service graph over an open pool.
    pub fn build(pool: SqlitePool, registry: VerifierRegistry, dedupe_ttl: Duration) -> Self {
        let dedupe = Arc::new(RecentTxCache::new(dedupe_ttl));
        let counters = Arc::new(Counters::new());

        let engine = Arc::new(PaymentEngine::new(
            pool.clone(),
            Arc::new(registry),
            dedupe.clone(),
            counters.clone(),
        ));

        let (pipeline, _workers) = VerificationPipeline::spawn(
            PipelineConfig::from_env(),
            engine.clone(),
            SqliteOrderStore::new(pool.clone()),
            dedupe,
        );

        Self {
            merchants: SqliteMerchantStore::new(pool.clone()),
            orders: SqliteOrderStore::new(pool.clone()),
            ledger: SqliteLedgerStore::new(pool.clone()),
            engine,
            pipeline: Arc::new(pipeline),
            counters,
            pool,
        }
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting paygate v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Database: {}", config.database_url);
    info!("  BSC RPC: {}", config.bsc_rpc_url);

    // Open and harden SQLite: WAL plus a busy timeout keep the single
    // writer usable under concurrent handlers.
    let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(connect_options)
        .await?;

    // Fail fast: a dead database at startup is fatal, nothing at runtime is.
    tokio::time::timeout(
        Duration::from_secs(3),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    .map_err(|_| anyhow::anyhow!("database ping timed out"))??;

    info!("Running database migrations...");
    crate::migrations::run_sqlite(&pool).await?;
    info!("Database migrations applied");

    let mut registry = VerifierRegistry::new();
    registry.register(
        "USDT",
        "BSC",
        Arc::new(BscUsdtVerifier::new(
            &config.bsc_rpc_url,
            config.verify_concurrency,
        )),
    );
    if config.dev_auto_approve {
        warn!("DEV_AUTO_APPROVE is set: unsupported asset/chain pairs will be approved unverified");
        registry.set_fallback(Arc::new(AutoApproveVerifier));
    }

    let state = AppState::build(pool.clone(), registry, config.dedupe_ttl);

    let (_sweeper_handles, _sweeper_control) =
        spawn_sweepers(SweeperConfig::from_env(), SqliteOrderStore::new(pool));

    let app = build_router(state)?;

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("paygate is ready to accept connections");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

/// Assemble the router: authenticated merchant routes plus open routes,
/// with tracing and env-driven CORS.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let auth_state = AuthState {
        merchants: state.merchants.clone(),
    };

    let authed = crate::api::authed_router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        crate::auth::api_key_auth,
    ));

    let mut router = Router::new()
        .merge(crate::api::public_router())
        .merge(authed)
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router.with_state(state))
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                HeaderName::from_static("x-api-key"),
            ]),
    ))
}
