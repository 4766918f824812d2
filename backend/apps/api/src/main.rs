//! API Server Entry Point
//!
//! Application entry point and server initialization.
//! Uses `anyhow` for startup errors, but application-level
//! errors should use `kernel::error::AppError`.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, http,
    http::{Method, header},
};
use mining::{
    ConfiguredAntiCheat, FlushFailurePolicy, MiningAppState, MiningConfig, MiningSessionManager,
    PgMiningRepository, ReconciliationLoader, mining_router,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Re-export unified error types for use in handlers
pub use kernel::error::{
    app_error::{AppError, AppResult},
    kind::ErrorKind,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api=info,mining=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Database connection
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set in environment")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("../../../database/migrations")
        .run(&pool)
        .await?;

    tracing::info!("Migrations completed");

    let mining_config = load_mining_config()?;
    tracing::info!(
        tick_ms = mining_config.tick_interval.as_millis() as u64,
        checkpoint_secs = mining_config.checkpoint_interval.as_secs(),
        referral_rate = %mining_config.referral_rate,
        flush_failure_policy = mining_config.flush_failure_policy.as_str(),
        "Mining configuration loaded"
    );

    let store = Arc::new(PgMiningRepository::new(pool.clone()));
    let classifier = Arc::new(ConfiguredAntiCheat::from_endpoint(
        env::var("ANTI_CHEAT_URL").ok(),
    ));
    let manager = Arc::new(MiningSessionManager::new(
        store.clone(),
        classifier,
        Arc::new(mining_config),
    ));

    // Startup reconciliation: resume sessions left open by the last process
    // Errors here should not prevent server startup
    let reconciler = ReconciliationLoader::new(store.clone(), manager.clone());
    if let Err(e) = reconciler.reconcile_all().await {
        tracing::warn!(
            error = %e,
            "Startup reconciliation failed, continuing anyway"
        );
    }

    let catalog = store.clone();
    let mining_state = MiningAppState::new(store, manager.clone(), catalog);

    // CORS configuration
    let frontend_origins = env::var("FRONTEND_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:40922,http://127.0.0.1:40922".to_string());

    let allowed_origins: Vec<http::HeaderValue> = frontend_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]))
        .allow_credentials(true);

    // Build router
    let app = Router::new()
        .nest("/api/mining", mining_router(mining_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr: SocketAddr = env::var("MINING_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:31113".to_string())
        .parse()
        .context("MINING_LISTEN_ADDR must be a socket address")?;
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Sessions stay open in the store and are resumed on the next start
    let flushed = manager.shutdown().await;
    tracing::info!(flushed, "Server stopped");

    Ok(())
}

/// Mining configuration from the environment, on top of the build profile's defaults
fn load_mining_config() -> anyhow::Result<MiningConfig> {
    let mut config = if cfg!(debug_assertions) {
        MiningConfig::development()
    } else {
        MiningConfig::default()
    };

    if let Some(ms) = env_parse::<u64>("MINING_TICK_MS")? {
        config.tick_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = env_parse::<u64>("MINING_CHECKPOINT_SECS")? {
        config.checkpoint_interval = Duration::from_secs(secs);
    }
    if let Some(rate) = env_parse::<Decimal>("MINING_BASE_RATE")? {
        config.base_rate_per_minute = rate;
    }
    if let Some(rate) = env_parse::<Decimal>("MINING_REFERRAL_RATE")? {
        config.referral_rate = rate;
    }
    if let Some(policy) = env_parse::<FlushFailurePolicy>("MINING_FLUSH_POLICY")? {
        config.flush_failure_policy = policy;
    }
    if let Some(ms) = env_parse::<u64>("ANTI_CHEAT_TIMEOUT_MS")? {
        config.anti_cheat_timeout = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(None),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, flushing mining sessions");
}
