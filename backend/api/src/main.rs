//! FulfillME backend — entry point.
//!
//! Wires the unlock ledger to SQLite, the Daraja payment gateway, and
//! the notification seam, then serves the REST API with a background
//! sweep for overdue needs.

mod api;
mod config;
mod db;
mod errors;
mod gateway;
mod ledger;
mod models;
mod notifier;
mod sweeper;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::DarajaClient;
use ledger::UnlockLedger;
use notifier::LogNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client shared by all outbound gateway calls; the timeout
    // bounds every STK push and status query.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.gateway_timeout_secs))
        .build()?;

    let daraja = DarajaClient::new(client, &config);
    let ledger = UnlockLedger::new(
        pool.clone(),
        Arc::new(daraja),
        Arc::new(LogNotifier),
        config.unlock_price,
        config.credit_price,
    );

    let shutdown = CancellationToken::new();

    // ─── Background expiry sweeper ────────────────────────
    let sweeper_state = Arc::new(sweeper::SweeperState {
        pool: pool.clone(),
        interval_secs: config.sweep_interval_secs,
    });
    tokio::spawn(sweeper::run(sweeper_state, shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { ledger, pool });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            server_shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
