//! Background task that expires overdue needs.
//!
//! The request path already transitions an expired need lazily when a
//! fulfiller trips over it; this sweep keeps listings clean for needs
//! nobody touches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db;

pub struct SweeperState {
    pub pool: SqlitePool,
    pub interval_secs: u64,
}

/// Run the expiry sweep until the token is cancelled.
pub async fn run(state: Arc<SweeperState>, shutdown: CancellationToken) {
    info!("Expiry sweeper starting (interval {}s)", state.interval_secs);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Expiry sweeper shutting down");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(state.interval_secs)) => {
                match db::expire_overdue_needs(&state.pool, Utc::now().timestamp()).await {
                    Ok(0) => {}
                    Ok(n) => info!("Expired {n} overdue needs"),
                    Err(e) => error!("Expiry sweep error: {e}"),
                }
            }
        }
    }
}
