//! Shared test fixtures: an in-memory database, scripted gateway, and
//! recording notifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{ApiError, Result};
use crate::gateway::{PaymentGateway, StkAcknowledgement, StkStatus};
use crate::models::{Need, User, UserRole};
use crate::notifier::{Notification, Notifier};

static SEED_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A single-connection in-memory database with migrations applied.
/// Single connection because every new `sqlite::memory:` connection
/// would otherwise see a fresh empty database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub async fn seed_user(pool: &SqlitePool, full_name: &str, role: UserRole, credits: i64) -> User {
    let n = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
    let phone = format!("0700{n:06}");
    let email = format!(
        "{}.{n}@example.com",
        full_name.to_lowercase().replace(' ', ".")
    );
    let user = db::insert_user(pool, full_name, &phone, &email, role)
        .await
        .expect("insert user");
    if credits > 0 {
        db::grant_credits(pool, user.id, credits).await.expect("grant credits");
    }
    db::get_user(pool, user.id).await.expect("get user").expect("user exists")
}

pub async fn seed_need(pool: &SqlitePool, asker_id: i64, expires_at: i64) -> Need {
    db::insert_need(
        pool,
        asker_id,
        "Fix a leaking kitchen tap",
        "The tap in my kitchen has been dripping for a week.",
        1500,
        "Nairobi",
        expires_at,
    )
    .await
    .expect("insert need")
}

// ─────────────────────────────────────────────────────────
// Scripted gateway
// ─────────────────────────────────────────────────────────

pub enum InitiateBehavior {
    Accept,
    Reject(String),
    Unreachable(String),
}

pub enum PollBehavior {
    Status(StkStatus),
    Unreachable,
}

pub struct MockGateway {
    pub initiate: InitiateBehavior,
    pub poll: PollBehavior,
    pub checkout_counter: AtomicU64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            initiate: InitiateBehavior::Accept,
            poll: PollBehavior::Status(StkStatus {
                result_code: None,
                description: "Transaction is being processed".to_string(),
            }),
            checkout_counter: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initiate_prompt(
        &self,
        _phone: &str,
        _amount: i64,
        _reference: &str,
        _description: &str,
    ) -> Result<StkAcknowledgement> {
        match &self.initiate {
            InitiateBehavior::Accept => {
                let n = self.checkout_counter.fetch_add(1, Ordering::Relaxed);
                Ok(StkAcknowledgement {
                    checkout_request_id: format!("ws_CO_{n:012}"),
                    customer_message: "Success. Request accepted for processing".to_string(),
                })
            }
            InitiateBehavior::Reject(reason) => Err(ApiError::GatewayRejected(reason.clone())),
            InitiateBehavior::Unreachable(reason) => {
                Err(ApiError::GatewayUnreachable(reason.clone()))
            }
        }
    }

    async fn poll_status(&self, _checkout_request_id: &str) -> Result<StkStatus> {
        match &self.poll {
            PollBehavior::Status(status) => Ok(status.clone()),
            PollBehavior::Unreachable => {
                Err(ApiError::GatewayUnreachable("connection timed out".to_string()))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Recording notifier
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().expect("notifier lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.events.lock().expect("notifier lock").push(notification);
    }
}
