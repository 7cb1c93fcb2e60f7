//! Database layer — migrations and queries.
//!
//! Every state transition the ledger relies on is written as a guarded
//! conditional UPDATE (`WHERE status = 'pending'`, `WHERE credits >= 1`,
//! `WHERE status = 'active'`), so concurrent writers race safely at the
//! row level: whichever statement lands first wins and the loser updates
//! zero rows. Multi-row mutations run inside a transaction.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{CreditPurchase, Need, Unlock, UnlockStatus, User, UserRole};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// True when the error is a unique-index violation, e.g. the partial
/// index guarding against a second completed unlock for the same
/// (need, fulfiller) pair.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

pub async fn insert_user(
    pool: &SqlitePool,
    full_name: &str,
    phone: &str,
    email: &str,
    role: UserRole,
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (full_name, phone, email, role)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id, full_name, phone, email, role, credits, created_at
        "#,
    )
    .bind(full_name)
    .bind(phone)
    .bind(email)
    .bind(role)
    .fetch_one(pool)
    .await?;
    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, full_name, phone, email, role, credits, created_at FROM users WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Grant `count` prepaid credits to a user. Takes any executor so it
/// can run standalone or inside a refund/purchase transaction.
pub async fn grant_credits<'e, E>(executor: E, user_id: i64, count: i64) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE users SET credits = credits + ?1 WHERE id = ?2")
        .bind(count)
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Needs
// ─────────────────────────────────────────────────────────

pub async fn insert_need(
    pool: &SqlitePool,
    asker_id: i64,
    title: &str,
    description: &str,
    budget: i64,
    location: &str,
    expires_at: i64,
) -> Result<Need> {
    let need = sqlx::query_as::<_, Need>(
        r#"
        INSERT INTO needs (asker_id, title, description, budget, location, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id, asker_id, title, description, budget, location, status,
                  unlock_count, expires_at, created_at
        "#,
    )
    .bind(asker_id)
    .bind(title)
    .bind(description)
    .bind(budget)
    .bind(location)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(need)
}

pub async fn get_need(pool: &SqlitePool, id: i64) -> Result<Option<Need>> {
    let need = sqlx::query_as::<_, Need>(
        r#"
        SELECT id, asker_id, title, description, budget, location, status,
               unlock_count, expires_at, created_at
        FROM   needs
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(need)
}

/// Active, unexpired needs, newest first.
pub async fn list_open_needs(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<Need>> {
    let rows = sqlx::query_as::<_, Need>(
        r#"
        SELECT id, asker_id, title, description, budget, location, status,
               unlock_count, expires_at, created_at
        FROM   needs
        WHERE  status = 'active' AND expires_at > ?1
        ORDER  BY created_at DESC, id DESC
        LIMIT  ?2 OFFSET ?3
        "#,
    )
    .bind(now)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Lazy expiry transition: only an `active` need can become `expired`.
pub async fn mark_need_expired(pool: &SqlitePool, id: i64) -> Result<bool> {
    let rows = sqlx::query("UPDATE needs SET status = 'expired' WHERE id = ?1 AND status = 'active'")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

/// Sweep pass: expire every overdue `active` need in one statement.
pub async fn expire_overdue_needs(pool: &SqlitePool, now: i64) -> Result<u64> {
    let rows =
        sqlx::query("UPDATE needs SET status = 'expired' WHERE status = 'active' AND expires_at < ?1")
            .bind(now)
            .execute(pool)
            .await?
            .rows_affected();
    Ok(rows)
}

/// Soft-delete a need and refund every completed unlock on it.
///
/// Runs in one transaction: need → `cancelled`, completed unlocks →
/// `refunded`, one credit granted back per refunded unlock. Returns the
/// refunded unlocks (status already reflecting the transition) so the
/// caller can notify the affected fulfillers.
pub async fn cancel_need_with_refunds(pool: &SqlitePool, need_id: i64) -> Result<Vec<Unlock>> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE needs SET status = 'cancelled' WHERE id = ?1")
        .bind(need_id)
        .execute(&mut *tx)
        .await?;

    let mut refunded = sqlx::query_as::<_, Unlock>(
        r#"
        SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
               contact_details_revealed, created_at
        FROM   unlocks
        WHERE  need_id = ?1 AND status = 'completed'
        "#,
    )
    .bind(need_id)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query("UPDATE unlocks SET status = 'refunded' WHERE need_id = ?1 AND status = 'completed'")
        .bind(need_id)
        .execute(&mut *tx)
        .await?;

    for unlock in &refunded {
        grant_credits(&mut *tx, unlock.fulfiller_id, 1).await?;
    }

    tx.commit().await?;

    for unlock in &mut refunded {
        unlock.status = UnlockStatus::Refunded;
    }
    Ok(refunded)
}

// ─────────────────────────────────────────────────────────
// Unlocks
// ─────────────────────────────────────────────────────────

pub async fn get_unlock(pool: &SqlitePool, id: i64) -> Result<Option<Unlock>> {
    let unlock = sqlx::query_as::<_, Unlock>(
        r#"
        SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
               contact_details_revealed, created_at
        FROM   unlocks
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(unlock)
}

pub async fn get_unlock_by_transaction(
    pool: &SqlitePool,
    transaction_id: &str,
) -> Result<Option<Unlock>> {
    let unlock = sqlx::query_as::<_, Unlock>(
        r#"
        SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
               contact_details_revealed, created_at
        FROM   unlocks
        WHERE  transaction_id = ?1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(pool)
    .await?;
    Ok(unlock)
}

pub async fn find_completed_unlock(
    pool: &SqlitePool,
    need_id: i64,
    fulfiller_id: i64,
) -> Result<Option<Unlock>> {
    let unlock = sqlx::query_as::<_, Unlock>(
        r#"
        SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
               contact_details_revealed, created_at
        FROM   unlocks
        WHERE  need_id = ?1 AND fulfiller_id = ?2 AND status = 'completed'
        "#,
    )
    .bind(need_id)
    .bind(fulfiller_id)
    .fetch_optional(pool)
    .await?;
    Ok(unlock)
}

/// Credit branch of `RequestUnlock`.
///
/// One transaction covers the guarded credit decrement, the completed
/// unlock row, and the need's counter increment — both happen or
/// neither. Returns `None` when the fulfiller had no credit to spend
/// (the caller falls through to the payment branch). A unique-index
/// violation on the insert propagates so the caller can map it to a
/// duplicate-unlock conflict.
pub async fn unlock_with_credit(
    pool: &SqlitePool,
    need_id: i64,
    fulfiller_id: i64,
) -> Result<Option<Unlock>> {
    let mut tx = pool.begin().await?;

    let spent = sqlx::query("UPDATE users SET credits = credits - 1 WHERE id = ?1 AND credits >= 1")
        .bind(fulfiller_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if spent == 0 {
        return Ok(None);
    }

    let unlock = sqlx::query_as::<_, Unlock>(
        r#"
        INSERT INTO unlocks (need_id, fulfiller_id, amount, status, contact_details_revealed)
        VALUES (?1, ?2, 0, 'completed', 1)
        RETURNING id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
                  contact_details_revealed, created_at
        "#,
    )
    .bind(need_id)
    .bind(fulfiller_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE needs SET unlock_count = unlock_count + 1 WHERE id = ?1")
        .bind(need_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(unlock))
}

pub async fn insert_pending_unlock(
    pool: &SqlitePool,
    need_id: i64,
    fulfiller_id: i64,
    amount: i64,
) -> Result<Unlock> {
    let unlock = sqlx::query_as::<_, Unlock>(
        r#"
        INSERT INTO unlocks (need_id, fulfiller_id, amount, status)
        VALUES (?1, ?2, ?3, 'pending')
        RETURNING id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
                  contact_details_revealed, created_at
        "#,
    )
    .bind(need_id)
    .bind(fulfiller_id)
    .bind(amount)
    .fetch_one(pool)
    .await?;
    Ok(unlock)
}

pub async fn set_unlock_transaction(
    pool: &SqlitePool,
    unlock_id: i64,
    transaction_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE unlocks SET transaction_id = ?1 WHERE id = ?2")
        .bind(transaction_id)
        .bind(unlock_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition `pending → completed`, reveal contact details, and bump
/// the need's unlock counter. The callback and the status-poll path both
/// funnel through here; the `status = 'pending'` guard makes whichever
/// arrives second a no-op. Returns whether this call won the transition.
pub async fn complete_unlock_if_pending(
    pool: &SqlitePool,
    unlock_id: i64,
    need_id: i64,
    receipt: Option<&str>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        UPDATE unlocks
        SET    status = 'completed', receipt = ?1, contact_details_revealed = 1
        WHERE  id = ?2 AND status = 'pending'
        "#,
    )
    .bind(receipt)
    .bind(unlock_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Ok(false);
    }

    sqlx::query("UPDATE needs SET unlock_count = unlock_count + 1 WHERE id = ?1")
        .bind(need_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Transition `pending → failed`. No-op when the record already reached
/// a terminal state.
pub async fn fail_unlock_if_pending(pool: &SqlitePool, unlock_id: i64) -> Result<bool> {
    let rows = sqlx::query("UPDATE unlocks SET status = 'failed' WHERE id = ?1 AND status = 'pending'")
        .bind(unlock_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

/// A fulfiller's unlocks, newest first, optionally filtered by status.
pub async fn list_unlocks(
    pool: &SqlitePool,
    fulfiller_id: i64,
    status: Option<UnlockStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Unlock>> {
    let rows = match status {
        Some(status) => {
            sqlx::query_as::<_, Unlock>(
                r#"
                SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
                       contact_details_revealed, created_at
                FROM   unlocks
                WHERE  fulfiller_id = ?1 AND status = ?2
                ORDER  BY created_at DESC, id DESC
                LIMIT  ?3 OFFSET ?4
                "#,
            )
            .bind(fulfiller_id)
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Unlock>(
                r#"
                SELECT id, need_id, fulfiller_id, amount, transaction_id, receipt, status,
                       contact_details_revealed, created_at
                FROM   unlocks
                WHERE  fulfiller_id = ?1
                ORDER  BY created_at DESC, id DESC
                LIMIT  ?2 OFFSET ?3
                "#,
            )
            .bind(fulfiller_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn count_unlocks(
    pool: &SqlitePool,
    fulfiller_id: i64,
    status: Option<UnlockStatus>,
) -> Result<i64> {
    let (count,): (i64,) = match status {
        Some(status) => {
            sqlx::query_as("SELECT COUNT(*) FROM unlocks WHERE fulfiller_id = ?1 AND status = ?2")
                .bind(fulfiller_id)
                .bind(status.as_str())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM unlocks WHERE fulfiller_id = ?1")
                .bind(fulfiller_id)
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Credit purchases
// ─────────────────────────────────────────────────────────

pub async fn insert_pending_purchase(
    pool: &SqlitePool,
    user_id: i64,
    amount: i64,
    credits: i64,
) -> Result<CreditPurchase> {
    let purchase = sqlx::query_as::<_, CreditPurchase>(
        r#"
        INSERT INTO credit_purchases (user_id, amount, credits, status)
        VALUES (?1, ?2, ?3, 'pending')
        RETURNING id, user_id, amount, credits, transaction_id, status, created_at
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(credits)
    .fetch_one(pool)
    .await?;
    Ok(purchase)
}

pub async fn set_purchase_transaction(
    pool: &SqlitePool,
    purchase_id: i64,
    transaction_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE credit_purchases SET transaction_id = ?1 WHERE id = ?2")
        .bind(transaction_id)
        .bind(purchase_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_purchase_by_transaction(
    pool: &SqlitePool,
    transaction_id: &str,
) -> Result<Option<CreditPurchase>> {
    let purchase = sqlx::query_as::<_, CreditPurchase>(
        r#"
        SELECT id, user_id, amount, credits, transaction_id, status, created_at
        FROM   credit_purchases
        WHERE  transaction_id = ?1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(pool)
    .await?;
    Ok(purchase)
}

/// Transition a purchase `pending → completed` and grant the bought
/// credits, atomically. Duplicate callbacks grant nothing: the status
/// guard only lets the first delivery through.
pub async fn complete_purchase_if_pending(
    pool: &SqlitePool,
    purchase_id: i64,
    user_id: i64,
    credits: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE credit_purchases SET status = 'completed' WHERE id = ?1 AND status = 'pending'",
    )
    .bind(purchase_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Ok(false);
    }

    grant_credits(&mut *tx, user_id, credits).await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn fail_purchase_if_pending(pool: &SqlitePool, purchase_id: i64) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE credit_purchases SET status = 'failed' WHERE id = ?1 AND status = 'pending'",
    )
    .bind(purchase_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn list_purchases(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<CreditPurchase>> {
    let rows = sqlx::query_as::<_, CreditPurchase>(
        r#"
        SELECT id, user_id, amount, credits, transaction_id, status, created_at
        FROM   credit_purchases
        WHERE  user_id = ?1
        ORDER  BY created_at DESC, id DESC
        LIMIT  ?2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
