//! Axum REST API handlers.
//!
//! Requester identity arrives as an `x-user-id` header set by the
//! upstream auth proxy; this service trusts it. The payment callback
//! endpoint is the one handler that never surfaces errors: the gateway
//! contract requires a `200` acknowledgement no matter what happened
//! internally, or it keeps retrying and raising alerts.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db;
use crate::errors::{ApiError, Result};
use crate::gateway::CallbackEnvelope;
use crate::ledger::UnlockLedger;
use crate::models::{CreditPurchase, Need, Unlock, UnlockStatus, UserRole};

/// Default need lifetime when the asker doesn't pick an expiry.
const DEFAULT_NEED_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: UnlockLedger,
    pub pool: SqlitePool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/users", post(create_user))
        .route("/api/v1/needs", post(create_need).get(list_needs))
        .route("/api/v1/needs/:id", get(get_need).delete(cancel_need))
        .route("/api/v1/needs/:id/unlock", post(unlock_need))
        .route("/api/v1/unlocks", get(list_unlocks))
        .route("/api/v1/unlocks/:id/status", get(unlock_status))
        .route("/api/v1/credits/purchase", post(purchase_credits))
        .route("/api/v1/credits", get(get_credits))
        .route("/api/v1/payments/callback", post(payment_callback))
        .with_state(state)
}

/// Pull the requester's id out of the `x-user-id` header.
fn requester_id(headers: &HeaderMap) -> Result<i64> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::Forbidden("Missing or invalid x-user-id header".to_string()))
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Deserialize)]
pub struct CreateNeedRequest {
    pub title: String,
    pub description: String,
    pub budget: i64,
    pub location: String,
    pub expires_at: Option<i64>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub credits: Option<i64>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct NeedsResponse {
    pub count: usize,
    pub needs: Vec<Need>,
}

/// Asker block on a need detail: contact fields are only present when
/// the requester holds a completed unlock.
#[derive(Serialize)]
pub struct AskerSummary {
    pub id: i64,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Serialize)]
pub struct NeedDetailResponse {
    pub need: Need,
    pub asker: AskerSummary,
    pub has_unlocked: bool,
}

#[derive(Serialize)]
pub struct UnlocksResponse {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub unlocks: Vec<Unlock>,
}

#[derive(Serialize)]
pub struct CreditsResponse {
    pub credits: i64,
    pub purchases: Vec<CreditPurchase>,
}

/// Fixed acknowledgement body the gateway expects, field names
/// included.
#[derive(Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/v1/users`
pub async fn create_user(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse> {
    if req.full_name.trim().is_empty() || req.phone.trim().is_empty() || req.email.trim().is_empty()
    {
        return Err(ApiError::Invalid(
            "full_name, phone, and email are required".to_string(),
        ));
    }

    let user = db::insert_user(&state.pool, &req.full_name, &req.phone, &req.email, req.role)
        .await
        .map_err(|e| match e {
            ApiError::Database(ref db_err) if db::is_unique_violation(db_err) => {
                ApiError::Conflict("Phone or email already registered".to_string())
            }
            other => other,
        })?;

    Ok((StatusCode::CREATED, Json(user)))
}

/// `POST /api/v1/needs`
pub async fn create_need(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateNeedRequest>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let user = db::get_user(&state.pool, requester)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    if user.role != UserRole::Asker {
        return Err(ApiError::Forbidden("Only askers can create needs".to_string()));
    }

    if req.title.trim().is_empty() || req.description.trim().is_empty() {
        return Err(ApiError::Invalid("title and description are required".to_string()));
    }
    if req.budget <= 0 {
        return Err(ApiError::Invalid("budget must be positive".to_string()));
    }

    let now = Utc::now().timestamp();
    let expires_at = req.expires_at.unwrap_or(now + DEFAULT_NEED_TTL_SECS);
    if expires_at <= now {
        return Err(ApiError::Invalid("expires_at must be in the future".to_string()));
    }

    let need = db::insert_need(
        &state.pool,
        user.id,
        &req.title,
        &req.description,
        req.budget,
        &req.location,
        expires_at,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(need)))
}

/// `GET /api/v1/needs`
pub async fn list_needs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let (limit, offset) = page_bounds(&query);
    let needs = db::list_open_needs(&state.pool, Utc::now().timestamp(), limit, offset).await?;
    Ok(Json(NeedsResponse {
        count: needs.len(),
        needs,
    }))
}

/// `GET /api/v1/needs/:id`
///
/// Contact details are gated: only a requester with a completed unlock
/// for this need sees the asker's phone and email.
pub async fn get_need(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let need = db::get_need(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Need not found".to_string()))?;
    let asker = db::get_user(&state.pool, need.asker_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Asker not found".to_string()))?;

    let has_unlocked = match requester_id(&headers) {
        Ok(requester) => {
            requester == need.asker_id
                || db::find_completed_unlock(&state.pool, need.id, requester)
                    .await?
                    .is_some()
        }
        Err(_) => false,
    };

    let asker = AskerSummary {
        id: asker.id,
        full_name: asker.full_name,
        phone: has_unlocked.then_some(asker.phone),
        email: has_unlocked.then_some(asker.email),
    };

    Ok(Json(NeedDetailResponse {
        need,
        asker,
        has_unlocked,
    }))
}

/// `DELETE /api/v1/needs/:id`
pub async fn cancel_need(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let summary = state.ledger.cancel_need(id, requester).await?;
    Ok(Json(summary))
}

/// `POST /api/v1/needs/:id/unlock`
pub async fn unlock_need(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let outcome = state.ledger.request_unlock(id, requester).await?;
    Ok(Json(outcome))
}

/// `GET /api/v1/unlocks`
pub async fn list_unlocks(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let status = match query.status.as_deref() {
        Some(s) => Some(
            UnlockStatus::parse(s)
                .ok_or_else(|| ApiError::Invalid(format!("Unknown status filter: {s}")))?,
        ),
        None => None,
    };

    let (limit, offset) = page_bounds(&query);
    let unlocks = db::list_unlocks(&state.pool, requester, status, limit, offset).await?;
    let total = db::count_unlocks(&state.pool, requester, status).await?;

    Ok(Json(UnlocksResponse {
        total,
        page: query.page.unwrap_or(1).max(1),
        limit,
        unlocks,
    }))
}

/// `GET /api/v1/unlocks/:id/status`
pub async fn unlock_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let unlock = state.ledger.check_status(id, requester).await?;
    Ok(Json(unlock))
}

/// `POST /api/v1/credits/purchase`
pub async fn purchase_credits(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<PurchaseRequest>,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let outcome = state
        .ledger
        .purchase_credits(requester, req.credits.unwrap_or(1))
        .await?;
    Ok(Json(outcome))
}

/// `GET /api/v1/credits`
pub async fn get_credits(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let requester = requester_id(&headers)?;
    let user = db::get_user(&state.pool, requester)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let purchases = db::list_purchases(&state.pool, requester, 10).await?;
    Ok(Json(CreditsResponse {
        credits: user.credits,
        purchases,
    }))
}

/// `POST /api/v1/payments/callback`
///
/// Always answers `200` with the fixed acknowledgement body, even for
/// payloads that don't parse — anything else makes the gateway retry
/// indefinitely.
pub async fn payment_callback(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> impl IntoResponse {
    match serde_json::from_slice::<CallbackEnvelope>(&body) {
        Ok(envelope) => state.ledger.reconcile_callback(&envelope).await,
        Err(e) => warn!("unparseable gateway callback: {e}"),
    }

    (
        StatusCode::OK,
        Json(CallbackAck {
            result_code: 0,
            result_desc: "Success",
        }),
    )
}

fn page_bounds(query: &PageQuery) -> (i64, i64) {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    (limit, (page - 1) * limit)
}

// ─────────────────────────────────────────────────────────
// Router tests
// ─────────────────────────────────────────────────────────
