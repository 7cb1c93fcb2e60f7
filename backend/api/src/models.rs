//! Domain records and status enums.
//!
//! Status values are stored as lowercase TEXT in SQLite and round-trip
//! through `sqlx::Type`; `as_str` gives the canonical storage form for
//! hand-written query fragments.

use serde::{Deserialize, Serialize};

/// Account role. Only fulfillers may unlock needs or hold credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Asker,
    Fulfiller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NeedStatus {
    Active,
    Fulfilled,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UnlockStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl UnlockStatus {
    /// Parse the storage form back into a status (query-string filters).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
}

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub role: UserRole,
    pub credits: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Need {
    pub id: i64,
    pub asker_id: i64,
    pub title: String,
    pub description: String,
    pub budget: i64,
    pub location: String,
    pub status: NeedStatus,
    pub unlock_count: i64,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unlock {
    pub id: i64,
    pub need_id: i64,
    pub fulfiller_id: i64,
    pub amount: i64,
    pub transaction_id: Option<String>,
    pub receipt: Option<String>,
    pub status: UnlockStatus,
    pub contact_details_revealed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditPurchase {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub credits: i64,
    pub transaction_id: Option<String>,
    pub status: PurchaseStatus,
    pub created_at: i64,
}

/// Outcome of a `RequestUnlock`: either a stored credit satisfied the
/// unlock immediately, or a payment prompt is on its way to the
/// fulfiller's phone.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnlockOutcome {
    CreditSatisfied { unlock: Unlock },
    PaymentPending { unlock: Unlock, customer_message: String },
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
