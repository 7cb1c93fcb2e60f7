//! Unlock ledger — the state machine coordinating credits, pending
//! payments, and the gateway's asynchronous confirmations.
//!
//! A pending unlock can be completed by the gateway callback or by a
//! status poll, in either order; both funnel through one conditional
//! transition so the second arrival is a no-op. Credit spends are
//! guarded decrements inside the same transaction as the unlock row, so
//! a crash can never leave a spent credit without its unlock. Duplicate
//! completed unlocks for a (need, fulfiller) pair are stopped by a
//! pre-check and, for the remaining race window, by a partial unique
//! index.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::errors::{ApiError, Result};
use crate::gateway::{
    parse_callback, CallbackEnvelope, CallbackOutcome, CallbackResult, PaymentGateway,
};
use crate::models::{CreditPurchase, Need, NeedStatus, Unlock, UnlockOutcome, User, UserRole};
use crate::notifier::{Notification, Notifier};

/// Result of cancelling a need.
#[derive(Debug, Clone, Serialize)]
pub struct CancelSummary {
    pub need_id: i64,
    pub refunded_unlocks: usize,
}

/// Result of initiating a credit purchase.
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOutcome {
    pub purchase: CreditPurchase,
    pub customer_message: String,
}

#[derive(Clone)]
pub struct UnlockLedger {
    pool: SqlitePool,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    unlock_price: i64,
    credit_price: i64,
}

impl UnlockLedger {
    pub fn new(
        pool: SqlitePool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        unlock_price: i64,
        credit_price: i64,
    ) -> Self {
        Self {
            pool,
            gateway,
            notifier,
            unlock_price,
            credit_price,
        }
    }

    // ─────────────────────────────────────────────────────
    // RequestUnlock
    // ─────────────────────────────────────────────────────

    /// Unlock a need for a fulfiller, spending a stored credit when one
    /// is available and falling back to a payment prompt otherwise.
    pub async fn request_unlock(&self, need_id: i64, fulfiller_id: i64) -> Result<UnlockOutcome> {
        let fulfiller = db::get_user(&self.pool, fulfiller_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
        if fulfiller.role != UserRole::Fulfiller {
            return Err(ApiError::Forbidden(
                "Only fulfillers can unlock needs".to_string(),
            ));
        }

        let need = db::get_need(&self.pool, need_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Need not found".to_string()))?;
        if need.status != NeedStatus::Active {
            return Err(ApiError::Conflict(
                "This need is no longer available".to_string(),
            ));
        }
        if need.expires_at < Utc::now().timestamp() {
            db::mark_need_expired(&self.pool, need_id).await?;
            return Err(ApiError::Expired("This need has expired".to_string()));
        }

        if db::find_completed_unlock(&self.pool, need_id, fulfiller_id)
            .await?
            .is_some()
        {
            return Err(ApiError::Conflict(
                "You have already unlocked this need".to_string(),
            ));
        }

        // Single decision point: the guarded decrement either spends a
        // credit and completes the unlock in one transaction, or leaves
        // everything untouched and we fall through to payment.
        match db::unlock_with_credit(&self.pool, need_id, fulfiller_id).await {
            Ok(Some(unlock)) => {
                info!(need_id, fulfiller_id, "need unlocked with a stored credit");
                self.deliver_contact_details(&fulfiller, &need).await;
                Ok(UnlockOutcome::CreditSatisfied { unlock })
            }
            Ok(None) => self.request_paid_unlock(&fulfiller, &need).await,
            Err(ApiError::Database(e)) if db::is_unique_violation(&e) => Err(ApiError::Conflict(
                "You have already unlocked this need".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn request_paid_unlock(&self, fulfiller: &User, need: &Need) -> Result<UnlockOutcome> {
        let mut unlock =
            db::insert_pending_unlock(&self.pool, need.id, fulfiller.id, self.unlock_price).await?;

        let description = format!("Unlock need: {}", truncate(&need.title, 50));
        let reference = format!("UNLOCK-{}", unlock.id);

        match self
            .gateway
            .initiate_prompt(&fulfiller.phone, unlock.amount, &reference, &description)
            .await
        {
            Ok(ack) => {
                db::set_unlock_transaction(&self.pool, unlock.id, &ack.checkout_request_id).await?;
                unlock.transaction_id = Some(ack.checkout_request_id);
                info!(
                    unlock_id = unlock.id,
                    need_id = need.id,
                    "payment prompt sent for unlock"
                );
                Ok(UnlockOutcome::PaymentPending {
                    unlock,
                    customer_message: ack.customer_message,
                })
            }
            Err(e) => {
                db::fail_unlock_if_pending(&self.pool, unlock.id).await?;
                warn!(unlock_id = unlock.id, "payment initiation failed: {e}");
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────
    // ReconcileCallback
    // ─────────────────────────────────────────────────────

    /// Apply an asynchronous gateway result. Infallible from the
    /// caller's perspective: the callback endpoint must acknowledge no
    /// matter what, so internal failures are logged and swallowed here.
    pub async fn reconcile_callback(&self, envelope: &CallbackEnvelope) {
        let result = parse_callback(envelope);
        if let Err(e) = self.apply_callback_result(&result).await {
            error!(
                checkout_request_id = %result.checkout_request_id,
                "callback processing failed: {e}"
            );
        }
    }

    async fn apply_callback_result(&self, result: &CallbackResult) -> Result<()> {
        let checkout_request_id = result.checkout_request_id.as_str();

        if let Some(unlock) = db::get_unlock_by_transaction(&self.pool, checkout_request_id).await? {
            match &result.outcome {
                CallbackOutcome::Success { receipt } => {
                    self.complete_pending_unlock(&unlock, receipt.as_deref()).await?;
                }
                CallbackOutcome::Failure { description } => {
                    if db::fail_unlock_if_pending(&self.pool, unlock.id).await? {
                        info!(unlock_id = unlock.id, "payment failed: {description}");
                    }
                }
            }
            return Ok(());
        }

        if let Some(purchase) =
            db::get_purchase_by_transaction(&self.pool, checkout_request_id).await?
        {
            match &result.outcome {
                CallbackOutcome::Success { .. } => {
                    let granted = db::complete_purchase_if_pending(
                        &self.pool,
                        purchase.id,
                        purchase.user_id,
                        purchase.credits,
                    )
                    .await?;
                    if granted {
                        if let Some(buyer) = db::get_user(&self.pool, purchase.user_id).await? {
                            self.notifier.notify(Notification::CreditsGranted {
                                buyer,
                                credits: purchase.credits,
                            });
                        }
                    }
                }
                CallbackOutcome::Failure { description } => {
                    if db::fail_purchase_if_pending(&self.pool, purchase.id).await? {
                        info!(purchase_id = purchase.id, "credit purchase failed: {description}");
                    }
                }
            }
            return Ok(());
        }

        // Unknown or already-pruned transaction: acknowledge silently so
        // the gateway stops redelivering.
        debug!(checkout_request_id, "callback for unknown transaction");
        Ok(())
    }

    /// Shared completion routine for the callback and poll paths. Only
    /// the caller that wins the `pending → completed` transition
    /// increments the counter and sends notifications.
    async fn complete_pending_unlock(&self, unlock: &Unlock, receipt: Option<&str>) -> Result<bool> {
        if unlock.status.is_terminal() {
            return Ok(false);
        }

        let won =
            db::complete_unlock_if_pending(&self.pool, unlock.id, unlock.need_id, receipt).await?;
        if !won {
            return Ok(false);
        }

        info!(unlock_id = unlock.id, need_id = unlock.need_id, "unlock completed");

        match (
            db::get_user(&self.pool, unlock.fulfiller_id).await?,
            db::get_need(&self.pool, unlock.need_id).await?,
        ) {
            (Some(fulfiller), Some(need)) => {
                self.deliver_contact_details(&fulfiller, &need).await;
            }
            _ => warn!(
                unlock_id = unlock.id,
                "completed unlock references a missing user or need"
            ),
        }
        Ok(true)
    }

    /// Reveal the asker's contact details to the fulfiller and tell the
    /// asker their need was unlocked. Fire-and-forget.
    async fn deliver_contact_details(&self, fulfiller: &User, need: &Need) {
        match db::get_user(&self.pool, need.asker_id).await {
            Ok(Some(asker)) => {
                self.notifier.notify(Notification::ContactDetails {
                    fulfiller: fulfiller.clone(),
                    need: need.clone(),
                    asker: asker.clone(),
                });
                self.notifier.notify(Notification::NeedUnlocked {
                    asker,
                    need: need.clone(),
                    fulfiller_name: fulfiller.full_name.clone(),
                });
            }
            Ok(None) => warn!(need_id = need.id, "need references a missing asker"),
            Err(e) => warn!(need_id = need.id, "asker lookup failed: {e}"),
        }
    }

    // ─────────────────────────────────────────────────────
    // CheckStatus
    // ─────────────────────────────────────────────────────

    /// Authoritative status of an unlock, polling the gateway when the
    /// record is still pending — the reconciliation fallback for missed
    /// callbacks. Poll failures are absorbed; the current record is
    /// returned either way.
    pub async fn check_status(&self, unlock_id: i64, requester_id: i64) -> Result<Unlock> {
        let unlock = db::get_unlock(&self.pool, unlock_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Unlock not found".to_string()))?;
        if unlock.fulfiller_id != requester_id {
            return Err(ApiError::Forbidden(
                "You can only check your own unlocks".to_string(),
            ));
        }

        if !unlock.status.is_terminal() {
            if let Some(transaction_id) = unlock.transaction_id.clone() {
                match self.gateway.poll_status(&transaction_id).await {
                    Ok(status) => match status.result_code.as_deref() {
                        Some("0") => {
                            self.complete_pending_unlock(&unlock, None).await?;
                        }
                        Some(_) => {
                            if db::fail_unlock_if_pending(&self.pool, unlock.id).await? {
                                info!(unlock_id, "payment failed: {}", status.description);
                            }
                        }
                        None => debug!(unlock_id, "payment still pending at the gateway"),
                    },
                    Err(e) => warn!(unlock_id, "status poll failed: {e}"),
                }
            }
        }

        db::get_unlock(&self.pool, unlock_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Unlock not found".to_string()))
    }

    // ─────────────────────────────────────────────────────
    // CancelNeed
    // ─────────────────────────────────────────────────────

    /// Soft-delete a need and refund every completed unlock on it as a
    /// platform credit.
    pub async fn cancel_need(&self, need_id: i64, requester_id: i64) -> Result<CancelSummary> {
        let need = db::get_need(&self.pool, need_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Need not found".to_string()))?;
        if need.asker_id != requester_id {
            return Err(ApiError::Forbidden(
                "You can only delete your own needs".to_string(),
            ));
        }
        if need.status == NeedStatus::Cancelled {
            return Err(ApiError::Conflict(
                "This need is already cancelled".to_string(),
            ));
        }

        let refunded = db::cancel_need_with_refunds(&self.pool, need_id).await?;
        info!(need_id, refunds = refunded.len(), "need cancelled");

        for unlock in &refunded {
            match db::get_user(&self.pool, unlock.fulfiller_id).await {
                Ok(Some(fulfiller)) => self.notifier.notify(Notification::UnlockRefunded {
                    fulfiller,
                    need_title: need.title.clone(),
                }),
                Ok(None) => warn!(
                    unlock_id = unlock.id,
                    "refunded unlock references a missing fulfiller"
                ),
                Err(e) => warn!(unlock_id = unlock.id, "fulfiller lookup failed: {e}"),
            }
        }

        Ok(CancelSummary {
            need_id,
            refunded_unlocks: refunded.len(),
        })
    }

    // ─────────────────────────────────────────────────────
    // PurchaseCredits
    // ─────────────────────────────────────────────────────

    /// Start a credit purchase: pending record plus a payment prompt.
    /// Credits are only granted when the gateway confirms via callback.
    pub async fn purchase_credits(&self, user_id: i64, count: i64) -> Result<PurchaseOutcome> {
        if count < 1 {
            return Err(ApiError::Invalid(
                "Credit count must be at least 1".to_string(),
            ));
        }

        let buyer = db::get_user(&self.pool, user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
        if buyer.role != UserRole::Fulfiller {
            return Err(ApiError::Forbidden(
                "Only fulfillers can purchase credits".to_string(),
            ));
        }

        let amount = count * self.credit_price;
        let mut purchase = db::insert_pending_purchase(&self.pool, user_id, amount, count).await?;

        let reference = format!("CREDITS-{}", purchase.id);
        let description = format!("Purchase {count} credit(s) on FulfillME");

        match self
            .gateway
            .initiate_prompt(&buyer.phone, amount, &reference, &description)
            .await
        {
            Ok(ack) => {
                db::set_purchase_transaction(&self.pool, purchase.id, &ack.checkout_request_id)
                    .await?;
                purchase.transaction_id = Some(ack.checkout_request_id);
                Ok(PurchaseOutcome {
                    purchase,
                    customer_message: ack.customer_message,
                })
            }
            Err(e) => {
                db::fail_purchase_if_pending(&self.pool, purchase.id).await?;
                warn!(purchase_id = purchase.id, "payment initiation failed: {e}");
                Err(e)
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ─────────────────────────────────────────────────────────
// Ledger tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CallbackEnvelope, StkStatus};
    use crate::models::{NeedStatus, UnlockStatus};
    use crate::test_support::{
        memory_pool, seed_need, seed_user, InitiateBehavior, MockGateway, PollBehavior,
        RecordingNotifier,
    };

    const DAY: i64 = 86_400;

    fn ledger_with(
        pool: &SqlitePool,
        gateway: MockGateway,
        notifier: Arc<RecordingNotifier>,
    ) -> UnlockLedger {
        UnlockLedger::new(pool.clone(), Arc::new(gateway), notifier, 100, 100)
    }

    fn success_callback(checkout_request_id: &str) -> CallbackEnvelope {
        serde_json::from_value(serde_json::json!({
            "Body": {
                "stkCallback": {
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [{ "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" }]
                    }
                }
            }
        }))
        .expect("valid callback json")
    }

    fn failure_callback(checkout_request_id: &str) -> CallbackEnvelope {
        serde_json::from_value(serde_json::json!({
            "Body": {
                "stkCallback": {
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        }))
        .expect("valid callback json")
    }

    fn pending_checkout_id(outcome: &UnlockOutcome) -> (i64, String) {
        match outcome {
            UnlockOutcome::PaymentPending { unlock, .. } => (
                unlock.id,
                unlock.transaction_id.clone().expect("transaction id stored"),
            ),
            UnlockOutcome::CreditSatisfied { .. } => panic!("expected payment branch"),
        }
    }

    #[tokio::test]
    async fn credit_unlock_spends_one_credit_and_completes() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 2).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, MockGateway::default(), notifier.clone());

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let unlock = match outcome {
            UnlockOutcome::CreditSatisfied { unlock } => unlock,
            UnlockOutcome::PaymentPending { .. } => panic!("expected credit branch"),
        };
        assert_eq!(unlock.status, UnlockStatus::Completed);
        assert_eq!(unlock.amount, 0);
        assert!(unlock.contact_details_revealed);

        let fulfiller = db::get_user(&pool, fulfiller.id).await.unwrap().unwrap();
        assert_eq!(fulfiller.credits, 1);
        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 1);

        // Contact details went out and the asker was told.
        assert_eq!(notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn zero_credit_unlock_goes_pending_without_decrement() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = MockGateway::default();
        let ledger = ledger_with(&pool, gateway, notifier.clone());

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, _) = pending_checkout_id(&outcome);

        let unlock = db::get_unlock(&pool, unlock_id).await.unwrap().unwrap();
        assert_eq!(unlock.status, UnlockStatus::Pending);
        assert_eq!(unlock.amount, 100);
        assert!(!unlock.contact_details_revealed);

        let fulfiller = db::get_user(&pool, fulfiller.id).await.unwrap().unwrap();
        assert_eq!(fulfiller.credits, 0);
        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn duplicate_success_callback_completes_once() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, MockGateway::default(), notifier.clone());

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, checkout_id) = pending_checkout_id(&outcome);

        let callback = success_callback(&checkout_id);
        ledger.reconcile_callback(&callback).await;
        ledger.reconcile_callback(&callback).await;

        let unlock = db::get_unlock(&pool, unlock_id).await.unwrap().unwrap();
        assert_eq!(unlock.status, UnlockStatus::Completed);
        assert_eq!(unlock.receipt.as_deref(), Some("NLJ7RT61SV"));

        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 1);
        assert_eq!(notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn failed_callback_is_terminal_for_later_success() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, checkout_id) = pending_checkout_id(&outcome);

        ledger.reconcile_callback(&failure_callback(&checkout_id)).await;
        ledger.reconcile_callback(&success_callback(&checkout_id)).await;

        let unlock = db::get_unlock(&pool, unlock_id).await.unwrap().unwrap();
        assert_eq!(unlock.status, UnlockStatus::Failed);
        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 0);
    }

    #[tokio::test]
    async fn callback_for_unknown_transaction_is_a_no_op() {
        let pool = memory_pool().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, MockGateway::default(), notifier.clone());

        ledger.reconcile_callback(&success_callback("ws_CO_nope")).await;
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn cancelling_refunds_every_completed_unlock() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let first = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 1).await;
        let second = seed_user(&pool, "Cynthia Wambui", UserRole::Fulfiller, 1).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, MockGateway::default(), notifier.clone());

        ledger.request_unlock(need.id, first.id).await.unwrap();
        ledger.request_unlock(need.id, second.id).await.unwrap();

        let summary = ledger.cancel_need(need.id, asker.id).await.unwrap();
        assert_eq!(summary.refunded_unlocks, 2);

        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.status, NeedStatus::Cancelled);

        // Spent credits came back.
        for user_id in [first.id, second.id] {
            let user = db::get_user(&pool, user_id).await.unwrap().unwrap();
            assert_eq!(user.credits, 1);
            let unlocks = db::list_unlocks(&pool, user_id, None, 10, 0).await.unwrap();
            assert_eq!(unlocks[0].status, UnlockStatus::Refunded);
        }
    }

    #[tokio::test]
    async fn cancel_requires_ownership() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let stranger = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let err = ledger.cancel_need(need.id, stranger.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn second_unlock_of_same_need_conflicts() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 2).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let err = ledger.request_unlock(need.id, fulfiller.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        // Only the first attempt spent a credit.
        let fulfiller = db::get_user(&pool, fulfiller.id).await.unwrap().unwrap();
        assert_eq!(fulfiller.credits, 1);
    }

    #[tokio::test]
    async fn unique_index_rejects_racing_duplicate() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 2).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        // A completed row lands between the ledger's pre-check and its
        // insert; the partial unique index must reject the second one.
        db::unlock_with_credit(&pool, need.id, fulfiller.id)
            .await
            .unwrap()
            .unwrap();
        let err = db::unlock_with_credit(&pool, need.id, fulfiller.id)
            .await
            .unwrap_err();
        match err {
            ApiError::Database(e) => assert!(db::is_unique_violation(&e)),
            other => panic!("expected database error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_need_rejects_and_keeps_credits() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 2).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() - 60).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let err = ledger.request_unlock(need.id, fulfiller.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Expired(_)));

        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.status, NeedStatus::Expired);
        let fulfiller = db::get_user(&pool, fulfiller.id).await.unwrap().unwrap();
        assert_eq!(fulfiller.credits, 2);
    }

    #[tokio::test]
    async fn askers_cannot_unlock() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let other_asker = seed_user(&pool, "David Kamau", UserRole::Asker, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let err = ledger.request_unlock(need.id, other_asker.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn gateway_rejection_marks_unlock_failed() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let gateway = MockGateway {
            initiate: InitiateBehavior::Reject("Invalid PhoneNumber".to_string()),
            ..MockGateway::default()
        };
        let ledger = ledger_with(&pool, gateway, Arc::new(RecordingNotifier::default()));

        let err = ledger.request_unlock(need.id, fulfiller.id).await.unwrap_err();
        assert!(matches!(err, ApiError::GatewayRejected(_)));

        let unlocks = db::list_unlocks(&pool, fulfiller.id, None, 10, 0).await.unwrap();
        assert_eq!(unlocks.len(), 1);
        assert_eq!(unlocks[0].status, UnlockStatus::Failed);
    }

    #[tokio::test]
    async fn status_poll_completes_a_missed_callback() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let gateway = MockGateway {
            poll: PollBehavior::Status(StkStatus {
                result_code: Some("0".to_string()),
                description: "The service request is processed successfully.".to_string(),
            }),
            ..MockGateway::default()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, gateway, notifier.clone());

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, _) = pending_checkout_id(&outcome);

        let unlock = ledger.check_status(unlock_id, fulfiller.id).await.unwrap();
        assert_eq!(unlock.status, UnlockStatus::Completed);
        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 1);

        // A duplicate callback after the poll must not double-complete.
        let checkout_id = unlock.transaction_id.clone().unwrap();
        ledger.reconcile_callback(&success_callback(&checkout_id)).await;
        let need = db::get_need(&pool, need.id).await.unwrap().unwrap();
        assert_eq!(need.unlock_count, 1);
    }

    #[tokio::test]
    async fn status_poll_failure_is_absorbed() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let gateway = MockGateway {
            poll: PollBehavior::Unreachable,
            ..MockGateway::default()
        };
        let ledger = ledger_with(&pool, gateway, Arc::new(RecordingNotifier::default()));

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, _) = pending_checkout_id(&outcome);

        let unlock = ledger.check_status(unlock_id, fulfiller.id).await.unwrap();
        assert_eq!(unlock.status, UnlockStatus::Pending);
    }

    #[tokio::test]
    async fn check_status_is_owner_only() {
        let pool = memory_pool().await;
        let asker = seed_user(&pool, "Amina Njoroge", UserRole::Asker, 0).await;
        let fulfiller = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;
        let other = seed_user(&pool, "Cynthia Wambui", UserRole::Fulfiller, 0).await;
        let need = seed_need(&pool, asker.id, Utc::now().timestamp() + DAY).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let outcome = ledger.request_unlock(need.id, fulfiller.id).await.unwrap();
        let (unlock_id, _) = pending_checkout_id(&outcome);

        let err = ledger.check_status(unlock_id, other.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn credit_purchase_grants_credits_on_confirmation() {
        let pool = memory_pool().await;
        let buyer = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger_with(&pool, MockGateway::default(), notifier.clone());

        let outcome = ledger.purchase_credits(buyer.id, 5).await.unwrap();
        assert_eq!(outcome.purchase.amount, 500);
        let checkout_id = outcome.purchase.transaction_id.clone().unwrap();

        let callback = success_callback(&checkout_id);
        ledger.reconcile_callback(&callback).await;
        ledger.reconcile_callback(&callback).await;

        // Five credits, granted exactly once.
        let buyer = db::get_user(&pool, buyer.id).await.unwrap().unwrap();
        assert_eq!(buyer.credits, 5);
    }

    #[tokio::test]
    async fn purchase_rejects_non_positive_count() {
        let pool = memory_pool().await;
        let buyer = seed_user(&pool, "Brian Otieno", UserRole::Fulfiller, 0).await;

        let ledger = ledger_with(
            &pool,
            MockGateway::default(),
            Arc::new(RecordingNotifier::default()),
        );

        let err = ledger.purchase_credits(buyer.id, 0).await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }
}
