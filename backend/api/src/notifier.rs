//! Notification seam — contact-detail delivery and lifecycle notices.
//!
//! `notify` returns immediately and never fails: implementations own
//! their dispatch (and any spawning, batching, or retries) and log
//! delivery problems instead of surfacing them, so a flaky mail or SMS
//! provider can never fail or slow down a ledger operation.

use crate::models::{Need, User};
use tracing::info;

/// Something a user should hear about.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Contact details revealed to a fulfiller after a completed unlock.
    ContactDetails { fulfiller: User, need: Need, asker: User },
    /// A fulfiller unlocked the asker's need.
    NeedUnlocked { asker: User, need: Need, fulfiller_name: String },
    /// A need was cancelled and the fulfiller's spend came back as a credit.
    UnlockRefunded { fulfiller: User, need_title: String },
    /// A credit purchase was confirmed.
    CreditsGranted { buyer: User, credits: i64 },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Default notifier: structured log lines in place of email/SMS
/// delivery. The channels themselves live behind this trait in a
/// separate service.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::ContactDetails { fulfiller, need, asker } => {
                info!(
                    fulfiller_id = fulfiller.id,
                    need_id = need.id,
                    asker_phone = %asker.phone,
                    asker_email = %asker.email,
                    "contact details delivered to fulfiller"
                );
            }
            Notification::NeedUnlocked { asker, need, fulfiller_name } => {
                info!(
                    asker_id = asker.id,
                    need_id = need.id,
                    fulfiller = %fulfiller_name,
                    "need unlocked, asker notified"
                );
            }
            Notification::UnlockRefunded { fulfiller, need_title } => {
                info!(
                    fulfiller_id = fulfiller.id,
                    need_title = %need_title,
                    "unlock refunded as a credit"
                );
            }
            Notification::CreditsGranted { buyer, credits } => {
                info!(buyer_id = buyer.id, credits, "credit purchase confirmed");
            }
        }
    }
}
