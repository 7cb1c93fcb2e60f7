//! M-Pesa Daraja client — STK push initiation, status query, and
//! callback parsing.
//!
//! The OAuth access token is cached inside the client with an expiry
//! margin, so callers just hold a [`DarajaClient`] and never manage
//! tokens themselves. Outbound calls use the shared `reqwest` client's
//! bounded timeout and are never retried here; a missed result is
//! recovered through the asynchronous callback or a later status poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::errors::{ApiError, Result};

/// Seconds shaved off the token lifetime before we refresh.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

/// Daraja's "transaction is being processed" error code on the status
/// query endpoint.
const PROCESSING_ERROR_CODE: &str = "500.001.1001";

// ─────────────────────────────────────────────────────────
// Gateway seam
// ─────────────────────────────────────────────────────────

/// Acknowledgement returned when an STK push was accepted for delivery.
#[derive(Debug, Clone)]
pub struct StkAcknowledgement {
    pub checkout_request_id: String,
    pub customer_message: String,
}

/// Authoritative status of an in-flight STK push.
#[derive(Debug, Clone)]
pub struct StkStatus {
    /// `Some("0")` means paid; any other `Some` is a final failure;
    /// `None` means the prompt is still outstanding.
    pub result_code: Option<String>,
    pub description: String,
}

/// Outbound payment-gateway operations the ledger depends on.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_prompt(
        &self,
        phone: &str,
        amount: i64,
        reference: &str,
        description: &str,
    ) -> Result<StkAcknowledgement>;

    async fn poll_status(&self, checkout_request_id: &str) -> Result<StkStatus>;
}

// ─────────────────────────────────────────────────────────
// Daraja implementation
// ─────────────────────────────────────────────────────────

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct DarajaClient {
    http: Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    shortcode: String,
    passkey: String,
    callback_url: String,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl DarajaClient {
    pub fn new(http: Client, config: &Config) -> Self {
        Self {
            http,
            base_url: config.daraja_base_url.clone(),
            consumer_key: config.daraja_consumer_key.clone(),
            consumer_secret: config.daraja_consumer_secret.clone(),
            shortcode: config.daraja_shortcode.clone(),
            passkey: config.daraja_passkey.clone(),
            callback_url: config.callback_url.clone(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// Return a valid OAuth token, fetching a fresh one when the cached
    /// token is missing or inside the expiry margin.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.base_url
            ))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .send()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(e.to_string()))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(format!("invalid token response: {e}")))?;

        let lifetime: u64 = body.expires_in.parse().unwrap_or(3599);
        let expires_at = Instant::now()
            + Duration::from_secs(lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS));

        debug!("Refreshed Daraja access token (lifetime {lifetime}s)");
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at,
        });
        Ok(body.access_token)
    }

    fn stk_password(&self, timestamp: &str) -> String {
        BASE64.encode(format!("{}{}{timestamp}", self.shortcode, self.passkey))
    }
}

#[async_trait]
impl PaymentGateway for DarajaClient {
    async fn initiate_prompt(
        &self,
        phone: &str,
        amount: i64,
        reference: &str,
        description: &str,
    ) -> Result<StkAcknowledgement> {
        let token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let msisdn = format_msisdn(phone);

        let payload = json!({
            "BusinessShortCode": self.shortcode,
            "Password": self.stk_password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": msisdn,
            "PartyB": self.shortcode,
            "PhoneNumber": msisdn,
            "CallBackURL": self.callback_url,
            "AccountReference": reference,
            "TransactionDesc": description,
        });

        let response = self
            .http
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(e.to_string()))?;

        let body: StkPushResponse = response
            .json()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(format!("invalid gateway response: {e}")))?;

        match (body.response_code.as_deref(), body.checkout_request_id) {
            (Some("0"), Some(checkout_request_id)) => Ok(StkAcknowledgement {
                checkout_request_id,
                customer_message: body
                    .customer_message
                    .unwrap_or_else(|| "Payment prompt sent".to_string()),
            }),
            _ => Err(ApiError::GatewayRejected(
                body.response_description
                    .or(body.error_message)
                    .unwrap_or_else(|| "STK push failed".to_string()),
            )),
        }
    }

    async fn poll_status(&self, checkout_request_id: &str) -> Result<StkStatus> {
        let token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        let payload = json!({
            "BusinessShortCode": self.shortcode,
            "Password": self.stk_password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let response = self
            .http
            .post(format!("{}/mpesa/stkpushquery/v1/query", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(e.to_string()))?;

        let body: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| ApiError::GatewayUnreachable(format!("invalid gateway response: {e}")))?;

        // While the prompt is still on the customer's phone the query
        // endpoint answers with a "being processed" error instead of a
        // result code.
        if body.error_code.as_deref() == Some(PROCESSING_ERROR_CODE) {
            return Ok(StkStatus {
                result_code: None,
                description: body
                    .error_message
                    .unwrap_or_else(|| "Transaction is being processed".to_string()),
            });
        }
        if let Some(error) = body.error_message {
            return Err(ApiError::GatewayUnreachable(error));
        }

        Ok(StkStatus {
            result_code: body.result_code,
            description: body.result_desc.unwrap_or_default(),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: Option<String>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Asynchronous payment-result payload posted by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<Value>,
}

/// A callback reduced to what the ledger needs.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub checkout_request_id: String,
    pub outcome: CallbackOutcome,
}

#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Success { receipt: Option<String> },
    Failure { description: String },
}

/// Flatten the gateway's callback envelope into a [`CallbackResult`].
pub fn parse_callback(envelope: &CallbackEnvelope) -> CallbackResult {
    let callback = &envelope.body.stk_callback;

    let outcome = if callback.result_code == 0 {
        let receipt = callback
            .callback_metadata
            .as_ref()
            .and_then(|meta| meta.item.iter().find(|i| i.name == "MpesaReceiptNumber"))
            .and_then(|i| i.value.as_ref())
            .and_then(|v| v.as_str().map(String::from));
        CallbackOutcome::Success { receipt }
    } else {
        CallbackOutcome::Failure {
            description: callback
                .result_desc
                .clone()
                .unwrap_or_else(|| format!("Result code {}", callback.result_code)),
        }
    };

    CallbackResult {
        checkout_request_id: callback.checkout_request_id.clone(),
        outcome,
    }
}

/// Normalise a Kenyan phone number to MSISDN form (2547XXXXXXXX).
pub fn format_msisdn(phone: &str) -> String {
    let trimmed = phone.trim().trim_start_matches('+');
    if let Some(rest) = trimmed.strip_prefix('0') {
        format!("254{rest}")
    } else {
        trimmed.to_string()
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
