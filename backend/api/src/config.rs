//! Application configuration loaded from environment variables.

use crate::errors::{ApiError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Price of a single unlock, in whole KES
    pub unlock_price: i64,
    /// Price of a single prepaid credit, in whole KES
    pub credit_price: i64,
    /// Daraja API base URL (sandbox by default)
    pub daraja_base_url: String,
    /// Daraja OAuth consumer key
    pub daraja_consumer_key: String,
    /// Daraja OAuth consumer secret
    pub daraja_consumer_secret: String,
    /// Paybill / till shortcode
    pub daraja_shortcode: String,
    /// STK push passkey
    pub daraja_passkey: String,
    /// Publicly reachable URL the gateway posts payment results to
    pub callback_url: String,
    /// Timeout for outbound gateway calls, in seconds
    pub gateway_timeout_secs: u64,
    /// How often (in seconds) the sweeper marks overdue needs expired
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./fulfillme.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| ApiError::Config("Invalid API_PORT".to_string()))?,
            unlock_price: env_var("UNLOCK_PRICE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| ApiError::Config("Invalid UNLOCK_PRICE".to_string()))?,
            credit_price: env_var("CREDIT_PRICE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| ApiError::Config("Invalid CREDIT_PRICE".to_string()))?,
            daraja_base_url: env_var("DARAJA_BASE_URL")
                .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
            daraja_consumer_key: env_var("DARAJA_CONSUMER_KEY").map_err(|_| {
                ApiError::Config("DARAJA_CONSUMER_KEY environment variable is required".to_string())
            })?,
            daraja_consumer_secret: env_var("DARAJA_CONSUMER_SECRET").map_err(|_| {
                ApiError::Config(
                    "DARAJA_CONSUMER_SECRET environment variable is required".to_string(),
                )
            })?,
            daraja_shortcode: env_var("DARAJA_SHORTCODE").map_err(|_| {
                ApiError::Config("DARAJA_SHORTCODE environment variable is required".to_string())
            })?,
            daraja_passkey: env_var("DARAJA_PASSKEY").map_err(|_| {
                ApiError::Config("DARAJA_PASSKEY environment variable is required".to_string())
            })?,
            callback_url: env_var("CALLBACK_URL").map_err(|_| {
                ApiError::Config("CALLBACK_URL environment variable is required".to_string())
            })?,
            gateway_timeout_secs: env_var("GATEWAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ApiError::Config("Invalid GATEWAY_TIMEOUT_SECS".to_string()))?,
            sweep_interval_secs: env_var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| ApiError::Config("Invalid SWEEP_INTERVAL_SECS".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ApiError::Config(format!("Missing env var: {key}")))
}
