//! Exchange REST error classification
//!
//! Maps Binance-style `{"code": -2010, "msg": "..."}` error bodies and HTTP
//! status codes into structured errors the execution queue can act on.

use serde::Deserialize;
use thiserror::Error;

/// Structured exchange API error types
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Request weight or order-rate limit hit
    #[error("Too many requests. The exchange is rate limiting order placement.")]
    RateLimited,
    /// API key rejected, bad signature or missing permission
    #[error("API authentication failed. Check the exchange API key and its permissions.")]
    AuthenticationFailed,
    /// Not enough free balance to place the order
    #[error("Insufficient balance on the exchange account.")]
    InsufficientBalance,
    /// Symbol unknown to the exchange
    #[error("Invalid symbol.")]
    InvalidSymbol,
    /// Trading halted for the symbol
    #[error("Market is closed for this symbol.")]
    MarketClosed,
    /// Network/connection error (timeout, DNS, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Anything else, kept verbatim
    #[error("Exchange error {status} (code {code:?}): {body}")]
    Unknown {
        status: u16,
        code: Option<i64>,
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct ExchangeErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

impl ExchangeError {
    /// Parse an exchange REST response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let (code, msg) = match serde_json::from_str::<ExchangeErrorResponse>(body) {
            Ok(parsed) => (parsed.code, parsed.msg.unwrap_or_default()),
            Err(_) => (None, body.to_string()),
        };
        let msg_lower = msg.to_lowercase();

        // -1003 TOO_MANY_REQUESTS, -1015 TOO_MANY_ORDERS; 418 is an IP ban after 429s
        if status == 429 || status == 418 || matches!(code, Some(-1003) | Some(-1015)) {
            return ExchangeError::RateLimited;
        }

        // -1022 INVALID_SIGNATURE, -2014 BAD_API_KEY_FMT, -2015 REJECTED_MBX_KEY
        if status == 401
            || matches!(code, Some(-1022) | Some(-2014) | Some(-2015))
            || msg_lower.contains("invalid api-key")
            || msg_lower.contains("signature")
        {
            return ExchangeError::AuthenticationFailed;
        }

        if msg_lower.contains("insufficient balance") || msg_lower.contains("insufficient") {
            return ExchangeError::InsufficientBalance;
        }

        // -1121 BAD_SYMBOL
        if code == Some(-1121) || msg_lower.contains("invalid symbol") {
            return ExchangeError::InvalidSymbol;
        }

        if msg_lower.contains("market is closed") || msg_lower.contains("trading is disabled") {
            return ExchangeError::MarketClosed;
        }

        ExchangeError::Unknown {
            status,
            code,
            body: msg,
        }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::NetworkError("Request timed out".to_string())
        } else if err.is_connect() {
            ExchangeError::NetworkError("Connection failed".to_string())
        } else {
            ExchangeError::NetworkError(err.to_string())
        }
    }

    /// Whether waiting and trying again can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::RateLimited | ExchangeError::NetworkError(_) => true,
            // 5xx and -1021 (timestamp outside recvWindow) are transient
            ExchangeError::Unknown { status, code, .. } => *status >= 500 || *code == Some(-1021),
            _ => false,
        }
    }

    /// Short message suitable for a position warning
    pub fn user_message(&self) -> String {
        match self {
            ExchangeError::Unknown { code: Some(code), body, .. } => format!("{} ({})", body, code),
            ExchangeError::Unknown { status, body, .. } if body.is_empty() => format!("HTTP {}", status),
            ExchangeError::Unknown { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}
