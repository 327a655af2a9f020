//! Market order placement against a Binance-compatible REST API

use crate::services::exchange_errors::ExchangeError;
use crate::services::rate_limiter::{LimitClass, RateLimiter};
use crate::types::{AccountType, OrderSide};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const SPOT_ORDER_PATH: &str = "/api/v3/order";
const MARGIN_ORDER_PATH: &str = "/sapi/v1/margin/order";
const RECV_WINDOW_MS: u64 = 5000;

/// Decrypted API credentials for one exchange account
#[derive(Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// A market order for the full quantity of a position
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub account_type: AccountType,
    /// Margin only: repay borrowed balance with the proceeds
    pub auto_repay: bool,
}

/// What the exchange reports back for a placed order
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
    #[serde(deserialize_with = "order_id_as_string")]
    pub order_id: String,
    pub client_order_id: String,
    pub side: OrderSide,
    pub executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty")]
    pub cumulative_quote_qty: Decimal,
}

fn order_id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::String(s) => Ok(s),
        other => Err(serde::de::Error::custom(format!("unexpected orderId {}", other))),
    }
}

/// Order placement capability used by the execution queue
#[async_trait]
pub trait OrderPlacer: Send + Sync {
    async fn place_market_order(
        &self,
        credentials: &ExchangeCredentials,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError>;
}

/// Signed REST client
pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

impl BinanceClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(),
        })
    }
}

/// Hex HMAC-SHA256 of the query string
pub fn sign_query(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ExchangeError::AuthenticationFailed)?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Unsigned query string for a market order
pub fn build_order_query(order: &MarketOrderRequest, client_order_id: &str, timestamp_ms: i64) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("symbol", order.symbol.to_uppercase()),
        ("side", order.side.as_str().to_string()),
        ("type", "MARKET".to_string()),
        ("quantity", order.quantity.normalize().to_string()),
        ("newClientOrderId", client_order_id.to_string()),
        ("newOrderRespType", "FULL".to_string()),
    ];
    if order.account_type == AccountType::Margin && order.auto_repay {
        params.push(("sideEffectType", "AUTO_REPAY".to_string()));
    }
    params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
    params.push(("timestamp", timestamp_ms.to_string()));

    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl OrderPlacer for BinanceClient {
    async fn place_market_order(
        &self,
        credentials: &ExchangeCredentials,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let path = match order.account_type {
            AccountType::Spot => SPOT_ORDER_PATH,
            AccountType::Margin => MARGIN_ORDER_PATH,
        };

        let client_order_id = format!("pg-{}", uuid::Uuid::new_v4().simple());
        let query = build_order_query(order, &client_order_id, chrono::Utc::now().timestamp_millis());
        let signature = sign_query(&credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        if self.limiter.acquire(LimitClass::Order).await {
            debug!("Order rate limit reached, waited before submitting {}", client_order_id);
        }
        self.limiter.acquire(LimitClass::RequestWeight).await;

        info!(
            "Placing {} MARKET {} {} ({}) id={}",
            order.account_type, order.side, order.quantity, order.symbol, client_order_id
        );

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        if !status.is_success() {
            let err = ExchangeError::from_response(status.as_u16(), &text);
            warn!("Order {} rejected ({}): {}", client_order_id, status, err);
            return Err(err);
        }

        serde_json::from_str::<OrderFill>(&text).map_err(|e| ExchangeError::Unknown {
            status: status.as_u16(),
            code: None,
            body: format!("unreadable order response: {}", e),
        })
    }
}
