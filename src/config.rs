//! Configuration management for the position guard

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Service configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx connection string for the SQLite store
    pub database_path: String,

    /// Combined-stream market data endpoint
    pub market_stream_url: String,

    /// Exchange REST base URL for order placement
    pub exchange_rest_url: String,

    /// Passphrase used to decrypt stored exchange API secrets
    pub credentials_passphrase: Option<String>,

    /// Address for the diagnostics HTTP server
    pub http_bind_addr: String,

    pub stream: StreamConfig,

    pub execution: ExecutionConfig,
}

/// Price stream reconnection settings
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Delay before the first reconnect attempt
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reconnect delay
    pub reconnect_max_delay: Duration,
    /// Interval between keep-alive pings
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(180),
        }
    }
}

/// Execution queue settings
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Pause between consecutive close attempts (exchange rate limits)
    pub item_delay: Duration,
    /// Total close attempts per position before giving up
    pub max_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            item_delay: Duration::from_millis(250),
            max_attempts: 3,
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("{} must be an unsigned integer, got {:?}", key, v)),
        _ => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    let value = env_u64(key, u64::from(default))?;
    u32::try_from(value).with_context(|| format!("{} is too large: {}", key, value))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "sqlite:position_guard.db".to_string());

        let market_stream_url = env::var("MARKET_STREAM_URL")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443/stream".to_string());

        let exchange_rest_url = env::var("EXCHANGE_REST_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let credentials_passphrase = env::var("CREDENTIALS_PASSPHRASE").ok().filter(|s| !s.is_empty());

        let http_bind_addr = env::var("HTTP_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let stream = StreamConfig {
            reconnect_initial_delay: Duration::from_millis(env_u64("RECONNECT_INITIAL_DELAY_MS", 1000)?),
            reconnect_max_delay: Duration::from_millis(env_u64("RECONNECT_MAX_DELAY_MS", 30_000)?),
            ..StreamConfig::default()
        };

        let execution = ExecutionConfig {
            item_delay: Duration::from_millis(env_u64("EXECUTION_ITEM_DELAY_MS", 250)?),
            max_attempts: env_u32("MAX_CLOSE_ATTEMPTS", 3)?,
        };

        let config = Self {
            database_path,
            market_stream_url,
            exchange_rest_url,
            credentials_passphrase,
            http_bind_addr,
            stream,
            execution,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.reconnect_initial_delay.is_zero() {
            anyhow::bail!("RECONNECT_INITIAL_DELAY_MS must be greater than zero");
        }
        if self.stream.reconnect_max_delay < self.stream.reconnect_initial_delay {
            anyhow::bail!("RECONNECT_MAX_DELAY_MS must not be below RECONNECT_INITIAL_DELAY_MS");
        }
        if self.execution.max_attempts == 0 {
            anyhow::bail!("MAX_CLOSE_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "sqlite:position_guard.db".to_string(),
            market_stream_url: "wss://stream.binance.com:9443/stream".to_string(),
            exchange_rest_url: "https://api.binance.com".to_string(),
            credentials_passphrase: None,
            http_bind_addr: "127.0.0.1:8080".to_string(),
            stream: StreamConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}
