//! Background services for position protection

pub mod backoff;
pub mod coordinator;
pub mod exchange;
pub mod exchange_errors;
pub mod execution_queue;
pub mod metrics;
pub mod price_stream;
pub mod rate_limiter;

pub use backoff::ReconnectPolicy;
pub use coordinator::{DetailedStatus, GuardCoordinator, GuardStats, StartOutcome, MONITORING_UNAVAILABLE};
pub use exchange::{BinanceClient, ExchangeCredentials, MarketOrderRequest, OrderFill, OrderPlacer};
pub use exchange_errors::ExchangeError;
pub use execution_queue::{CloseError, ExecutionQueue};
pub use metrics::{Metrics, MetricsSnapshot};
pub use price_stream::{PriceStreamManager, StreamCommand, WatchState};
pub use rate_limiter::{LimitClass, RateLimiter};
