//! Execution queue - turns triggers into exchange closes
//!
//! One worker at a time drains the queue in FIFO order, so no two closes ever
//! race each other on the exchange. A position can be pending at most once.
//! Failed attempts are retried on the next qualifying tick until the attempt
//! budget runs out, after which the position is dropped from monitoring and
//! flagged for manual intervention.

use crate::config::ExecutionConfig;
use crate::db::{CloseRecord, ExchangeAccount, ExitOrder, PositionStore};
use crate::services::exchange::{ExchangeCredentials, MarketOrderRequest, OrderPlacer};
use crate::services::exchange_errors::ExchangeError;
use crate::services::metrics::Metrics;
use crate::types::{
    AccountType, CloseRequest, ExitPnl, PositionId, PositionStatus, QueueEvent, QueueStatus,
};
use crate::vault::decrypt_secret;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Why a close attempt failed
#[derive(Debug, Error)]
pub enum CloseError {
    #[error("no active exchange account for portfolio {0}")]
    NoActiveExchange(i64),
    #[error("exchange credentials unavailable: {0}")]
    Credentials(String),
    #[error("{0}")]
    Exchange(#[from] ExchangeError),
    #[error("order {order_id} filled zero quantity")]
    ZeroFill { order_id: String },
    #[error("failed to record close: {0}")]
    Persistence(String),
}

impl CloseError {
    /// Text stored on the position; exchange errors use the venue's own message
    pub fn user_message(&self) -> String {
        match self {
            CloseError::Exchange(e) => e.user_message(),
            other => other.to_string(),
        }
    }

    /// Whether the next trigger has a chance of succeeding without manual action
    pub fn is_retryable(&self) -> bool {
        match self {
            CloseError::Exchange(e) => e.is_retryable(),
            CloseError::ZeroFill { .. } | CloseError::Persistence(_) => true,
            CloseError::NoActiveExchange(_) | CloseError::Credentials(_) => false,
        }
    }
}

/// Warning stored on the position after a failed attempt
fn failure_warning(err: &CloseError, attempt: u32, max_attempts: u32) -> String {
    if attempt >= max_attempts {
        return format!(
            "Auto-exit failed after {} attempts, monitoring stopped. Close manually: {}",
            max_attempts,
            err.user_message()
        );
    }
    match err {
        CloseError::ZeroFill { order_id } => format!(
            "Auto-exit zero-fill: order {} executed nothing, retry {}/{}",
            order_id, attempt, max_attempts
        ),
        _ => format!(
            "Auto-exit failed, retry {}/{}: {}",
            attempt,
            max_attempts,
            err.user_message()
        ),
    }
}

enum CloseOutcome {
    Closed(CloseRecord),
    /// Closed through another path before this request ran
    AlreadyClosed,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<CloseRequest>,
    /// Queued or being processed
    pending: HashSet<PositionId>,
    processing: bool,
    retry_counts: HashMap<PositionId, u32>,
}

struct Inner {
    store: Arc<dyn PositionStore>,
    placer: Arc<dyn OrderPlacer>,
    passphrase: Option<String>,
    config: ExecutionConfig,
    events: mpsc::UnboundedSender<QueueEvent>,
    metrics: Metrics,
    state: Mutex<QueueState>,
    credentials: Mutex<HashMap<i64, ExchangeCredentials>>,
}

/// Sequential close executor
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    pub fn new(
        store: Arc<dyn PositionStore>,
        placer: Arc<dyn OrderPlacer>,
        passphrase: Option<String>,
        config: ExecutionConfig,
        events: mpsc::UnboundedSender<QueueEvent>,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                placer,
                passphrase,
                config,
                events,
                metrics,
                state: Mutex::new(QueueState::default()),
                credentials: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue a close. Returns false when the position is already pending.
    pub async fn queue_close(&self, request: CloseRequest) -> bool {
        let id = request.position.id;
        let mut state = self.inner.state.lock().await;

        if !state.pending.insert(id) {
            debug!("[Exec Queue] Position {} already pending, ignoring trigger", id);
            return false;
        }

        info!(
            "[Exec Queue] Queued {} close for position {} at {} ({} waiting)",
            request.reason,
            id,
            request.trigger_price,
            state.queue.len() + 1
        );
        state.queue.push_back(request);

        if !state.processing {
            state.processing = true;
            tokio::spawn(worker(self.inner.clone()));
        }
        true
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let mut pending_position_ids: Vec<PositionId> = state.pending.iter().copied().collect();
        pending_position_ids.sort_unstable();
        QueueStatus {
            queue_size: state.queue.len(),
            processing: state.processing,
            pending_position_ids,
        }
    }

    /// Failed attempts so far for a position
    pub async fn retry_count(&self, id: PositionId) -> u32 {
        self.inner.state.lock().await.retry_counts.get(&id).copied().unwrap_or(0)
    }

    /// Drop the retry count of a position that left monitoring some other way
    pub async fn forget(&self, id: PositionId) {
        if self.inner.state.lock().await.retry_counts.remove(&id).is_some() {
            debug!("[Exec Queue] Cleared retry count for position {}", id);
        }
    }
}

#[cfg(test)]
impl ExecutionQueue {
    pub(crate) async fn seed_credentials_for_test(&self, account_id: i64) {
        self.inner.credentials.lock().await.insert(
            account_id,
            ExchangeCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
            },
        );
    }
}

/// Drain the queue, then exit. Only one runs at a time.
async fn worker(inner: Arc<Inner>) {
    debug!("[Exec Queue] Worker started");
    loop {
        let request = {
            let mut state = inner.state.lock().await;
            match state.queue.pop_front() {
                Some(r) => r,
                None => {
                    state.processing = false;
                    break;
                }
            }
        };

        let id = request.position.id;
        let event = inner.process(&request).await;

        // Un-pend before reporting so a re-trigger after RetryPending is accepted
        let more = {
            let mut state = inner.state.lock().await;
            state.pending.remove(&id);
            !state.queue.is_empty()
        };
        if inner.events.send(event).is_err() {
            warn!("[Exec Queue] Nobody listening for outcome of position {}", id);
        }

        if more {
            tokio::time::sleep(inner.config.item_delay).await;
        }
    }
    debug!("[Exec Queue] Worker idle");
}

impl Inner {
    async fn process(&self, request: &CloseRequest) -> QueueEvent {
        let id = request.position.id;

        match self.close_position(request).await {
            Ok(CloseOutcome::Closed(record)) => {
                self.state.lock().await.retry_counts.remove(&id);
                self.metrics.inc_closes_succeeded();
                info!(
                    "[Exec Queue] Position {} closed by {}: exit {} PnL {} ({}%)",
                    id,
                    request.reason,
                    record.exit.exit_price,
                    record.exit.pnl,
                    record.exit.pnl_percent.round_dp(2)
                );
                self.spawn_recalculation(request.position.portfolio_id);
                QueueEvent::Closed(id)
            }
            Ok(CloseOutcome::AlreadyClosed) => {
                self.state.lock().await.retry_counts.remove(&id);
                info!("[Exec Queue] Position {} no longer open, nothing to do", id);
                QueueEvent::Closed(id)
            }
            Err(err) => {
                self.metrics.inc_close_attempts_failed();
                let max = self.config.max_attempts;
                let attempt = {
                    let mut state = self.state.lock().await;
                    let count = state.retry_counts.entry(id).or_insert(0);
                    *count += 1;
                    let attempt = *count;
                    if attempt >= max {
                        state.retry_counts.remove(&id);
                    }
                    attempt
                };

                let warning = failure_warning(&err, attempt, max);
                if let Err(e) = self.store.set_warning(id, &warning).await {
                    error!("[Exec Queue] Failed to store warning for position {}: {}", id, e);
                }

                if attempt >= max {
                    self.metrics.inc_closes_abandoned();
                    error!(
                        "[Exec Queue] Giving up on position {} after {} attempts: {}",
                        id, attempt, err
                    );
                    QueueEvent::Abandoned(id)
                } else {
                    warn!(
                        "[Exec Queue] Close attempt {}/{} for position {} failed ({}): {}",
                        attempt,
                        max,
                        id,
                        if err.is_retryable() { "transient" } else { "needs attention" },
                        err
                    );
                    QueueEvent::RetryPending(id)
                }
            }
        }
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<CloseOutcome, CloseError> {
        let position = &request.position;

        let current = self
            .store
            .get_position(position.id)
            .await
            .map_err(|e| CloseError::Persistence(e.to_string()))?;
        if !matches!(current, Some(ref p) if p.status == PositionStatus::Open) {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        let account = self
            .store
            .get_active_exchange(position.portfolio_id)
            .await
            .map_err(|e| CloseError::Persistence(e.to_string()))?
            .ok_or(CloseError::NoActiveExchange(position.portfolio_id))?;
        let credentials = self.credentials_for(&account).await?;

        let order = MarketOrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.closing_order_side(),
            quantity: position.quantity,
            account_type: position.account_type,
            auto_repay: position.account_type == AccountType::Margin,
        };
        let fill = self.placer.place_market_order(&credentials, &order).await?;

        if fill.executed_qty.is_zero() {
            return Err(CloseError::ZeroFill {
                order_id: fill.order_id,
            });
        }

        let exit_price = fill.cumulative_quote_qty / fill.executed_qty;
        let exit = ExitPnl::compute(position, exit_price, fill.cumulative_quote_qty);

        let record = CloseRecord {
            position_id: position.id,
            exit,
            order: ExitOrder {
                exchange_order_id: fill.order_id,
                client_order_id: fill.client_order_id,
                symbol: position.symbol.clone(),
                side: fill.side,
                quantity: fill.executed_qty,
                price: exit_price,
                quote_value: fill.cumulative_quote_qty,
            },
            closed_at: Utc::now(),
        };

        self.store
            .record_close(&record)
            .await
            .map_err(|e| CloseError::Persistence(e.to_string()))?;

        Ok(CloseOutcome::Closed(record))
    }

    async fn credentials_for(&self, account: &ExchangeAccount) -> Result<ExchangeCredentials, CloseError> {
        if let Some(creds) = self.credentials.lock().await.get(&account.id) {
            return Ok(creds.clone());
        }

        let passphrase = self
            .passphrase
            .clone()
            .ok_or_else(|| CloseError::Credentials("CREDENTIALS_PASSPHRASE is not set".to_string()))?;
        let secret = account.secret.clone();

        // Key derivation is CPU-bound
        let api_secret = tokio::task::spawn_blocking(move || decrypt_secret(&secret, &passphrase))
            .await
            .map_err(|e| CloseError::Credentials(e.to_string()))?
            .map_err(|e| CloseError::Credentials(e.to_string()))?;

        let creds = ExchangeCredentials {
            api_key: account.api_key.clone(),
            api_secret,
        };
        self.credentials.lock().await.insert(account.id, creds.clone());
        Ok(creds)
    }

    /// Best-effort portfolio statistics refresh
    fn spawn_recalculation(&self, portfolio_id: i64) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.recalculate_portfolio_stats(portfolio_id).await {
                warn!(
                    "[Exec Queue] Stats recalculation for portfolio {} failed: {}",
                    portfolio_id, e
                );
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::PortfolioStats;
    use crate::services::exchange::OrderFill;
    use crate::types::tests::position;
    use crate::types::{MonitoredPosition, OrderSide, Position, PositionSide, TriggerReason};
    use crate::vault::EncryptedSecret;
    use anyhow::Result;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) fn stored(p: &MonitoredPosition) -> Position {
        Position {
            id: p.id,
            portfolio_id: p.portfolio_id,
            user_id: p.user_id,
            symbol: p.symbol.clone(),
            side: p.side,
            account_type: p.account_type,
            quantity: p.quantity,
            entry_price: p.entry_price,
            entry_value: p.entry_value,
            stop_loss: p.stop_loss,
            take_profit: p.take_profit,
            status: PositionStatus::Open,
            exit_price: None,
            exit_value: None,
            pnl: None,
            pnl_percent: None,
            warning_message: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub positions: std::sync::Mutex<HashMap<PositionId, Position>>,
        pub has_exchange: std::sync::atomic::AtomicBool,
        pub fail_load: std::sync::atomic::AtomicBool,
        pub warnings: std::sync::Mutex<Vec<(PositionId, String)>>,
        pub exit_orders: std::sync::Mutex<Vec<ExitOrder>>,
        pub recalculations: AtomicUsize,
    }

    impl FakeStore {
        pub(crate) fn with(positions: &[MonitoredPosition]) -> Self {
            let store = Self::default();
            store.has_exchange.store(true, Ordering::SeqCst);
            {
                let mut map = store.positions.lock().unwrap();
                for p in positions {
                    map.insert(p.id, stored(p));
                }
            }
            store
        }

        pub(crate) fn status(&self, id: PositionId) -> PositionStatus {
            self.positions.lock().unwrap()[&id].status
        }

        pub(crate) fn last_warning(&self) -> Option<String> {
            self.warnings.lock().unwrap().last().map(|(_, w)| w.clone())
        }
    }

    #[async_trait]
    impl PositionStore for FakeStore {
        async fn get_monitorable_positions(&self) -> Result<Vec<Position>> {
            if self.fail_load.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            Ok(self
                .positions
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.to_monitored().is_some())
                .cloned()
                .collect())
        }

        async fn get_position(&self, id: PositionId) -> Result<Option<Position>> {
            Ok(self.positions.lock().unwrap().get(&id).cloned())
        }

        async fn get_active_exchange(&self, portfolio_id: i64) -> Result<Option<ExchangeAccount>> {
            if !self.has_exchange.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(ExchangeAccount {
                id: 1,
                portfolio_id,
                exchange: "binance".to_string(),
                api_key: "key".to_string(),
                secret: EncryptedSecret {
                    ciphertext: vec![],
                    salt: vec![],
                    nonce: vec![],
                },
            }))
        }

        async fn record_close(&self, record: &CloseRecord) -> Result<()> {
            let mut positions = self.positions.lock().unwrap();
            let position = positions
                .get_mut(&record.position_id)
                .filter(|p| p.status == PositionStatus::Open)
                .ok_or_else(|| anyhow::anyhow!("not open"))?;
            position.status = PositionStatus::Closed;
            position.exit_price = Some(record.exit.exit_price);
            position.pnl = Some(record.exit.pnl);
            position.pnl_percent = Some(record.exit.pnl_percent);
            position.warning_message = None;
            self.exit_orders.lock().unwrap().push(record.order.clone());
            Ok(())
        }

        async fn set_warning(&self, id: PositionId, message: &str) -> Result<()> {
            self.warnings.lock().unwrap().push((id, message.to_string()));
            if let Some(p) = self.positions.lock().unwrap().get_mut(&id) {
                p.warning_message = Some(message.to_string());
            }
            Ok(())
        }

        async fn recalculate_portfolio_stats(&self, portfolio_id: i64) -> Result<PortfolioStats> {
            self.recalculations.fetch_add(1, Ordering::SeqCst);
            Ok(PortfolioStats {
                portfolio_id,
                ..Default::default()
            })
        }
    }

    /// Replays scripted responses; fills everything once the script runs out
    #[derive(Default)]
    pub(crate) struct FakePlacer {
        pub script: std::sync::Mutex<VecDeque<Result<OrderFill, ExchangeError>>>,
        pub orders: std::sync::Mutex<Vec<MarketOrderRequest>>,
        pub delay: Duration,
    }

    impl FakePlacer {
        pub(crate) fn failing(times: usize) -> Self {
            let placer = Self::default();
            {
                let mut script = placer.script.lock().unwrap();
                for _ in 0..times {
                    script.push_back(Err(ExchangeError::NetworkError("Request timed out".into())));
                }
            }
            placer
        }

        pub(crate) fn calls(&self) -> usize {
            self.orders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrderPlacer for FakePlacer {
        async fn place_market_order(
            &self,
            _credentials: &ExchangeCredentials,
            order: &MarketOrderRequest,
        ) -> Result<OrderFill, ExchangeError> {
            self.orders.lock().unwrap().push(order.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(OrderFill {
                    order_id: "1001".to_string(),
                    client_order_id: "pg-test".to_string(),
                    side: order.side,
                    executed_qty: order.quantity,
                    cumulative_quote_qty: order.quantity * dec!(110),
                })
            })
        }
    }

    pub(crate) async fn queue_with(
        store: Arc<FakeStore>,
        placer: Arc<FakePlacer>,
    ) -> (ExecutionQueue, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ExecutionConfig {
            item_delay: Duration::from_millis(1),
            max_attempts: 3,
        };
        let queue = ExecutionQueue::new(store, placer, None, config, tx, Metrics::new());
        queue.seed_credentials_for_test(1).await;
        (queue, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("queue event")
            .expect("channel open")
    }

    fn request(p: &MonitoredPosition, price: Decimal) -> CloseRequest {
        CloseRequest::new(p.clone(), price, TriggerReason::TakeProfit)
    }

    #[tokio::test]
    async fn test_close_records_pnl_and_exit_order() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::default());
        let (queue, mut events) = queue_with(store.clone(), placer.clone()).await;

        assert!(queue.queue_close(request(&p, dec!(111))).await);
        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(1));

        assert_eq!(store.status(1), PositionStatus::Closed);
        let position = store.positions.lock().unwrap()[&1].clone();
        assert_eq!(position.exit_price, Some(dec!(110)));
        assert_eq!(position.pnl, Some(dec!(20)));
        assert_eq!(position.pnl_percent, Some(dec!(10)));

        let orders = placer.orders.lock().unwrap().clone();
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, dec!(2));
        assert!(!orders[0].auto_repay);
        assert_eq!(store.exit_orders.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.recalculations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_margin_close_buys_with_auto_repay() {
        let mut p = position(1, "BTCUSDT", PositionSide::Short);
        p.account_type = AccountType::Margin;
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::default());
        let (queue, mut events) = queue_with(store, placer.clone()).await;

        queue.queue_close(request(&p, dec!(89))).await;
        next_event(&mut events).await;

        let orders = placer.orders.lock().unwrap().clone();
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(orders[0].auto_repay);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_ignored() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let (queue, mut events) = queue_with(store, placer.clone()).await;

        assert!(queue.queue_close(request(&p, dec!(111))).await);
        assert!(!queue.queue_close(request(&p, dec!(112))).await);
        assert_eq!(queue.get_queue_status().await.pending_position_ids, vec![1]);

        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(placer.calls(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requests_processed_in_order() {
        let a = position(1, "BTCUSDT", PositionSide::Long);
        let b = position(2, "ETHUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[a.clone(), b.clone()]));
        let placer = Arc::new(FakePlacer {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (queue, mut events) = queue_with(store, placer.clone()).await;

        queue.queue_close(request(&a, dec!(111))).await;
        queue.queue_close(request(&b, dec!(111))).await;
        let status = queue.get_queue_status().await;
        assert!(status.processing);

        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(1));
        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(2));
        let symbols: Vec<String> = placer.orders.lock().unwrap().iter().map(|o| o.symbol.clone()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = queue.get_queue_status().await;
        assert!(!status.processing);
        assert_eq!(status.queue_size, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_failures() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::failing(3));
        let (queue, mut events) = queue_with(store.clone(), placer).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert!(store.last_warning().unwrap().contains("retry 1/3"));

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert!(store.last_warning().unwrap().contains("retry 2/3"));

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::Abandoned(1));
        assert!(store.last_warning().unwrap().contains("Close manually"));

        // Left open for manual handling
        assert_eq!(store.status(1), PositionStatus::Open);
        assert_eq!(queue.retry_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_success_after_two_failures_clears_counter() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::failing(2));
        let (queue, mut events) = queue_with(store.clone(), placer).await;

        for _ in 0..2 {
            queue.queue_close(request(&p, dec!(111))).await;
            assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        }
        assert_eq!(queue.retry_count(1).await, 2);

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(1));
        assert_eq!(store.status(1), PositionStatus::Closed);
        assert_eq!(queue.retry_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_zero_fill_is_a_failed_attempt() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::default());
        placer.script.lock().unwrap().push_back(Ok(OrderFill {
            order_id: "77".to_string(),
            client_order_id: "pg-zero".to_string(),
            side: OrderSide::Sell,
            executed_qty: Decimal::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
        }));
        let (queue, mut events) = queue_with(store.clone(), placer).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert!(store.last_warning().unwrap().contains("zero-fill"));
        assert_eq!(store.status(1), PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_missing_exchange_counts_as_failure() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        store.has_exchange.store(false, Ordering::SeqCst);
        let placer = Arc::new(FakePlacer::default());
        let (queue, mut events) = queue_with(store.clone(), placer.clone()).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert!(store.last_warning().unwrap().contains("no active exchange"));
        assert_eq!(placer.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_passphrase_is_credentials_failure() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::default());
        let (queue, mut events) = queue_with(store.clone(), placer.clone()).await;
        queue.inner.credentials.lock().await.clear();

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert!(store.last_warning().unwrap().contains("CREDENTIALS_PASSPHRASE"));
        assert_eq!(placer.calls(), 0);
    }

    #[tokio::test]
    async fn test_exchange_rejection_stores_venue_message() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::default());
        placer.script.lock().unwrap().push_back(Err(ExchangeError::from_response(
            400,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
        )));
        let (queue, mut events) = queue_with(store.clone(), placer).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert_eq!(
            store.last_warning().unwrap(),
            "Auto-exit failed, retry 1/3: Filter failure: LOT_SIZE (-1013)"
        );
    }

    #[test]
    fn test_close_error_retryability() {
        assert!(CloseError::from(ExchangeError::RateLimited).is_retryable());
        assert!(!CloseError::from(ExchangeError::AuthenticationFailed).is_retryable());
        assert!(CloseError::ZeroFill { order_id: "1".into() }.is_retryable());
        assert!(!CloseError::NoActiveExchange(1).is_retryable());
        assert_eq!(
            CloseError::NoActiveExchange(4).user_message(),
            "no active exchange account for portfolio 4"
        );
    }

    #[tokio::test]
    async fn test_forget_clears_retry_count() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        let placer = Arc::new(FakePlacer::failing(1));
        let (queue, mut events) = queue_with(store, placer).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::RetryPending(1));
        assert_eq!(queue.retry_count(1).await, 1);

        queue.forget(1).await;
        assert_eq!(queue.retry_count(1).await, 0);
        queue.forget(1).await;
    }

    #[tokio::test]
    async fn test_already_closed_position_is_not_resold() {
        let p = position(1, "BTCUSDT", PositionSide::Long);
        let store = Arc::new(FakeStore::with(&[p.clone()]));
        store.positions.lock().unwrap().get_mut(&1).unwrap().status = PositionStatus::Closed;
        let placer = Arc::new(FakePlacer::default());
        let (queue, mut events) = queue_with(store, placer.clone()).await;

        queue.queue_close(request(&p, dec!(111))).await;
        assert_eq!(next_event(&mut events).await, QueueEvent::Closed(1));
        assert_eq!(placer.calls(), 0);
    }
}
