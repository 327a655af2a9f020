//! Market data stream for protected positions
//!
//! Keeps one combined-stream connection open, subscribes to the ticker of
//! every symbol that at least one monitored position references, and checks
//! each price tick against the positions watching that symbol. Triggers are
//! sent to the execution queue over a channel; queue outcomes come back
//! through [`PriceStreamManager::handle_queue_event`].

use crate::config::StreamConfig;
use crate::services::backoff::ReconnectPolicy;
use crate::services::metrics::Metrics;
use crate::types::{CloseRequest, MonitorStats, MonitoredPosition, PositionId, QueueEvent};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Stream name for a symbol's 24h ticker
fn ticker_stream(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_lowercase())
}

/// In-memory watch set. Every method is synchronous; callers hold the lock.
#[derive(Debug, Default)]
pub struct WatchState {
    positions: HashMap<PositionId, MonitoredPosition>,
    watchers: HashMap<String, HashSet<PositionId>>,
    last_prices: HashMap<String, Decimal>,
    /// Triggered and waiting for a queue outcome
    in_flight: HashSet<PositionId>,
}

impl WatchState {
    /// Returns the symbol when it gained its first watcher
    pub fn add(&mut self, position: MonitoredPosition) -> Option<String> {
        if self.positions.contains_key(&position.id) {
            return None;
        }
        let symbol = position.symbol.to_uppercase();
        let set = self.watchers.entry(symbol.clone()).or_default();
        let first = set.is_empty();
        set.insert(position.id);
        self.positions.insert(position.id, MonitoredPosition { symbol: symbol.clone(), ..position });
        first.then_some(symbol)
    }

    /// Returns the symbol when its last watcher left
    pub fn remove(&mut self, id: PositionId) -> Option<String> {
        let position = self.positions.remove(&id)?;
        self.in_flight.remove(&id);

        let emptied = match self.watchers.get_mut(&position.symbol) {
            Some(set) => {
                set.remove(&id);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.watchers.remove(&position.symbol);
            self.last_prices.remove(&position.symbol);
            return Some(position.symbol);
        }
        None
    }

    /// Evaluate a tick. Each returned request marks its position in flight.
    pub fn on_tick(&mut self, symbol: &str, price: Decimal) -> Vec<CloseRequest> {
        let Some(ids) = self.watchers.get(symbol) else {
            return Vec::new();
        };
        self.last_prices.insert(symbol.to_string(), price);

        let mut requests = Vec::new();
        for id in ids {
            if self.in_flight.contains(id) {
                continue;
            }
            let Some(position) = self.positions.get(id) else {
                continue;
            };
            if let Some(reason) = position.evaluate(price) {
                requests.push(CloseRequest::new(position.clone(), price, reason));
            }
        }
        for request in &requests {
            self.in_flight.insert(request.position.id);
        }
        requests
    }

    /// Allow a position to trigger again
    pub fn release(&mut self, id: PositionId) {
        self.in_flight.remove(&id);
    }

    pub fn get(&self, id: PositionId) -> Option<&MonitoredPosition> {
        self.positions.get(&id)
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.watchers.contains_key(symbol)
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.get(symbol).copied()
    }

    /// Watched symbols, sorted
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.watchers.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    fn clear(&mut self) {
        self.positions.clear();
        self.watchers.clear();
        self.last_prices.clear();
        self.in_flight.clear();
    }
}

/// Control message for the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: Option<TickerPayload>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
}

/// How a single connection ended
enum ConnectionEnd {
    Dropped,
    Shutdown,
}

struct Shared {
    state: RwLock<WatchState>,
    commands: mpsc::UnboundedSender<StreamCommand>,
    triggers: mpsc::UnboundedSender<CloseRequest>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    shut_down: AtomicBool,
    next_request_id: AtomicU64,
    metrics: Metrics,
}

impl Shared {
    fn send_command(&self, command: StreamCommand) {
        // Receiver only goes away once the connection task has exited
        if self.commands.send(command).is_err() {
            debug!("[Price Stream] Connection task not running, command dropped");
        }
    }

    async fn on_price_tick(&self, symbol: &str, price: Decimal) {
        let requests = self.state.write().await.on_tick(symbol, price);
        self.metrics.inc_ticks_processed();

        for request in requests {
            let id = request.position.id;
            info!(
                "[Price Stream] {} triggered for position {} ({} {} @ {})",
                request.reason, id, request.position.side, symbol, price
            );
            self.metrics.inc_triggers_fired();
            if self.triggers.send(request).is_err() {
                warn!("[Price Stream] Execution queue gone, trigger for position {} dropped", id);
                self.state.write().await.release(id);
            }
        }
    }

    async fn handle_message(&self, text: &str) {
        let envelope: StreamEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                self.metrics.inc_parse_errors();
                warn!("[Price Stream] Failed to parse message: {}", e);
                return;
            }
        };

        if let Some(err) = envelope.error {
            warn!("[Price Stream] Venue rejected request {:?}: {}", envelope.id, err);
            return;
        }

        let Some(data) = envelope.data else {
            // Acknowledgement of a SUBSCRIBE/UNSUBSCRIBE
            debug!("[Price Stream] Control ack id={:?}", envelope.id);
            return;
        };

        let price = match Decimal::from_str(&data.last_price) {
            Ok(p) if p > Decimal::ZERO => p,
            _ => {
                self.metrics.inc_parse_errors();
                warn!(
                    "[Price Stream] Bad price {:?} on {}",
                    data.last_price,
                    envelope.stream.as_deref().unwrap_or("?")
                );
                return;
            }
        };

        self.on_price_tick(&data.symbol.to_uppercase(), price).await;
    }

    fn control_message(&self, method: &str, symbols: &[String]) -> String {
        let params: Vec<String> = symbols.iter().map(|s| ticker_stream(s)).collect();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        json!({ "method": method, "params": params, "id": id }).to_string()
    }
}

/// Owns the market data connection and the watch set
pub struct PriceStreamManager {
    shared: Arc<Shared>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PriceStreamManager {
    pub fn new(triggers: mpsc::UnboundedSender<CloseRequest>, metrics: Metrics) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(WatchState::default()),
                commands,
                triggers,
                connected: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                shut_down: AtomicBool::new(false),
                next_request_id: AtomicU64::new(0),
                metrics,
            }),
            command_rx: Mutex::new(Some(command_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task. Can only be done once per instance.
    pub async fn start(&self, url: &str, config: StreamConfig) -> Result<()> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            anyhow::bail!("price stream has been shut down");
        }
        let command_rx = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("price stream already started"))?;

        let handle = tokio::spawn(run(
            self.shared.clone(),
            url.to_string(),
            config,
            command_rx,
            self.shutdown_tx.subscribe(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Start watching a position; subscribes when its symbol gains its first watcher
    pub async fn add_position(&self, position: MonitoredPosition) {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            warn!("[Price Stream] Shut down, ignoring position {}", position.id);
            return;
        }
        if !position.has_threshold() {
            debug!("[Price Stream] Position {} has no threshold, not watching", position.id);
            return;
        }

        let id = position.id;
        let mut state = self.shared.state.write().await;
        if let Some(symbol) = state.add(position) {
            info!("[Price Stream] Subscribing to {}", symbol);
            self.shared.send_command(StreamCommand::Subscribe(vec![symbol]));
        }
        debug!("[Price Stream] Watching position {} ({} total)", id, state.position_count());
    }

    /// Stop watching a position; unknown ids are ignored
    pub async fn remove_position(&self, id: PositionId) {
        let mut state = self.shared.state.write().await;
        if let Some(symbol) = state.remove(id) {
            info!("[Price Stream] No watchers left, unsubscribing from {}", symbol);
            self.shared.send_command(StreamCommand::Unsubscribe(vec![symbol]));
        }
    }

    /// Apply an execution queue outcome
    pub async fn handle_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Closed(id) | QueueEvent::Abandoned(id) => self.remove_position(id).await,
            QueueEvent::RetryPending(id) => self.shared.state.write().await.release(id),
        }
    }

    /// Feed one raw market data message
    pub async fn handle_message(&self, text: &str) {
        self.shared.handle_message(text).await;
    }

    pub async fn watched_position(&self, id: PositionId) -> Option<MonitoredPosition> {
        self.shared.state.read().await.get(id).cloned()
    }

    pub async fn last_prices(&self) -> BTreeMap<String, Decimal> {
        let state = self.shared.state.read().await;
        state
            .symbols()
            .into_iter()
            .filter_map(|s| state.last_price(&s).map(|p| (s, p)))
            .collect()
    }

    pub async fn get_stats(&self) -> MonitorStats {
        let state = self.shared.state.read().await;
        let symbols = state.symbols();
        MonitorStats {
            monitored_positions: state.position_count(),
            active_symbols: symbols.len(),
            symbols,
            connected: self.shared.connected.load(Ordering::SeqCst),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    /// Close the connection and drop all state. Terminal.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.task.lock().await.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("[Price Stream] Connection task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.state.write().await.clear();
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("[Price Stream] Shut down");
    }
}

/// Connection task: connect, serve, back off, repeat until shutdown
async fn run(
    shared: Arc<Shared>,
    url: String,
    config: StreamConfig,
    mut command_rx: mpsc::UnboundedReceiver<StreamCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut policy = ReconnectPolicy::from_config(&config);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let end = run_connection(&shared, &url, &config, &mut policy, &mut command_rx, &mut shutdown_rx).await;
        shared.connected.store(false, Ordering::SeqCst);

        match end {
            Ok(ConnectionEnd::Shutdown) => break,
            Ok(ConnectionEnd::Dropped) => info!("[Price Stream] Connection closed by venue"),
            Err(e) => warn!("[Price Stream] Connection error: {}", e),
        }

        let delay = policy.next_delay();
        shared.reconnect_attempts.store(policy.attempt(), Ordering::SeqCst);
        shared.metrics.inc_stream_reconnects();
        info!(
            "[Price Stream] Reconnecting in {:?} (attempt {})",
            delay,
            policy.attempt()
        );

        // Wait for reconnect delay OR shutdown signal
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("[Price Stream] Connection task stopped");
}

async fn run_connection(
    shared: &Arc<Shared>,
    url: &str,
    config: &StreamConfig,
    policy: &mut ReconnectPolicy,
    command_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ConnectionEnd> {
    let ws_stream = tokio::select! {
        connected = connect_async(url) => connected?.0,
        _ = shutdown_rx.changed() => return Ok(ConnectionEnd::Shutdown),
    };
    let (mut write, mut read) = ws_stream.split();

    policy.reset();
    shared.reconnect_attempts.store(0, Ordering::SeqCst);
    shared.connected.store(true, Ordering::SeqCst);
    info!("[Price Stream] Connected to {}", url);

    // Anything queued while down is superseded by a full resubscribe
    while command_rx.try_recv().is_ok() {}
    let symbols = shared.state.read().await.symbols();
    if !symbols.is_empty() {
        write
            .send(Message::Text(shared.control_message("SUBSCRIBE", &symbols)))
            .await?;
        info!("[Price Stream] Subscribed to {} symbols", symbols.len());
    }

    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_message = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(ConnectionEnd::Dropped);
                };
                last_message = Instant::now();
                match msg? {
                    Message::Text(text) => shared.handle_message(&text).await,
                    Message::Close(_) => return Ok(ConnectionEnd::Dropped),
                    _ => {}
                }
            }

            _ = ping_interval.tick() => {
                if last_message.elapsed() > config.idle_timeout {
                    anyhow::bail!("no message for {:?}", config.idle_timeout);
                }
                write.send(Message::Ping(vec![])).await?;
                debug!("[Price Stream] Sent ping");
            }

            command = command_rx.recv() => {
                let text = match command {
                    Some(StreamCommand::Subscribe(symbols)) => shared.control_message("SUBSCRIBE", &symbols),
                    Some(StreamCommand::Unsubscribe(symbols)) => shared.control_message("UNSUBSCRIBE", &symbols),
                    None => return Ok(ConnectionEnd::Shutdown),
                };
                write.send(Message::Text(text)).await?;
            }

            _ = shutdown_rx.changed() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    error!("[Price Stream] Failed to send close frame: {}", e);
                }
                return Ok(ConnectionEnd::Shutdown);
            }
        }
    }
}
