//! Guard coordinator - lifecycle of the price stream and execution queue
//!
//! Constructed once at startup and shared via `Arc`. Wires triggers from the
//! price stream into the execution queue and queue outcomes back into the
//! price stream, and restores the watch set from the database.

use crate::config::Config;
use crate::db::PositionStore;
use crate::services::exchange::OrderPlacer;
use crate::services::execution_queue::ExecutionQueue;
use crate::services::metrics::{Metrics, MetricsSnapshot};
use crate::services::price_stream::PriceStreamManager;
use crate::types::{CloseRequest, MonitorStats, PositionId, QueueEvent, QueueStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Warning stored on a position when protection could not be set up
pub const MONITORING_UNAVAILABLE: &str =
    "Stop-loss/take-profit monitoring unavailable. Close this position manually.";

/// Result of a start-monitoring request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Watching,
    /// Open but without stop-loss or take-profit (or already closed)
    Unprotected,
    NotFound,
    /// Services could not start; a warning was stored on the position
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub initialized: bool,
    pub monitor: Option<MonitorStats>,
    pub queue: Option<QueueStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatus {
    pub initialized: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    pub monitor: Option<MonitorStats>,
    pub queue: Option<QueueStatus>,
    pub last_prices: BTreeMap<String, Decimal>,
    pub metrics: MetricsSnapshot,
}

struct Services {
    stream: Arc<PriceStreamManager>,
    queue: ExecutionQueue,
    started_at: DateTime<Utc>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct GuardCoordinator {
    store: Arc<dyn PositionStore>,
    placer: Arc<dyn OrderPlacer>,
    config: Config,
    metrics: Metrics,
    services: RwLock<Option<Services>>,
}

impl GuardCoordinator {
    pub fn new(store: Arc<dyn PositionStore>, placer: Arc<dyn OrderPlacer>, config: Config) -> Self {
        Self {
            store,
            placer,
            config,
            metrics: Metrics::new(),
            services: RwLock::new(None),
        }
    }

    /// Build and start both services, then load protected positions. No-op if already running.
    pub async fn initialize(&self) -> Result<()> {
        let mut services = self.services.write().await;
        if services.is_some() {
            return Ok(());
        }

        info!("[Guard] Initializing position protection");

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<CloseRequest>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<QueueEvent>();

        let stream = Arc::new(PriceStreamManager::new(trigger_tx, self.metrics.clone()));
        let queue = ExecutionQueue::new(
            self.store.clone(),
            self.placer.clone(),
            self.config.credentials_passphrase.clone(),
            self.config.execution.clone(),
            event_tx,
            self.metrics.clone(),
        );

        let positions = match self.store.get_monitorable_positions().await {
            Ok(p) => p,
            Err(e) => {
                stream.shutdown().await;
                return Err(e).context("Failed to load monitorable positions");
            }
        };

        let mut loaded = 0;
        for position in positions {
            if let Some(monitored) = position.to_monitored() {
                stream.add_position(monitored).await;
                loaded += 1;
            }
        }

        if let Err(e) = stream
            .start(&self.config.market_stream_url, self.config.stream.clone())
            .await
        {
            stream.shutdown().await;
            return Err(e);
        }

        let tasks = vec![
            tokio::spawn(forward_triggers(trigger_rx, queue.clone())),
            tokio::spawn(forward_events(event_rx, stream.clone())),
        ];

        *services = Some(Services {
            stream,
            queue,
            started_at: Utc::now(),
            tasks,
        });

        info!("[Guard] Monitoring {} positions", loaded);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.services.read().await.is_some()
    }

    /// Watch a newly opened position. Never fails; problems become a position warning.
    pub async fn start_monitoring(&self, id: PositionId) -> StartOutcome {
        if let Err(e) = self.initialize().await {
            error!("[Guard] Cannot start monitoring position {}: {:#}", id, e);
            self.flag_unavailable(id).await;
            return StartOutcome::Unavailable;
        }

        let position = match self.store.get_position(id).await {
            Ok(Some(p)) => p,
            Ok(None) => return StartOutcome::NotFound,
            Err(e) => {
                error!("[Guard] Failed to load position {}: {}", id, e);
                self.flag_unavailable(id).await;
                return StartOutcome::Unavailable;
            }
        };

        let Some(monitored) = position.to_monitored() else {
            return StartOutcome::Unprotected;
        };

        let services = self.services.read().await;
        let Some(services) = services.as_ref() else {
            // Shut down between initialize and here
            self.flag_unavailable(id).await;
            return StartOutcome::Unavailable;
        };

        // Threshold edits replace the snapshot
        if let Some(existing) = services.stream.watched_position(id).await {
            if existing != monitored {
                services.stream.remove_position(id).await;
            }
        }
        services.stream.add_position(monitored).await;
        StartOutcome::Watching
    }

    /// Stop watching a position closed through another path
    pub async fn stop_monitoring(&self, id: PositionId) {
        if let Some(services) = self.services.read().await.as_ref() {
            services.stream.remove_position(id).await;
            services.queue.forget(id).await;
        }
    }

    pub async fn get_stats(&self) -> GuardStats {
        match self.services.read().await.as_ref() {
            Some(s) => GuardStats {
                initialized: true,
                monitor: Some(s.stream.get_stats().await),
                queue: Some(s.queue.get_queue_status().await),
            },
            None => GuardStats {
                initialized: false,
                monitor: None,
                queue: None,
            },
        }
    }

    pub async fn get_detailed_status(&self) -> DetailedStatus {
        let metrics = self.metrics.snapshot();
        match self.services.read().await.as_ref() {
            Some(s) => DetailedStatus {
                initialized: true,
                started_at: Some(s.started_at),
                uptime_seconds: Some((Utc::now() - s.started_at).num_seconds()),
                monitor: Some(s.stream.get_stats().await),
                queue: Some(s.queue.get_queue_status().await),
                last_prices: s.stream.last_prices().await,
                metrics,
            },
            None => DetailedStatus {
                initialized: false,
                started_at: None,
                uptime_seconds: None,
                monitor: None,
                queue: None,
                last_prices: BTreeMap::new(),
                metrics,
            },
        }
    }

    /// Stop the stream and forget both services. Safe when never initialized.
    pub async fn shutdown(&self) {
        let Some(services) = self.services.write().await.take() else {
            return;
        };

        services.stream.shutdown().await;
        for task in services.tasks {
            task.abort();
        }
        info!("[Guard] Shut down");
    }

    async fn flag_unavailable(&self, id: PositionId) {
        if let Err(e) = self.store.set_warning(id, MONITORING_UNAVAILABLE).await {
            warn!("[Guard] Failed to store warning for position {}: {}", id, e);
        }
    }
}

async fn forward_triggers(mut rx: mpsc::UnboundedReceiver<CloseRequest>, queue: ExecutionQueue) {
    while let Some(request) = rx.recv().await {
        queue.queue_close(request).await;
    }
}

async fn forward_events(mut rx: mpsc::UnboundedReceiver<QueueEvent>, stream: Arc<PriceStreamManager>) {
    while let Some(event) = rx.recv().await {
        stream.handle_queue_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::execution_queue::tests::{FakePlacer, FakeStore};
    use crate::types::tests::position;
    use crate::types::{PositionSide, PositionStatus};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            // Nothing listens here; the stream keeps backing off in the background
            market_stream_url: "ws://127.0.0.1:1".to_string(),
            credentials_passphrase: Some("test-pass".to_string()),
            ..Config::default()
        }
    }

    fn coordinator(store: Arc<FakeStore>) -> GuardCoordinator {
        GuardCoordinator::new(store, Arc::new(FakePlacer::default()), config())
    }

    #[tokio::test]
    async fn test_initialize_loads_protected_positions_once() {
        let mut unprotected = position(3, "ETHUSDT", PositionSide::Long);
        unprotected.stop_loss = None;
        unprotected.take_profit = None;
        let store = Arc::new(FakeStore::with(&[
            position(1, "BTCUSDT", PositionSide::Long),
            position(2, "BTCUSDT", PositionSide::Short),
            unprotected,
        ]));
        let guard = coordinator(store);

        guard.initialize().await.unwrap();
        guard.initialize().await.unwrap();

        let stats = guard.get_stats().await;
        assert!(stats.initialized);
        let monitor = stats.monitor.unwrap();
        assert_eq!(monitor.monitored_positions, 2);
        assert_eq!(monitor.symbols, vec!["BTCUSDT".to_string()]);

        guard.shutdown().await;
        assert!(!guard.get_stats().await.initialized);
    }

    #[tokio::test]
    async fn test_start_monitoring_initializes_on_demand() {
        let store = Arc::new(FakeStore::with(&[position(1, "BTCUSDT", PositionSide::Long)]));
        let guard = coordinator(store);

        assert_eq!(guard.start_monitoring(1).await, StartOutcome::Watching);
        assert!(guard.is_initialized().await);
        assert_eq!(guard.get_stats().await.monitor.unwrap().monitored_positions, 1);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_monitoring_skips_unprotected_and_unknown() {
        let mut p = position(1, "BTCUSDT", PositionSide::Long);
        p.stop_loss = None;
        p.take_profit = None;
        let store = Arc::new(FakeStore::with(&[p]));
        let guard = coordinator(store.clone());

        assert_eq!(guard.start_monitoring(1).await, StartOutcome::Unprotected);
        assert_eq!(guard.start_monitoring(42).await, StartOutcome::NotFound);
        assert_eq!(guard.get_stats().await.monitor.unwrap().monitored_positions, 0);
        assert!(store.last_warning().is_none());
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_threshold_change_replaces_snapshot() {
        let store = Arc::new(FakeStore::with(&[position(1, "BTCUSDT", PositionSide::Long)]));
        let guard = coordinator(store.clone());
        guard.initialize().await.unwrap();

        store.positions.lock().unwrap().get_mut(&1).unwrap().take_profit = Some(dec!(150));
        assert_eq!(guard.start_monitoring(1).await, StartOutcome::Watching);

        let services = guard.services.read().await;
        let watched = services.as_ref().unwrap().stream.watched_position(1).await.unwrap();
        assert_eq!(watched.take_profit, Some(dec!(150)));
        drop(services);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_failure_degrades_to_warning() {
        let store = Arc::new(FakeStore::with(&[position(1, "BTCUSDT", PositionSide::Long)]));
        store.fail_load.store(true, Ordering::SeqCst);
        let guard = coordinator(store.clone());

        assert_eq!(guard.start_monitoring(1).await, StartOutcome::Unavailable);
        assert!(!guard.is_initialized().await);
        assert_eq!(store.last_warning().as_deref(), Some(MONITORING_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_stop_and_shutdown_without_initialize() {
        let guard = coordinator(Arc::new(FakeStore::default()));
        guard.stop_monitoring(1).await;
        guard.shutdown().await;
        assert!(!guard.get_detailed_status().await.initialized);
    }

    #[tokio::test]
    async fn test_stop_monitoring_clears_failed_attempts() {
        let store = Arc::new(FakeStore::with(&[position(1, "BTCUSDT", PositionSide::Long)]));
        let guard = GuardCoordinator::new(store.clone(), Arc::new(FakePlacer::failing(1)), config());
        guard.initialize().await.unwrap();

        let services = guard.services.read().await;
        let queue = services.as_ref().unwrap().queue.clone();
        let stream = services.as_ref().unwrap().stream.clone();
        drop(services);
        queue.seed_credentials_for_test(1).await;
        stream
            .handle_message(r#"{"stream":"btcusdt@ticker","data":{"s":"BTCUSDT","c":"111"}}"#)
            .await;

        let mut failed = false;
        for _ in 0..100 {
            if queue.retry_count(1).await == 1 {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed);

        // Closed by hand after the failed attempt
        guard.stop_monitoring(1).await;
        assert_eq!(queue.retry_count(1).await, 0);
        assert!(stream.watched_position(1).await.is_none());
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_closes_and_unwatches() {
        let store = Arc::new(FakeStore::with(&[position(1, "BTCUSDT", PositionSide::Long)]));
        let guard = coordinator(store.clone());
        guard.initialize().await.unwrap();
        {
            let services = guard.services.read().await;
            let services = services.as_ref().unwrap();
            // Queue needs no decryption for this account
            services.queue.seed_credentials_for_test(1).await;
            services
                .stream
                .handle_message(r#"{"stream":"btcusdt@ticker","data":{"s":"BTCUSDT","c":"111"}}"#)
                .await;
        }

        let mut unwatched = false;
        for _ in 0..100 {
            if guard.get_stats().await.monitor.unwrap().monitored_positions == 0 {
                unwatched = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(unwatched);
        assert_eq!(store.status(1), PositionStatus::Closed);

        let status = guard.get_detailed_status().await;
        assert_eq!(status.metrics.closes_succeeded, 1);
        assert_eq!(status.metrics.triggers_fired, 1);
        assert!(status.uptime_seconds.is_some());
        guard.shutdown().await;
    }
}
