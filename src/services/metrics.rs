//! Counters for the price stream and execution queue

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Price ticks matched against watchers
    pub ticks_processed: u64,
    /// Market data messages that could not be parsed
    pub parse_errors: u64,
    /// Triggers sent to the execution queue
    pub triggers_fired: u64,
    pub closes_succeeded: u64,
    pub close_attempts_failed: u64,
    /// Positions dropped after exhausting close attempts
    pub closes_abandoned: u64,
    pub stream_reconnects: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    ticks_processed: AtomicU64,
    parse_errors: AtomicU64,
    triggers_fired: AtomicU64,
    closes_succeeded: AtomicU64,
    close_attempts_failed: AtomicU64,
    closes_abandoned: AtomicU64,
    stream_reconnects: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ticks_processed(&self) {
        self.inner.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_errors(&self) {
        self.inner.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_triggers_fired(&self) {
        self.inner.triggers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closes_succeeded(&self) {
        self.inner.closes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_close_attempts_failed(&self) {
        self.inner.close_attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closes_abandoned(&self) {
        self.inner.closes_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_reconnects(&self) {
        self.inner.stream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_processed: self.inner.ticks_processed.load(Ordering::Relaxed),
            parse_errors: self.inner.parse_errors.load(Ordering::Relaxed),
            triggers_fired: self.inner.triggers_fired.load(Ordering::Relaxed),
            closes_succeeded: self.inner.closes_succeeded.load(Ordering::Relaxed),
            close_attempts_failed: self.inner.close_attempts_failed.load(Ordering::Relaxed),
            closes_abandoned: self.inner.closes_abandoned.load(Ordering::Relaxed),
            stream_reconnects: self.inner.stream_reconnects.load(Ordering::Relaxed),
        }
    }
}
