//! Reconnect backoff for the market data stream
//!
//! delay(n) = min(initial * 2^(n-1), max), where n counts consecutive failed
//! or dropped connections and resets to zero on a successful connect.

use crate::config::StreamConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            attempt: 0,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.reconnect_initial_delay, config.reconnect_max_delay)
    }

    /// Register a failed or closed connection and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 already dwarfs any sane cap
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
