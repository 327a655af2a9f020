//! Rate Limiter - token bucket for exchange REST limits
//!
//! Binance-style venues enforce:
//! - Request weight: 6000 per minute per IP
//! - Orders: 100 per 10 seconds per account
//!
//! Buckets run at 80% of those limits as a safety margin.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Rate limit classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitClass {
    /// Signed or public REST requests, counted by weight
    RequestWeight,
    /// New order submissions
    Order,
}

impl LimitClass {
    fn max_tokens(&self) -> u32 {
        match self {
            LimitClass::RequestWeight => 4800, // 80% of 6000
            LimitClass::Order => 80,           // 80% of 100
        }
    }

    fn window(&self) -> Duration {
        match self {
            LimitClass::RequestWeight => Duration::from_secs(60),
            LimitClass::Order => Duration::from_secs(10),
        }
    }
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(class: LimitClass) -> Self {
        let max = class.max_tokens() as f64;
        Self {
            tokens: max,
            max_tokens: max,
            refill_rate: max / class.window().as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Rate limiter with one bucket per limit class
pub struct RateLimiter {
    request_weight: Arc<Mutex<TokenBucket>>,
    order: Arc<Mutex<TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            request_weight: Arc::new(Mutex::new(TokenBucket::new(LimitClass::RequestWeight))),
            order: Arc::new(Mutex::new(TokenBucket::new(LimitClass::Order))),
        }
    }

    /// Acquire a token, waiting if necessary.
    /// Returns true if we had to wait (i.e., were rate limited).
    pub async fn acquire(&self, class: LimitClass) -> bool {
        let bucket = self.bucket(class);
        let mut waited = false;
        loop {
            let wait_time = {
                let mut b = bucket.lock().await;
                if b.try_acquire() {
                    return waited;
                }
                b.time_until_available()
            };

            waited = true;
            debug!("Rate limiter: waiting {:?} for {:?}", wait_time, class);
            tokio::time::sleep(wait_time).await;
        }
    }

    fn bucket(&self, class: LimitClass) -> &Arc<Mutex<TokenBucket>> {
        match class {
            LimitClass::RequestWeight => &self.request_weight,
            LimitClass::Order => &self.order,
        }
    }
}
