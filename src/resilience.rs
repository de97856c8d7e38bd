//! Resilience utilities: reschedule backoff, send throttling, in-flight windows.
//!
//! - [`RetryConfig`]: backoff schedule for re-sending unanswered snapshot
//!   sync requests to the application
//! - [`RateLimiter`]: token bucket on outgoing replication messages
//! - [`Bulkhead`]: semaphore bounding unacknowledged log-entry messages
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), log_replication_engine::resilience::BulkheadFull> {
//! use log_replication_engine::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! // At most 10 messages waiting for an ack
//! let window = Bulkhead::for_in_flight(10);
//! let _permit = window.acquire().await?;
//! // permit dropped on ack = slot released
//! # Ok(())
//! # }
//! ```

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use governor::{Quota, RateLimiter as GovLimiter, state::{InMemoryState, NotKeyed}, clock::DefaultClock, middleware::NoOpMiddleware};
use tokio::sync::{Semaphore, OwnedSemaphorePermit};

/// Backoff schedule for repeated attempts.
///
/// There is no attempt limit: a resync request is repeated until data
/// control accepts it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double the delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::data_control()
    }
}

impl RetryConfig {
    /// Snapshot sync re-requests: forever, 500ms doubling up to 30s.
    ///
    /// # Schedule
    ///
    /// ```text
    /// Reschedule  Delay
    /// ----------  -----
    /// 1           500ms
    /// 2           1s
    /// 3           2s
    /// ...
    /// 7+          30s (cap)
    /// ```
    pub fn data_control() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Fixed short interval for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            backoff_factor: 1.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so huge attempt counts cannot overflow powi.
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket parameters: `refill_rate` tokens per second, up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 messages/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Tight limit for constrained WAN links.
    pub fn conservative() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 100,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter for outgoing messages.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Returns `true` if a permit was available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// One permit per message of a batch.
    pub async fn acquire_many(&self, n: u32) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (in-flight window)
// =============================================================================

/// Error when the bulkhead is closed or full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many operations may be outstanding at once.
///
/// Log-entry sync holds one permit per message that is sent but not yet
/// acknowledged, which makes the bulkhead the sender's in-flight window.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Window for `max_in_flight` unacknowledged messages (at least one).
    pub fn for_in_flight(max_in_flight: usize) -> Self {
        Self::new(max_in_flight.max(1))
    }

    /// Wait for a slot. Fails only if the bulkhead was closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent - self.available()
    }

    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Reject all waiters; used when a sync session is torn down.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
