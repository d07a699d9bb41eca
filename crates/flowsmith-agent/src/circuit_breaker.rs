//! Circuit breaker for the chat backend
//!
//! After `threshold` consecutive failures the breaker opens and calls are
//! rejected without touching the network until `timeout` has elapsed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls allowed
    Closed,
    /// Too many failures, calls rejected
    Open,
    /// Timeout elapsed, the next call probes recovery
    HalfOpen,
}

/// Lock-free failure counter with a recovery timeout
///
/// ```
/// use flowsmith_agent::CircuitBreaker;
///
/// let cb = CircuitBreaker::new(2, 60);
/// cb.record_failure();
/// cb.record_failure();
/// assert!(!cb.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64,
    threshold: u32,
    timeout: Duration,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout_secs: u64) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            threshold: threshold.max(1),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }
        if self.elapsed_since_failure() >= self.timeout.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn can_execute(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Milliseconds until a probe is allowed, 0 unless open
    pub fn time_until_retry(&self) -> u64 {
        match self.state() {
            CircuitState::Open => {
                (self.timeout.as_millis() as u64).saturating_sub(self.elapsed_since_failure())
            }
            _ => 0,
        }
    }

    fn elapsed_since_failure(&self) -> u64 {
        now_millis().saturating_sub(self.last_failure_ms.load(Ordering::Relaxed))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}
