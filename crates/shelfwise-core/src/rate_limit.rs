//! Fixed-window rate limiting.
//!
//! The limiter is passed in by the caller. Time comes from a [`Clock`],
//! so tests advance it by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until the window resets. Set only when refused.
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }
}

/// Counts requests per key and refuses once `max` is reached within
/// `window`. A refused check does not count.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str, window: Duration, max: u32) -> RateDecision;
}

struct Window {
    count: u32,
    expires_at_ms: u64,
}

pub struct InMemoryRateLimiter<C: Clock = SystemClock> {
    clock: C,
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimiter<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemoryRateLimiter<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryRateLimiter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live windows (after the last purge).
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_now(&self, key: &str, window: Duration, max: u32) -> RateDecision {
        let now = self.clock.now_ms();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|_, w| w.expires_at_ms > now);

        match windows.get_mut(key) {
            Some(w) if w.count >= max => RateDecision {
                allowed: false,
                retry_after_secs: Some((w.expires_at_ms - now).div_ceil(1000)),
            },
            Some(w) => {
                w.count += 1;
                RateDecision::allow()
            }
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        expires_at_ms: now + window.as_millis() as u64,
                    },
                );
                RateDecision::allow()
            }
        }
    }
}

#[async_trait]
impl<C: Clock> RateLimiter for InMemoryRateLimiter<C> {
    async fn check(&self, key: &str, window: Duration, max: u32) -> RateDecision {
        self.check_now(key, window, max)
    }
}
