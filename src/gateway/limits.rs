//! Fixed-window counters and the token/cost rate limiters built on them.
//!
//! Every counter operation goes to the distributed backend first. When that fails
//! (or none is configured) the call is served from process-local counters and the
//! limiter enforces `limit / 10` instead, which bounds how far a single process can
//! overspend while the shared store is unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use super::Clock;

/// Limits are divided by this while serving from the local fallback.
pub const DEGRADED_LIMIT_DIVISOR: u64 = 10;

#[derive(Debug, Error)]
pub enum CounterError {
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter backend timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),
}

/// Fixed-window counter storage. Values are tokens or USD, carried as `f64`.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current window total, 0 when the entry is absent or expired.
    async fn get(&self, key: &str) -> Result<f64, CounterError>;

    /// Seconds until the entry expires, 0 when absent.
    async fn ttl(&self, key: &str) -> Result<u64, CounterError>;

    /// Adds `amount`, creating the entry with a `window_seconds` TTL when absent.
    /// Returns the new total.
    async fn incr(&self, key: &str, amount: f64, window_seconds: u64) -> Result<f64, CounterError>;

    /// Subtracts `amount`, flooring at 0. Never creates an entry.
    async fn decr_floor(&self, key: &str, amount: f64) -> Result<f64, CounterError>;
}

#[derive(Clone, Copy, Debug)]
struct LocalEntry {
    value: f64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct LocalState {
    entries: HashMap<String, LocalEntry>,
    last_gc_second: u64,
}

impl LocalState {
    fn gc(&mut self, now: u64) {
        if now != self.last_gc_second {
            self.entries.retain(|_, entry| entry.expires_at > now);
            self.last_gc_second = now;
        }
    }

    fn live_mut(&mut self, key: &str, now: u64) -> Option<&mut LocalEntry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }
}

/// Process-local window counters.
pub struct LocalCounters {
    state: Mutex<LocalState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCounters")
            .field("entries", &self.lock().entries.len())
            .finish()
    }
}

impl LocalCounters {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self, key: &str) -> f64 {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.lock();
        state.live_mut(key, now).map(|entry| entry.value).unwrap_or(0.0)
    }

    pub fn remaining_ttl(&self, key: &str) -> u64 {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.lock();
        state
            .live_mut(key, now)
            .map(|entry| entry.expires_at.saturating_sub(now))
            .unwrap_or(0)
    }

    pub fn add(&self, key: &str, amount: f64, window_seconds: u64) -> f64 {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.lock();
        state.gc(now);
        if state.live_mut(key, now).is_none() {
            state.entries.insert(
                key.to_string(),
                LocalEntry {
                    value: 0.0,
                    expires_at: now.saturating_add(window_seconds.max(1)),
                },
            );
        }
        let Some(entry) = state.entries.get_mut(key) else {
            return 0.0;
        };
        entry.value += amount;
        entry.value
    }

    pub fn subtract_floor(&self, key: &str, amount: f64) -> f64 {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.lock();
        let Some(entry) = state.live_mut(key, now) else {
            return 0.0;
        };
        entry.value = (entry.value - amount).max(0.0);
        entry.value
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.lock();
        state.gc(now);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterBackend for LocalCounters {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<f64, CounterError> {
        Ok(self.current(key))
    }

    async fn ttl(&self, key: &str) -> Result<u64, CounterError> {
        Ok(self.remaining_ttl(key))
    }

    async fn incr(&self, key: &str, amount: f64, window_seconds: u64) -> Result<f64, CounterError> {
        Ok(self.add(key, amount, window_seconds))
    }

    async fn decr_floor(&self, key: &str, amount: f64) -> Result<f64, CounterError> {
        Ok(self.subtract_floor(key, amount))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CounterReading {
    pub value: f64,
    /// Served by the local fallback rather than the distributed backend.
    pub degraded: bool,
}

/// Distributed-then-local counter façade shared by every limiter in a process.
pub struct FallbackCounters {
    primary: Option<Arc<dyn CounterBackend>>,
    local: LocalCounters,
    fallbacks: AtomicU64,
}

impl std::fmt::Debug for FallbackCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCounters")
            .field("primary", &self.primary.as_ref().map(|backend| backend.name()))
            .field("local", &self.local)
            .field("fallbacks", &self.fallback_count())
            .finish()
    }
}

impl FallbackCounters {
    pub fn new(primary: Option<Arc<dyn CounterBackend>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            primary,
            local: LocalCounters::new(clock),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn local_only(clock: Arc<dyn Clock>) -> Self {
        Self::new(None, clock)
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Operations served locally because the primary backend failed.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn local_entries(&self) -> usize {
        self.local.len()
    }

    fn note_fallback(&self, op: &'static str, key: &str, backend: &str, err: &CounterError) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            op,
            key,
            backend,
            error = %err,
            "counter backend unavailable, serving from local fallback"
        );
    }

    pub async fn get(&self, key: &str) -> CounterReading {
        if let Some(primary) = self.primary.as_ref() {
            match primary.get(key).await {
                Ok(value) => return CounterReading { value, degraded: false },
                Err(err) => self.note_fallback("get", key, primary.name(), &err),
            }
        }
        CounterReading {
            value: self.local.current(key),
            degraded: true,
        }
    }

    pub async fn ttl(&self, key: &str) -> u64 {
        if let Some(primary) = self.primary.as_ref() {
            match primary.ttl(key).await {
                Ok(ttl) => return ttl,
                Err(err) => self.note_fallback("ttl", key, primary.name(), &err),
            }
        }
        self.local.remaining_ttl(key)
    }

    pub async fn incr(&self, key: &str, amount: f64, window_seconds: u64) -> CounterReading {
        if let Some(primary) = self.primary.as_ref() {
            match primary.incr(key, amount, window_seconds).await {
                Ok(value) => return CounterReading { value, degraded: false },
                Err(err) => self.note_fallback("incr", key, primary.name(), &err),
            }
        }
        CounterReading {
            value: self.local.add(key, amount, window_seconds),
            degraded: true,
        }
    }

    pub async fn decr_floor(&self, key: &str, amount: f64) -> CounterReading {
        if let Some(primary) = self.primary.as_ref() {
            match primary.decr_floor(key, amount).await {
                Ok(value) => return CounterReading { value, degraded: false },
                Err(err) => self.note_fallback("decr", key, primary.name(), &err),
            }
        }
        CounterReading {
            value: self.local.subtract_floor(key, amount),
            degraded: true,
        }
    }
}

/// Amount a limiter counts: integer tokens or USD.
pub trait Quantity:
    Copy + PartialOrd + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
    const ZERO: Self;

    fn to_counter(self) -> f64;

    fn from_counter(value: f64) -> Self;

    fn plus(self, other: Self) -> Self;

    fn minus_floor(self, other: Self) -> Self;

    /// Limit enforced while degraded.
    fn degraded(self) -> Self;
}

impl Quantity for u64 {
    const ZERO: Self = 0;

    fn to_counter(self) -> f64 {
        self as f64
    }

    fn from_counter(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return 0;
        }
        value.round() as u64
    }

    fn plus(self, other: Self) -> Self {
        self.saturating_add(other)
    }

    fn minus_floor(self, other: Self) -> Self {
        self.saturating_sub(other)
    }

    fn degraded(self) -> Self {
        self / DEGRADED_LIMIT_DIVISOR
    }
}

impl Quantity for f64 {
    const ZERO: Self = 0.0;

    fn to_counter(self) -> f64 {
        self
    }

    fn from_counter(value: f64) -> Self {
        if !value.is_finite() {
            return 0.0;
        }
        value.max(0.0)
    }

    fn plus(self, other: Self) -> Self {
        self + other
    }

    fn minus_floor(self, other: Self) -> Self {
        (self - other).max(0.0)
    }

    fn degraded(self) -> Self {
        self / DEGRADED_LIMIT_DIVISOR as f64
    }
}

/// Fixed-window limiter over one counter namespace.
#[derive(Clone, Debug)]
pub struct RateLimiter<Q: Quantity> {
    counters: Arc<FallbackCounters>,
    limit: Q,
    window_seconds: u64,
}

pub type TokenRateLimiter = RateLimiter<u64>;
pub type CostRateLimiter = RateLimiter<f64>;

impl<Q: Quantity> RateLimiter<Q> {
    pub fn new(counters: Arc<FallbackCounters>, limit: Q, window_seconds: u64) -> Self {
        Self {
            counters,
            limit,
            window_seconds: window_seconds.max(1),
        }
    }

    pub fn limit(&self) -> Q {
        self.limit
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn effective_limit(&self, degraded: bool) -> Q {
        if degraded {
            self.limit.degraded()
        } else {
            self.limit
        }
    }

    pub async fn get_current(&self, key: &str) -> Q {
        Q::from_counter(self.counters.get(key).await.value)
    }

    pub async fn get_ttl(&self, key: &str) -> u64 {
        self.counters.ttl(key).await
    }

    pub async fn would_allow(&self, key: &str, amount: Q) -> bool {
        let reading = self.counters.get(key).await;
        Q::from_counter(reading.value).plus(amount) <= self.effective_limit(reading.degraded)
    }

    /// Charges `amount` unconditionally and reports whether the new total is within
    /// the limit.
    pub async fn consume(&self, key: &str, amount: Q) -> bool {
        let reading = self
            .counters
            .incr(key, amount.to_counter(), self.window_seconds)
            .await;
        let total = Q::from_counter(reading.value);
        let limit = self.effective_limit(reading.degraded);
        let allowed = total <= limit;
        tracing::debug!(
            key,
            amount = %amount,
            total = %total,
            limit = %limit,
            degraded = reading.degraded,
            allowed,
            "counter charged"
        );
        allowed
    }

    pub async fn release(&self, key: &str, amount: Q) {
        let reading = self.counters.decr_floor(key, amount.to_counter()).await;
        tracing::debug!(
            key,
            amount = %amount,
            total = reading.value,
            degraded = reading.degraded,
            "counter released"
        );
    }

    pub async fn get_remaining(&self, key: &str) -> Q {
        let reading = self.counters.get(key).await;
        self.effective_limit(reading.degraded)
            .minus_floor(Q::from_counter(reading.value))
    }
}
