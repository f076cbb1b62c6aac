//! Per-key request rate limiting.
//!
//! The preferred backend is a shared [`CounterStore`] that implements a
//! sliding window as one atomic operation. When the store fails or is not
//! configured, a process-local fixed-window counter answers instead. The
//! store is retried on every request, so recovery needs no intervention.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Allowed requests per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed in one window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }

    /// `n` requests per second.
    #[must_use]
    pub fn per_second(n: u32) -> Self {
        Self::new(n, Duration::from_secs(1))
    }

    /// `n` requests per minute.
    #[must_use]
    pub fn per_minute(n: u32) -> Self {
        Self::new(n, Duration::from_secs(60))
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

/// Answer to a [`RateLimiter::check_limit`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// When capacity is next restored.
    pub reset_at: DateTime<Utc>,
    /// How long a rejected caller should wait.
    pub retry_after: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

/// Errors from a [`CounterStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error.
    #[error("counter store error: {0}")]
    Backend(String),
}

/// State of a sliding window after one atomic hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Whether the hit was recorded.
    pub admitted: bool,
    /// Entries in the window, including this hit if admitted.
    pub count: u32,
    /// Timestamp (ms since epoch) of the oldest entry in the window.
    pub oldest_ms: Option<i64>,
}

/// Shared counter backend.
///
/// `hit_sliding_window` must be a single atomic step on the backend (a
/// transaction or pipelined script): prune entries older than
/// `now_ms - window_ms`, count the rest, and record `now_ms` only if the
/// count is below `max`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune, count and conditionally record in one step.
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max: u32,
    ) -> Result<WindowCount, StoreError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "counter-store"
    }
}

/// In-memory [`CounterStore`] keeping sorted timestamps per key.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with recorded hits.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max: u32,
    ) -> Result<WindowCount, StoreError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let hits = windows.entry(key.to_owned()).or_default();

        let cutoff = now_ms.saturating_sub(window_ms);
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }

        let current = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        let admitted = current < max;
        if admitted {
            hits.push_back(now_ms);
        }

        let count = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        let oldest_ms = hits.front().copied();
        if hits.is_empty() {
            windows.remove(key);
        }

        Ok(WindowCount {
            admitted,
            count,
            oldest_ms,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Local fallback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    start_ms: i64,
    window_ms: i64,
    count: u32,
}

impl LocalWindow {
    fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(self.window_ms)
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Default interval between sweeps of the local fallback table.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-key rate limiter.
pub struct RateLimiter {
    store: Option<Arc<dyn CounterStore>>,
    local: DashMap<String, LocalWindow>,
    degraded: AtomicBool,
    sweep_interval_ms: i64,
    last_sweep_ms: AtomicI64,
}

impl RateLimiter {
    /// Limiter backed by `store`, falling back to local counting.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::build(Some(store))
    }

    /// Limiter with only the local fixed-window counter.
    #[must_use]
    pub fn local_only() -> Self {
        Self::build(None)
    }

    fn build(store: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            store,
            local: DashMap::new(),
            degraded: AtomicBool::new(false),
            sweep_interval_ms: duration_ms(DEFAULT_SWEEP_INTERVAL),
            last_sweep_ms: AtomicI64::new(0),
        }
    }

    /// Set how often expired local entries are swept.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = duration_ms(interval);
        self
    }

    /// Whether the last request was answered by the local fallback
    /// because the shared store failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of keys tracked by the local fallback.
    #[must_use]
    pub fn local_key_count(&self) -> usize {
        self.local.len()
    }

    /// Count a request against `key`.
    pub async fn check_limit(&self, key: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_limit_at(key, policy, Utc::now()).await
    }

    /// Count a request against `key` as if it arrived at `now`.
    pub async fn check_limit_at(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let now_ms = now.timestamp_millis();

        if let Some(store) = &self.store {
            match store
                .hit_sliding_window(key, now_ms, policy.window_ms(), policy.max)
                .await
            {
                Ok(count) => {
                    if self.degraded.swap(false, Ordering::AcqRel) {
                        info!(store = store.name(), "Counter store recovered");
                    }
                    return sliding_decision(count, policy, now_ms);
                },
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::AcqRel) {
                        warn!(
                            store = store.name(),
                            error = %e,
                            "Counter store failed, using local rate limit fallback"
                        );
                    }
                },
            }
        }

        self.maybe_sweep(now_ms);
        self.check_local(key, policy, now_ms)
    }

    fn check_local(&self, key: &str, policy: RateLimitPolicy, now_ms: i64) -> RateLimitDecision {
        let window_ms = policy.window_ms();
        let mut entry = self
            .local
            .entry(key.to_owned())
            .or_insert(LocalWindow {
                start_ms: now_ms,
                window_ms,
                count: 0,
            });

        if now_ms >= entry.end_ms() || entry.window_ms != window_ms {
            *entry = LocalWindow {
                start_ms: now_ms,
                window_ms,
                count: 0,
            };
        }

        let allowed = entry.count < policy.max;
        if allowed {
            entry.count = entry.count.saturating_add(1);
        }

        let reset_ms = entry.end_ms();
        let remaining = policy.max.saturating_sub(entry.count);
        debug!(key, allowed, remaining, "Local rate limit check");

        RateLimitDecision {
            allowed,
            remaining,
            reset_at: from_ms(reset_ms, now_ms),
            retry_after: (!allowed).then(|| until(reset_ms, now_ms)),
        }
    }

    fn maybe_sweep(&self, now_ms: i64) {
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.sweep_interval_ms {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.sweep_local_at(now_ms);
        }
    }

    /// Remove expired local fallback entries. Returns how many were removed.
    pub fn sweep_local(&self) -> usize {
        self.sweep_local_at(Utc::now().timestamp_millis())
    }

    fn sweep_local_at(&self, now_ms: i64) -> usize {
        let before = self.local.len();
        self.local.retain(|_, w| w.end_ms() > now_ms);
        let removed = before.saturating_sub(self.local.len());
        if removed > 0 {
            debug!(removed, "Swept expired local rate limit windows");
        }
        removed
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.as_ref().map(|s| s.name().to_owned()))
            .field("local_keys", &self.local.len())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

fn sliding_decision(count: WindowCount, policy: RateLimitPolicy, now_ms: i64) -> RateLimitDecision {
    let reset_ms = count
        .oldest_ms
        .unwrap_or(now_ms)
        .saturating_add(policy.window_ms());
    RateLimitDecision {
        allowed: count.admitted,
        remaining: policy.max.saturating_sub(count.count),
        reset_at: from_ms(reset_ms, now_ms),
        retry_after: (!count.admitted).then(|| until(reset_ms, now_ms)),
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_ms(ms: i64, fallback_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms)
        .or_else(|| DateTime::from_timestamp_millis(fallback_ms))
        .unwrap_or_default()
}

fn until(reset_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(reset_ms.saturating_sub(now_ms)).unwrap_or(0))
}
