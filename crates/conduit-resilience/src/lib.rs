//! Conduit Resilience - failure isolation primitives.
//!
//! - [`CircuitBreaker`]: per-resource Closed/Open/HalfOpen state machine
//!   that gates calls to a misbehaving resource.
//! - [`RateLimiter`]: per-key window counter backed by a shared
//!   [`CounterStore`] with a process-local fallback.
//! - [`retry`](mod@retry): error classification and exponential backoff.
//!
//! All shared counters are mutated inside a single critical section with no
//! suspension point, so concurrent callers never lose updates.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod breaker;
pub mod rate_limit;
pub mod retry;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
};
pub use rate_limit::{
    CounterStore, MemoryCounterStore, RateLimitDecision, RateLimitPolicy, RateLimiter,
    StoreError, WindowCount,
};
pub use retry::{
    Classification, ErrorCategory, RetryConfig, RetryOutcome, classify, classify_message,
    compute_delay, compute_delay_with,
};
