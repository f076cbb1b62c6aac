//! Per-resource circuit breaker.
//!
//! Each distinct resource name gets its own [`CircuitState`] machine,
//! created lazily on first use:
//!
//! - **Closed**: every call passes. Consecutive failures or the overall
//!   failure ratio above threshold open the circuit.
//! - **Open**: calls are rejected without being invoked until
//!   `open_timeout` has elapsed since the last failure.
//! - **HalfOpen**: up to `half_open_trial_count` calls are admitted. Any
//!   failure reopens; `success_threshold_to_close` successes close.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit rejected the call; the operation was not invoked.
    #[error("circuit open")]
    Open {
        /// Resource whose circuit is open.
        resource: String,
    },
    /// The operation ran and failed. The error is passed through unchanged.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected by the breaker.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Circuit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls pass.
    HalfOpen,
}

/// Thresholds shared by every circuit of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Failure ratio (`failed / total`) that opens a closed circuit.
    pub failure_rate_threshold: f64,
    /// Requests needed before the ratio is considered.
    pub minimum_requests_for_rate: u32,
    /// Time after the last failure before an open circuit admits trials.
    pub open_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_trial_count: u32,
    /// Trial successes that close the circuit.
    pub success_threshold_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            minimum_requests_for_rate: 10,
            open_timeout: Duration::from_secs(30),
            half_open_trial_count: 3,
            success_threshold_to_close: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the consecutive failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the open timeout.
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set half-open trial count and close threshold together.
    #[must_use]
    pub fn with_half_open(mut self, trials: u32, successes_to_close: u32) -> Self {
        self.half_open_trial_count = trials.max(1);
        self.success_threshold_to_close = successes_to_close.clamp(1, self.half_open_trial_count);
        self
    }

    /// Set the failure ratio threshold and the minimum sample size.
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64, minimum_requests: u32) -> Self {
        self.failure_rate_threshold = rate;
        self.minimum_requests_for_rate = minimum_requests;
        self
    }
}

/// Snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Current position.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub failures: u32,
    /// Trial successes while half-open.
    pub successes: u32,
    /// Calls completed since the circuit last closed.
    pub total_requests: u32,
    /// Failed calls since the circuit last closed.
    pub failed_requests: u32,
    /// Time since the last failure.
    pub since_last_failure: Option<Duration>,
    /// Time since the last state change.
    pub since_state_change: Duration,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    total_requests: u32,
    failed_requests: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    trials_admitted: u32,
    trials_completed: u32,
    /// Identifies the current half-open window.
    window: u64,
}

impl Circuit {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            total_requests: 0,
            failed_requests: 0,
            last_failure_time: None,
            last_state_change: now,
            trials_admitted: 0,
            trials_completed: 0,
            window: 0,
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, now: Instant) {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.trials_admitted = 0;
        self.trials_completed = 0;
        self.successes = 0;

        match to {
            CircuitState::Open => {
                warn!(resource = name, ?from, failures = self.failures, "Circuit opened");
            },
            CircuitState::HalfOpen => {
                info!(resource = name, "Circuit half-open, admitting trial calls");
            },
            CircuitState::Closed => {
                self.failures = 0;
                self.total_requests = 0;
                self.failed_requests = 0;
                info!(resource = name, "Circuit closed");
            },
        }
    }

    fn failure_rate_exceeded(&self, config: &CircuitBreakerConfig) -> bool {
        if self.total_requests == 0 || self.total_requests < config.minimum_requests_for_rate {
            return false;
        }
        f64::from(self.failed_requests) / f64::from(self.total_requests)
            >= config.failure_rate_threshold
    }

    fn in_window(&self, window: u64) -> bool {
        self.state == CircuitState::HalfOpen && self.window == window
    }

    fn metrics(&self, now: Instant) -> CircuitMetrics {
        CircuitMetrics {
            state: self.state,
            failures: self.failures,
            successes: self.successes,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            since_last_failure: self.last_failure_time.map(|t| now.duration_since(t)),
            since_state_change: now.duration_since(self.last_state_change),
        }
    }
}

/// Admission ticket for one call. Dropping it without recording an outcome
/// (the call future was cancelled) hands a half-open trial slot back, but
/// only to the window that issued it.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    name: &'a str,
    trial: Option<u64>,
    recorded: bool,
}

impl Admission<'_> {
    fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.record(self.name, success, self.trial);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        if let Some(window) = self.trial
            && let Some(mut circuit) = self.breaker.circuits.get_mut(self.name)
            && circuit.in_window(window)
        {
            circuit.trials_admitted = circuit.trials_admitted.saturating_sub(1);
        }
    }
}

/// Circuit breaker keyed by resource name.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
    windows: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            windows: AtomicU64::new(0),
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under the circuit for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without invoking `operation` when the
    /// circuit rejects the call, or [`BreakerError::Inner`] with the
    /// operation's own error.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit(name) else {
            debug!(resource = name, "Call rejected by open circuit");
            return Err(BreakerError::Open {
                resource: name.to_owned(),
            });
        };

        let result = operation().await;
        admission.record(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Whether a call to `name` would be admitted right now. Does not
    /// consume a trial slot.
    #[must_use]
    pub fn would_admit(&self, name: &str) -> bool {
        let Some(circuit) = self.circuits.get(name) else {
            return true;
        };
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => circuit
                .last_failure_time
                .is_none_or(|t| t.elapsed() >= self.config.open_timeout),
            CircuitState::HalfOpen => circuit.trials_admitted < self.config.half_open_trial_count,
        }
    }

    fn admit<'a>(&'a self, name: &'a str) -> Option<Admission<'a>> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(name.to_owned())
            .or_insert_with(|| Circuit::new(now));

        if circuit.state == CircuitState::Open {
            let cooled = circuit
                .last_failure_time
                .is_none_or(|t| now.duration_since(t) >= self.config.open_timeout);
            if !cooled {
                return None;
            }
            circuit.transition(name, CircuitState::HalfOpen, now);
            circuit.window = self.windows.fetch_add(1, Ordering::Relaxed);
        }

        let trial = match circuit.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                if circuit.trials_admitted >= self.config.half_open_trial_count {
                    return None;
                }
                circuit.trials_admitted = circuit.trials_admitted.saturating_add(1);
                Some(circuit.window)
            },
            CircuitState::Open => return None,
        };

        Some(Admission {
            breaker: self,
            name,
            trial,
            recorded: false,
        })
    }

    fn record(&self, name: &str, success: bool, trial: Option<u64>) {
        let now = Instant::now();
        let Some(mut circuit) = self.circuits.get_mut(name) else {
            return;
        };

        circuit.total_requests = circuit.total_requests.saturating_add(1);
        if success {
            circuit.failures = 0;
        } else {
            circuit.failures = circuit.failures.saturating_add(1);
            circuit.failed_requests = circuit.failed_requests.saturating_add(1);
            circuit.last_failure_time = Some(now);
        }

        match circuit.state {
            CircuitState::Closed => {
                if !success
                    && (circuit.failures >= self.config.failure_threshold
                        || circuit.failure_rate_exceeded(&self.config))
                {
                    circuit.transition(name, CircuitState::Open, now);
                }
            },
            CircuitState::HalfOpen if trial.is_some_and(|w| circuit.window == w) => {
                circuit.trials_completed = circuit.trials_completed.saturating_add(1);
                if !success {
                    circuit.transition(name, CircuitState::Open, now);
                } else {
                    circuit.successes = circuit.successes.saturating_add(1);
                    if circuit.successes >= self.config.success_threshold_to_close {
                        circuit.transition(name, CircuitState::Closed, now);
                    } else if circuit.trials_completed >= self.config.half_open_trial_count {
                        circuit.last_failure_time = Some(now);
                        circuit.transition(name, CircuitState::Open, now);
                    }
                }
            },
            // Late result from a call admitted before the last transition.
            CircuitState::HalfOpen | CircuitState::Open => {},
        }
    }

    /// Current position of `name`'s circuit. Unknown names are closed.
    #[must_use]
    pub fn state(&self, name: &str) -> CircuitState {
        self.circuits
            .get(name)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    /// Snapshot of `name`'s circuit, if it has been used.
    #[must_use]
    pub fn metrics(&self, name: &str) -> Option<CircuitMetrics> {
        let now = Instant::now();
        self.circuits.get(name).map(|c| c.metrics(now))
    }

    /// Every known circuit and its position.
    #[must_use]
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Forget `name`'s circuit, returning it to closed. Returns whether it
    /// existed.
    pub fn reset(&self, name: &str) -> bool {
        let existed = self.circuits.remove(name).is_some();
        if existed {
            info!(resource = name, "Circuit reset");
        }
        existed
    }
}
