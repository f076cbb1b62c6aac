use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline execution settings.
    pub engine: EngineSection,
    /// Background task settings.
    pub tasks: TasksSection,
    /// Circuit breaker policy applied to every unit.
    pub circuit_breaker: CircuitBreakerSection,
    /// Default rate limit policy.
    pub rate_limit: RateLimitSection,
    /// Backoff settings for callers that retry.
    pub retry: RetrySection,
    /// Log output.
    pub logging: LoggingSection,
    /// Notification channel.
    pub events: EventsSection,
}

// ---------------------------------------------------------------------------
// EngineSection
// ---------------------------------------------------------------------------

/// Pipeline execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Upper bound for a single unit invocation.
    pub unit_timeout_ms: u64,
    /// Upper bound for a service health probe.
    pub health_timeout_ms: u64,
    /// Whether an execution error moves a unit to the error status.
    pub pin_status_on_error: bool,
    /// How long shutdown waits for in-flight tasks before cancelling them.
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            unit_timeout_ms: 30_000,
            health_timeout_ms: 2_000,
            pin_status_on_error: true,
            shutdown_grace_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// TasksSection
// ---------------------------------------------------------------------------

/// Background task settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// Timeout applied when a dispatch does not set one. `0` means none.
    pub default_timeout_ms: u64,
    /// Age after which terminal tasks are swept.
    pub sweep_max_age_ms: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            sweep_max_age_ms: 3_600_000,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerSection
// ---------------------------------------------------------------------------

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failure ratio that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Requests required before the failure ratio is considered.
    pub minimum_requests_for_rate: u32,
    /// Time an open circuit waits before probing.
    pub open_timeout_ms: u64,
    /// Calls admitted while half-open.
    pub half_open_trial_count: u32,
    /// Half-open successes needed to close.
    pub success_threshold_to_close: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            minimum_requests_for_rate: 10,
            open_timeout_ms: 30_000,
            half_open_trial_count: 3,
            success_threshold_to_close: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitSection
// ---------------------------------------------------------------------------

/// Default rate limit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Window length.
    pub window_ms: u64,
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Minimum interval between sweeps of the local fallback table.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            sweep_interval_ms: 60_000,
        }
    }
}

// ---------------------------------------------------------------------------
// RetrySection
// ---------------------------------------------------------------------------

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Symmetric multiplicative jitter, `0.0` to disable.
    pub jitter_ratio: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level.
    pub level: String,
    /// `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Per-target directives.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventsSection
// ---------------------------------------------------------------------------

/// Notification channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Broadcast buffer size.
    pub channel_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}
