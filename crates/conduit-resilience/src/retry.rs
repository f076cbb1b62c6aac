//! Error classification and exponential backoff.
//!
//! The engine never retries plugin units itself: units are arbitrary code
//! and only their callers know whether an operation is idempotent. This
//! module answers the two questions those callers need: "is this error
//! worth retrying?" and "how long should I wait?".

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection, DNS, socket or timeout failure.
    Network,
    /// Upstream overload, 429 or 5xx.
    TemporaryApiError,
    /// Malformed response that a second attempt may not reproduce.
    ParseError,
    /// Output rejected by a validator.
    ValidationError,
    /// Bad or missing credentials.
    AuthenticationError,
    /// The request itself is wrong (4xx other than auth and rate limit).
    InvalidRequest,
    /// Rejected by a domain rule.
    BusinessLogicError,
    /// Nothing matched.
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::TemporaryApiError | Self::ParseError
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::TemporaryApiError => "temporary_api_error",
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::AuthenticationError => "authentication_error",
            Self::InvalidRequest => "invalid_request",
            Self::BusinessLogicError => "business_logic_error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of classifying an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Category that matched.
    pub category: ErrorCategory,
    /// Whether a retry can help.
    pub should_retry: bool,
    /// Full error message including sources.
    pub message: String,
    /// Validator feedback, passed through for callers that re-prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const AUTH_CODES: [&str; 2] = ["401", "403"];
const AUTH_WORDS: [&str; 6] = [
    "unauthorized",
    "unauthorised",
    "forbidden",
    "authentication",
    "invalid api key",
    "invalid token",
];

const TEMPORARY_CODES: [&str; 5] = ["429", "500", "502", "503", "504"];
const TEMPORARY_WORDS: [&str; 7] = [
    "rate limit",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "overloaded",
    "temporarily",
    "try again later",
];

const NETWORK_WORDS: [&str; 10] = [
    "timed out",
    "timeout",
    "connection",
    "econnreset",
    "econnrefused",
    "network",
    "dns",
    "socket",
    "broken pipe",
    "unreachable",
];

const INVALID_REQUEST_CODES: [&str; 4] = ["400", "404", "405", "422"];
const INVALID_REQUEST_WORDS: [&str; 4] = [
    "bad request",
    "invalid request",
    "invalid argument",
    "not found",
];

const PARSE_WORDS: [&str; 6] = [
    "parse",
    "json",
    "deserializ",
    "unexpected token",
    "malformed",
    "eof while",
];

const VALIDATION_WORDS: [&str; 3] = ["validation", "schema", "constraint"];

const BUSINESS_WORDS: [&str; 5] = [
    "business rule",
    "policy",
    "not allowed",
    "quota exceeded",
    "insufficient",
];

/// Classify an error by walking its `source()` chain.
///
/// I/O errors with a network-like kind anywhere in the chain are
/// [`ErrorCategory::Network`]; otherwise the joined message is matched
/// against status codes and keywords. Supplying `validation_feedback`
/// forces [`ErrorCategory::ValidationError`].
#[must_use]
pub fn classify(
    error: &(dyn StdError + 'static),
    validation_feedback: Option<&str>,
) -> Classification {
    let mut parts = vec![error.to_string()];
    let mut io_network = is_network_io(error);
    let mut current = error.source();
    while let Some(source) = current {
        io_network |= is_network_io(source);
        parts.push(source.to_string());
        current = source.source();
    }
    let message = parts.join(": ");

    if io_network && validation_feedback.is_none() {
        return build(ErrorCategory::Network, message, None);
    }
    classify_message(&message, validation_feedback)
}

/// Classify a bare error message.
#[must_use]
pub fn classify_message(message: &str, validation_feedback: Option<&str>) -> Classification {
    let category = match validation_feedback {
        Some(_) => ErrorCategory::ValidationError,
        None => category_for(message),
    };
    build(
        category,
        message.to_owned(),
        validation_feedback.map(str::to_owned),
    )
}

fn build(category: ErrorCategory, message: String, feedback: Option<String>) -> Classification {
    debug!(%category, "classified error");
    Classification {
        category,
        should_retry: category.is_retryable(),
        message,
        feedback,
    }
}

fn category_for(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has_code = |codes: &[&str]| codes.iter().any(|code| tokens.contains(code));
    let has_word = |words: &[&str]| words.iter().any(|word| lower.contains(word));

    if has_code(&AUTH_CODES) || has_word(&AUTH_WORDS) {
        ErrorCategory::AuthenticationError
    } else if has_code(&TEMPORARY_CODES) || has_word(&TEMPORARY_WORDS) {
        ErrorCategory::TemporaryApiError
    } else if has_word(&NETWORK_WORDS) {
        ErrorCategory::Network
    } else if has_code(&INVALID_REQUEST_CODES) || has_word(&INVALID_REQUEST_WORDS) {
        ErrorCategory::InvalidRequest
    } else if has_word(&PARSE_WORDS) {
        ErrorCategory::ParseError
    } else if has_word(&VALIDATION_WORDS) {
        ErrorCategory::ValidationError
    } else if has_word(&BUSINESS_WORDS) {
        ErrorCategory::BusinessLogicError
    } else {
        ErrorCategory::Unknown
    }
}

fn is_network_io(error: &(dyn StdError + 'static)) -> bool {
    use std::io::ErrorKind;

    error.downcast_ref::<std::io::Error>().is_some_and(|io| {
        matches!(
            io.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::AddrNotAvailable
        )
    })
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay for attempt 0.
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Symmetric multiplicative jitter ratio in `[0.0, 1.0]`.
    #[serde(default)]
    pub jitter_ratio: f64,
}

impl RetryConfig {
    /// Create a config without jitter.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter_ratio: 0.0,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_ratio: 0.0,
        }
    }

    /// Set the jitter ratio, clamped to `[0.0, 1.0]`.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30), 2.0).with_jitter(0.1)
    }
}

/// Backoff delay for `attempt` (0-based) with random jitter.
#[must_use]
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let random = if config.jitter_ratio > 0.0 {
        rand::random::<f64>()
    } else {
        0.5
    };
    compute_delay_with(attempt, config, random)
}

/// Backoff delay for `attempt` using `random` in `[0.0, 1.0]` as the jitter
/// sample. `0.5` yields the un-jittered delay.
///
/// The base delay is `min(max_delay, initial_delay * multiplier^attempt)`;
/// jitter then scales it into `[base * (1 - r), base * (1 + r)]`.
#[must_use]
pub fn compute_delay_with(attempt: u32, config: &RetryConfig, random: f64) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let cap = config.max_delay.as_secs_f64();
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let growth = config.backoff_multiplier.max(1.0).powi(exponent);

    let base = (initial * growth).min(cap);

    let ratio = config.jitter_ratio.clamp(0.0, 1.0);
    let sample = if random.is_finite() {
        random.clamp(0.0, 1.0)
    } else {
        0.5
    };
    let factor = 1.0 - ratio + 2.0 * ratio * sample;

    Duration::try_from_secs_f64(base * factor).unwrap_or(config.max_delay)
}

/// Outcome of [`retry`].
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// Returned value.
        value: T,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The operation failed and was not retried further.
    Failed {
        /// Last error.
        error: E,
        /// Attempts used.
        attempts: u32,
        /// Classification of the last error.
        classification: Classification,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Convert into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the last error if the operation never succeeded.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }

    /// Number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, its error is classified as not
/// retryable, or `max_attempts` is reached. The closure receives the
/// 0-based attempt number.
///
/// # Example
///
/// ```rust
/// use conduit_resilience::{RetryConfig, retry::retry};
///
/// # async fn example() {
/// let outcome = retry(&RetryConfig::no_retry(), |_attempt| async {
///     Ok::<_, std::io::Error>("done")
/// })
/// .await;
/// assert_eq!(outcome.into_result().unwrap(), "done");
/// # }
/// ```
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> RetryOutcome<T, E>
where
    E: StdError + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt.saturating_add(1),
                };
            },
            Err(error) => {
                let classification = classify(&error, None);
                let attempts = attempt.saturating_add(1);
                if !classification.should_retry || attempts >= config.max_attempts {
                    return RetryOutcome::Failed {
                        error,
                        attempts,
                        classification,
                    };
                }

                let delay = compute_delay(attempt, config);
                debug!(
                    attempt = attempts,
                    category = %classification.category,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt = attempts;
            },
        }
    }
}
