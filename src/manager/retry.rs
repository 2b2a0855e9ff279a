//! Retry logic with exponential backoff for manager API calls.
//!
//! Mirrors the shape of a classic download-retry policy: classify a failure,
//! decide whether another attempt is worthwhile, and if so how long to wait.
//! Here the thing being retried is an HTTP call to the media manager instead
//! of a file download, but the policy itself generalizes directly: transient
//! failures (timeouts, 5xx, 429) get exponential backoff with jitter; 4xx
//! (other than 429) and auth failures do not retry.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::error::ManagerError;

/// Default maximum attempts (including the initial attempt).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_JITTER: Duration = Duration::from_millis(250);

/// Classification of a manager-call failure for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed on retry: connection error, timeout, 5xx, or 429.
    Transient,
    /// Won't succeed regardless of retries.
    Permanent,
    /// The API key was rejected; retrying without fixing the key won't help.
    Unauthorized,
}

/// Decision on whether to retry a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the number of the next attempt.
    Retry { delay: Duration, attempt: u32 },
    /// Give up.
    DoNotRetry,
}

/// Classifies a [`ManagerError`] into a [`FailureClass`] for retry decisions.
#[must_use]
pub fn classify_error(error: &ManagerError) -> FailureClass {
    match error {
        ManagerError::Unauthorized { .. } => FailureClass::Unauthorized,
        ManagerError::NotFound { .. }
        | ManagerError::PermanentServerError { .. }
        | ManagerError::Malformed { .. }
        | ManagerError::Conflict { .. } => FailureClass::Permanent,
        ManagerError::Transient { .. } => FailureClass::Transient,
    }
}

/// Classifies a raw HTTP status code into a [`FailureClass`], for use before
/// the status has been turned into a [`ManagerError`].
///
/// | Status | Class |
/// |---|---|
/// | 401, 403 | Unauthorized |
/// | 404 | Permanent (benign for stale references, but not retryable) |
/// | 429 | Transient (honors `Retry-After` upstream) |
/// | other 4xx | Permanent |
/// | 5xx | Transient |
#[must_use]
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        401 | 403 => FailureClass::Unauthorized,
        429 => FailureClass::Transient,
        400..=499 => FailureClass::Permanent,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Exponential backoff policy with jitter, capped at a maximum delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit settings.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay, backoff_multiplier }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry, given the failure class and the attempt
    /// number that just failed (1-indexed). A server-supplied `retry_after`
    /// (from a 429's `Retry-After` header) overrides the computed backoff
    /// when present and larger.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(
        &self,
        class: FailureClass,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if class != FailureClass::Transient {
            return RetryDecision::DoNotRetry;
        }
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry;
        }

        let computed = self.calculate_delay(attempt);
        let delay = match retry_after {
            Some(server_delay) if server_delay > computed => server_delay,
            _ => computed,
        };

        RetryDecision::Retry { delay, attempt: attempt + 1 }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as f64;
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + jitter()
    }
}

fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Parses a `Retry-After` header value: either integer seconds or an
/// RFC 7231 HTTP-date. Returns `None` for anything else.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds as u64));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let now = std::time::SystemTime::now();
    match datetime.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}
