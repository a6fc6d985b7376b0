//! Rate-limit aware retries.
//!
//! [`RetryWithDelay`] wraps one remote call and repeats it for as long as the
//! remote answers `429 Too Many Requests`, sleeping for the server's
//! `retry-after` hint capped at a configured maximum.

use std::future::Future;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;

use crate::config::DEFAULT_MAX_RETRY_DELAY_SECS;

/// HTTP status signalling that the caller is rate limited.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Response that can tell whether it was rate limited.
pub trait RateLimitedResponse {
    fn status_code(&self) -> u16;

    /// Raw `retry-after` header value, if present.
    fn retry_after(&self) -> Option<&str>;

    fn is_rate_limited(&self) -> bool {
        self.status_code() == TOO_MANY_REQUESTS
    }
}

impl RateLimitedResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn retry_after(&self) -> Option<&str> {
        self.headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
    }
}

/// Progress of one wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Retries performed so far.
    pub attempt: u32,
    /// Total time slept across retries.
    pub elapsed: Duration,
    pub max_delay: Duration,
}

/// Retries rate-limited calls with a bounded delay per attempt.
///
/// There is no cap on the number of attempts; each wait is bounded by
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWithDelay {
    max_delay: Duration,
}

impl Default for RetryWithDelay {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS))
    }
}

impl RetryWithDelay {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the next attempt for a given `retry-after` header value.
    ///
    /// The hint is clamped to `[0, max_delay]`. A missing or unparsable hint
    /// waits the full `max_delay`.
    pub fn delay_for(&self, retry_after: Option<&str>) -> Duration {
        match retry_after.and_then(|value| value.trim().parse::<i64>().ok()) {
            Some(secs) => Duration::from_secs(secs.max(0) as u64).min(self.max_delay),
            None => self.max_delay,
        }
    }

    /// Run `call` until it returns something other than a 429 response.
    ///
    /// Errors from `call` are returned unchanged and never retried.
    pub async fn run<R, E, F, Fut>(&self, mut call: F) -> Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: RateLimitedResponse,
    {
        let mut state = RetryState {
            attempt: 0,
            elapsed: Duration::ZERO,
            max_delay: self.max_delay,
        };

        loop {
            let response = call().await?;
            if !response.is_rate_limited() {
                return Ok(response);
            }

            let delay = self.delay_for(response.retry_after());
            state.attempt += 1;
            state.elapsed += delay;

            log::info!(
                "Rate limited (status {}), retry attempt {} in {}s",
                response.status_code(),
                state.attempt,
                delay.as_secs()
            );

            tokio::time::sleep(delay).await;
        }
    }
}

/// Bounded exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
