use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::GatewayError;
use crate::metrics::UPSTREAM_FAILURES;
use crate::upstream::{FailureKind, UpstreamError};

/// Retry configuration for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included
    pub max_retries: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Ceiling for the doubled delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

// One failed attempt, as logged
#[derive(Debug, Clone, Copy)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub delay_before_next: Duration,
    pub kind: FailureKind,
}

// What the loop does after a failed attempt
enum Step {
    Backoff(UpstreamError),
    Fail(GatewayError),
    // unexpected failure on the last attempt, raised once the loop is left
    Exhausted(UpstreamError),
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    // doubled, never past `max_delay`
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.policy.max_delay)
    }

    fn step(&self, attempt: u32, delay: Duration, error: UpstreamError) -> Step {
        let attempts = self.policy.max_retries;
        if attempt + 1 < attempts {
            return Step::Backoff(error);
        }

        match error {
            UpstreamError::QuotaExceeded(_) => Step::Fail(GatewayError::rate_limited(
                format!("Rate limit exceeded after {} attempts", attempts),
                delay.as_secs(),
            )),
            UpstreamError::Service { .. } => Step::Fail(GatewayError::unavailable(format!(
                "API error after {} attempts: {}",
                attempts, error
            ))),
            UpstreamError::Unexpected(_) => Step::Exhausted(error),
        }
    }

    /// Runs `operation` until it succeeds or the attempts run out.
    ///
    /// The delay starts at `initial_delay` and doubles after every failed
    /// attempt up to `max_delay`; there is no sleep after the last attempt.
    /// Exhaustion always yields exactly one typed error: `RateLimit` for
    /// quota failures (with the delay then in effect as `retry_after`),
    /// `Service` 503 for upstream errors and `Service` 500 for anything else.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let attempts = self.policy.max_retries;
        let mut delay = self.policy.initial_delay;
        let mut unexpected = None;

        for attempt in 0..attempts {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            UPSTREAM_FAILURES
                .with_label_values(&[error.kind().as_str()])
                .inc();

            match self.step(attempt, delay, error) {
                Step::Fail(error) => return Err(error),
                Step::Exhausted(error) => {
                    unexpected = Some(error);
                    break;
                }
                Step::Backoff(error) => {
                    let record = RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_before_next: delay,
                        kind: error.kind(),
                    };
                    tracing::warn!(
                        attempt = record.attempt_number,
                        max_attempts = attempts,
                        delay_secs = record.delay_before_next.as_secs_f64(),
                        kind = record.kind.as_str(),
                        error = %error,
                        "upstream call failed, retrying"
                    );
                }
            }

            sleep(delay).await;
            delay = self.next_delay(delay);
        }

        Err(match unexpected {
            Some(error) => {
                GatewayError::internal(format!("Failed after {} attempts: {}", attempts, error))
            }
            None => GatewayError::internal(format!("Failed after {} attempts", attempts)),
        })
    }
}
