//! Bounded retry with exponential backoff.
//!
//! One combinator shared by the Pipedrive client (per HTTP call) and by
//! activity replication (per whole operation). The caller supplies the
//! operation and a classifier; the combinator owns the attempt counting
//! and the delay math.
//!
//! ```text
//! backoff(attempt) = min(base_delay × 2^(attempt − 1), max_delay)
//! ```
//!
//! With `max_retries = 3` an operation that keeps failing transiently runs
//! exactly four times.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Give up and return this error.
    Stop,
    /// Retry after the policy's exponential backoff.
    Backoff,
    /// Retry after a server-provided delay.
    After(Duration),
}

/// Final result of [`retry_with_backoff`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// 1-based number of the attempt that produced `result`.
    pub attempts: u32,
    /// Total time slept between attempts.
    pub waited: Duration,
}

/// Run `op(attempt)` until it succeeds, `classify` says stop, or the
/// policy's attempts are used up.
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    mut classify: C,
    mut op: Op,
) -> RetryOutcome<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryDirective,
{
    let max_attempts = policy.max_attempts();
    let mut waited = Duration::ZERO;
    let mut attempt = 1;

    loop {
        let result = op(attempt).await;
        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    waited,
                }
            }
            Err(err) => err,
        };

        let delay = match classify(&err) {
            RetryDirective::Stop => None,
            RetryDirective::Backoff => Some(policy.backoff(attempt)),
            RetryDirective::After(delay) => Some(delay),
        };

        match delay {
            Some(delay) if attempt < max_attempts => {
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                waited += delay;
                attempt += 1;
            }
            _ => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    waited,
                }
            }
        }
    }
}
