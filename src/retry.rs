//! One retry utility for every outbound call.
//!
//! Built on `backoff::future::retry_notify`: errors are split into transient
//! (retry) and permanent (give up now), and attempts are bounded, so a
//! failing collaborator costs at most [`RetryPolicy::worst_case_delay`] plus
//! the collaborators' own timeouts.

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Fixed(Duration),
    /// Doubles per retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Delay,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: Delay::Fixed(delay),
        }
    }

    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            delay: Delay::Exponential { initial, max },
        }
    }

    /// Delay slept before retry number `retry` (1-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match self.delay {
            Delay::Fixed(d) => d,
            Delay::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|retry| self.delay_before_retry(retry))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

struct AttemptBudget {
    policy: RetryPolicy,
    attempts_started: u32,
}

impl Backoff for AttemptBudget {
    fn reset(&mut self) {
        self.attempts_started = 1;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts_started >= self.policy.max_attempts {
            return None;
        }
        let wait = self.policy.delay_before_retry(self.attempts_started);
        self.attempts_started += 1;
        Some(wait)
    }
}

/// Runs `operation` under `policy`.
///
/// Non-retryable errors are returned untouched after the first failure.
/// When every attempt fails transiently the last error comes back wrapped in
/// [`Error::RetriesExhausted`].
pub async fn call<T, F, Fut>(label: &str, policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let budget = AttemptBudget {
        policy: *policy,
        attempts_started: 1,
    };
    let mut attempts = 0u32;

    let outcome = retry_notify(
        budget,
        || {
            attempts += 1;
            let attempt = operation();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, wait: Duration| {
            warn!(call = label, error = %e, retry_in_ms = wait.as_millis() as u64, "[Retry] attempt failed");
        },
    )
    .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => Err(Error::RetriesExhausted {
            label: label.to_string(),
            attempts,
            last: Box::new(e),
        }),
        Err(e) => Err(e),
    }
}
