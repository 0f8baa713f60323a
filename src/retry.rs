//! Bounded retry with a fixed pause between attempts.
//!
//! Both commit paths (live block-commit + pivot, offline image commit) run
//! through [`with_retries`]; the operation decides per attempt whether a
//! failure may be retried or must stop the loop immediately.

use std::fmt::Display;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Pause after a failed attempt that will be retried.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Result of a single failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth trying again, if attempts remain.
    Retry(E),
    /// Further attempts cannot succeed.
    Abort(E),
}

/// Final classification once the loop gives up.
#[derive(Debug, PartialEq, Eq)]
pub enum Failure<E> {
    /// Every attempt failed with a retryable error; carries the last one.
    Exhausted(E),
    /// An attempt reported a non-retryable error.
    Aborted(E),
}

impl<E> Failure<E> {
    pub fn into_inner(self) -> E {
        match self {
            Failure::Exhausted(e) | Failure::Aborted(e) => e,
        }
    }
}

/// Run `op` until it succeeds, aborts, or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. `label` names the operation in
/// the log line emitted before each retry.
pub fn with_retries<T, E, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, Failure<E>>
where
    E: Display,
    F: FnMut(u32) -> Result<T, Attempt<E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(Attempt::Abort(e)) => return Err(Failure::Aborted(e)),
            Err(Attempt::Retry(e)) if attempt >= attempts => return Err(Failure::Exhausted(e)),
            Err(Attempt::Retry(e)) => {
                warn!(attempt, attempts, "{label}: {e}, retrying...");
                if !policy.backoff.is_zero() {
                    std::thread::sleep(policy.backoff);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn stops_after_configured_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(&instant(3), "commit", |_| {
            calls += 1;
            Err(Attempt::Retry("nope"))
        });
        assert_eq!(calls, 3);
        assert_eq!(result, Err(Failure::Exhausted("nope")));
    }

    #[test]
    fn success_on_second_attempt_stops_the_loop() {
        let mut seen = Vec::new();
        let result = with_retries(&instant(3), "commit", |attempt| {
            seen.push(attempt);
            if attempt == 2 { Ok(attempt) } else { Err(Attempt::Retry("flaky")) }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn abort_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(&instant(3), "commit", |_| {
            calls += 1;
            Err(Attempt::Abort("missing tool"))
        });
        assert_eq!(calls, 1);
        assert_eq!(result, Err(Failure::Aborted("missing tool")));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _: Result<(), Failure<&str>> = with_retries(&instant(0), "commit", |_| {
            calls += 1;
            Err(Attempt::Retry("x"))
        });
        assert_eq!(calls, 1);
    }
}
