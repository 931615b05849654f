//! Poll intervals and bounded retries

use std::time::Duration;

use super::cancel::CancellationToken;
use crate::config::{PollPolicy, RetryPolicy};

/// Growing poll interval: starts at the minimum, multiplies after every
/// step and saturates at the maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            current: policy.min_interval(),
            min: policy.min_interval(),
            max: policy.max_interval(),
            multiplier: policy.multiplier,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.clamp(self.min, self.max));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Why a retried operation gave up
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryError<E> {
    /// The token fired while waiting for the next attempt
    Cancelled,
    /// Permanent error, or the last error once attempts ran out
    Failed(E),
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or the
/// token is cancelled.
pub(crate) fn retry<T, E, F>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_transient(&e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                if cancel.wait(delay) {
                    tracing::debug!(operation = what, error = %e, "retry abandoned on cancellation");
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = PollPolicy {
            min_interval_ms: 100,
            max_interval_ms: 300,
            multiplier: 2.0,
            ..Default::default()
        };
        let delays: Vec<u128> = Backoff::new(&policy).take(4).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn test_backoff_never_below_minimum() {
        let policy = PollPolicy {
            min_interval_ms: 50,
            max_interval_ms: 50,
            multiplier: 1.0,
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);
        assert!(backoff.by_ref().take(5).all(|d| d == Duration::from_millis(50)));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_saturates_on_overflow() {
        let policy = PollPolicy {
            min_interval_ms: 1,
            max_interval_ms: u64::MAX,
            multiplier: 1e300,
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);
        let last = backoff.by_ref().take(3).last().unwrap();
        assert_eq!(last, policy.max_interval());
        assert_eq!(backoff.next_delay(), policy.max_interval());
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_retry_until_success() {
        let mut calls = 0;
        let result: Result<u32, RetryError<String>> = retry(&fast(), &CancellationToken::new(), "op", |_| true, || {
            calls += 1;
            if calls < 3 {
                Err("flaky".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_retry_gives_up() {
        let mut calls = 0;
        let result: Result<(), RetryError<String>> = retry(&fast(), &CancellationToken::new(), "op", |_| true, || {
            calls += 1;
            Err(format!("attempt {}", calls))
        });
        assert_eq!(result, Err(RetryError::Failed("attempt 3".to_string())));
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut calls = 0;
        let result: Result<(), RetryError<String>> = retry(&fast(), &CancellationToken::new(), "op", |_| false, || {
            calls += 1;
            Err("denied".to_string())
        });
        assert_eq!(result, Err(RetryError::Failed("denied".to_string())));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_cancel_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let mut calls = 0;
        let result: Result<(), RetryError<String>> = retry(&fast(), &token, "op", |_| true, || {
            calls += 1;
            Err("flaky".to_string())
        });
        assert_eq!(calls, 1);
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
