//! Bounded retry policy.
//!
//! Every retry loop in the layer store (mount lookups, loop-device unmounts,
//! registry fetches) goes through a [`RetryPolicy`], so no operation can spin
//! forever.

use std::future::Future;
use std::time::Duration;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same interval after every failed attempt.
    Fixed(Duration),
    /// Doubling interval, starting at `initial` and capped at `max`.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound for any single delay.
        max: Duration,
    },
}

/// A retry policy with a fixed attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Retry immediately, up to `max_attempts` times.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    /// Retry with a fixed interval.
    #[must_use]
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(interval),
        }
    }

    /// Retry with a doubling interval.
    #[must_use]
    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Mirrors a timeout/polling-interval pair: `timeout / interval` attempts.
    #[must_use]
    pub fn within(timeout: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            u32::try_from(timeout.as_nanos() / interval.as_nanos()).unwrap_or(u32::MAX)
        };
        Self::fixed(attempts.max(1), interval)
    }

    /// Delay to apply after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until it succeeds or the attempts are used up, returning the
    /// last error in the latter case.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub fn run<T, E>(&self, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(_) => {
                    let delay = self.delay_after(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Async flavour of [`RetryPolicy::run`].
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run_async<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(_) => {
                    let delay = self.delay_after(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_first_success() {
        let mut calls = 0;
        let result: Result<u32, &str> = RetryPolicy::immediate(5).run(|attempt| {
            calls += 1;
            if attempt == 2 { Ok(attempt) } else { Err("nope") }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);
    }

    #[test]
    fn returns_last_error_when_exhausted() {
        let mut calls = 0;
        let result: Result<(), String> = RetryPolicy::immediate(3).run(|attempt| {
            calls += 1;
            Err(format!("failure {attempt}"))
        });
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _: Result<(), ()> = RetryPolicy::immediate(0).run(|_| {
            calls += 1;
            Err(())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn within_divides_timeout_by_interval() {
        let policy = RetryPolicy::within(Duration::from_secs(2), Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
        assert_eq!(policy.delay_after(4), Duration::from_millis(50));
        assert_eq!(policy.delay_after(30), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn async_retries_with_interval() {
        let mut calls = 0;
        let result: Result<(), &str> = RetryPolicy::fixed(3, Duration::from_secs(1))
            .run_async(|_| {
                calls += 1;
                async { Err("down") }
            })
            .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls, 3);
    }
}
