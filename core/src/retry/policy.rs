use super::{Admission, ExponentialBackoff, RateLimiter};
use crate::{Error, Result};
use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// RetryPolicy runs an operation until it succeeds, fails for good, or runs
/// out of attempts.
///
/// - Only errors marked [`Error::is_retryable`] are retried.
/// - Before every attempt the optional [`RateLimiter`] is consulted, and its
///   admission wait is honoured.
/// - Every outcome is reported back to the limiter, with throttling errors
///   counted as throttles.
/// - Every wait is bounded by the overall timeout and by the caller's
///   cancellation future. Losing either race yields a `Timeout` error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: ExponentialBackoff,
    rate_limiter: Option<RateLimiter>,
    timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: ExponentialBackoff::default(),
            rate_limiter: None,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default settings: 4 attempts, 100ms base backoff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts, including the first one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff between attempts.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Gate every attempt on the given rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Bound the time spent waiting between attempts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Total number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The rate limiter gating attempts, if any.
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Run `op` with retries.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_until(op, std::future::pending::<()>()).await
    }

    /// Run `op` with retries, giving up on any wait once `cancel` resolves.
    pub async fn run_until<T, F, Fut, C>(&self, mut op: F, cancel: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Some(limiter) = &self.rate_limiter {
                if let Admission::Wait(d) = limiter.acquire_token() {
                    wait(d, deadline, cancel.as_mut()).await?;
                }
            }

            let err = match op().await {
                Ok(v) => {
                    if let Some(limiter) = &self.rate_limiter {
                        limiter.update_sample(false);
                    }
                    return Ok(v);
                }
                Err(err) => err,
            };

            if let Some(limiter) = &self.rate_limiter {
                limiter.update_sample(err.is_throttled());
            }

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(err.with_context(format!(
                    "exceeded maximum number of retries, total attempts: {attempt}"
                )));
            }

            let delay = self.backoff.delay(attempt);
            debug!("attempt {attempt} failed with retryable error: {err}, retrying in {delay:?}");
            wait(delay, deadline, cancel.as_mut()).await?;
        }
    }
}

async fn wait<C>(d: Duration, deadline: Option<Instant>, cancel: Pin<&mut C>) -> Result<()>
where
    C: Future<Output = ()>,
{
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = expired => Err(Error::timeout("retry deadline exceeded while waiting")),
        _ = cancel => Err(Error::timeout("retry was cancelled while waiting")),
    }
}
