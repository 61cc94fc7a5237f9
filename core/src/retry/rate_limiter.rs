//! Adaptive client-side rate limiter.
//!
//! The limiter stays out of the way until the service throttles us for the
//! first time. From then on every request takes a token from a bucket whose
//! refill rate follows a CUBIC curve: cut by [`BETA`] on each throttle, grown
//! back towards the last known good rate on success.

use crate::time::{Clock, SystemClock};
use crate::{Error, Result};
use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Floor for the refill rate, in tokens per second.
const MIN_FILL_RATE: f64 = 0.5;
const MIN_CAPACITY: f64 = 1.0;
/// Weight of the newest sample in the measured send rate.
const SMOOTH: f64 = 0.8;
/// How much to scale back after receiving a throttling response.
const BETA: f64 = 0.7;
/// Controls how aggressively we scale up after being throttled.
const SCALE_CONSTANT: f64 = 0.4;

/// Outcome of asking the limiter for permission to send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Send right away.
    Allowed,
    /// Send after waiting for the given duration. The tokens are already
    /// reserved, so the caller must not ask again before sending.
    Wait(Duration),
}

/// Rates after a sample has been recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterUpdateResponse {
    /// Smoothed rate at which requests have been sent, per second.
    pub measured_tx_rate: f64,
    /// Rate at which the bucket refills, per second.
    pub fill_rate: f64,
}

/// Adaptive token bucket shared by every attempt of a client.
///
/// Cloning is cheap and clones share the same state.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        f.debug_struct("RateLimiter")
            .field("enabled", &state.enabled)
            .field("fill_rate", &state.fill_rate)
            .field("measured_tx_rate", &state.measured_tx_rate)
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_timestamp: Option<f64>,
    enabled: bool,
    measured_tx_rate: f64,
    last_tx_rate_bucket: f64,
    request_count: u64,
    last_max_rate: f64,
    time_of_last_throttle: f64,
}

impl RateLimiter {
    /// Create a rate limiter driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create a rate limiter driven by the given clock.
    pub fn with_clock(clock: impl Clock) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        Self::with_shared_clock(clock)
    }

    /// Create a rate limiter that shares a clock with other components.
    pub fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        let now = seconds(clock.as_ref());
        Self {
            state: Arc::new(Mutex::new(State {
                fill_rate: MIN_FILL_RATE,
                max_capacity: f64::MAX,
                current_capacity: 0.0,
                last_timestamp: None,
                enabled: false,
                measured_tx_rate: 0.0,
                last_tx_rate_bucket: now.floor(),
                request_count: 0,
                last_max_rate: 0.0,
                time_of_last_throttle: now,
            })),
            clock,
        }
    }

    /// Ask for permission to send one request.
    pub fn acquire_token(&self) -> Admission {
        self.take(1.0)
    }

    /// Ask for permission to send a request that costs `amount` tokens.
    ///
    /// `amount` must be finite and not negative, anything else would corrupt
    /// the bucket.
    pub fn acquire(&self, amount: f64) -> Result<Admission> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::request_invalid(
                "rate limiter cost must be a finite, non-negative number",
            )
            .with_context(format!("amount: {amount}")));
        }
        Ok(self.take(amount))
    }

    fn take(&self, amount: f64) -> Admission {
        let now = seconds(self.clock.as_ref());
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.enabled {
            return Admission::Allowed;
        }

        state.refill(now);
        let admission = if amount > state.current_capacity {
            let wait = (amount - state.current_capacity) / state.fill_rate;
            debug!(
                "rate limiter delayed a request by {wait:.3}s: capacity {:.3}, fill rate {:.3}",
                state.current_capacity, state.fill_rate
            );
            Admission::Wait(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        } else {
            Admission::Allowed
        };

        state.current_capacity -= amount;
        admission
    }

    /// Record the outcome of a request.
    pub fn update_sample(&self, throttled: bool) -> RateLimiterUpdateResponse {
        let now = seconds(self.clock.as_ref());
        let mut state = self.state.lock().expect("lock poisoned");
        state.update(now, throttled);

        RateLimiterUpdateResponse {
            measured_tx_rate: state.measured_tx_rate,
            fill_rate: state.fill_rate,
        }
    }
}

impl State {
    fn refill(&mut self, now: f64) {
        if let Some(last) = self.last_timestamp {
            let fill_amount = (now - last) * self.fill_rate;
            self.current_capacity = f64::min(self.max_capacity, self.current_capacity + fill_amount);
        }
        self.last_timestamp = Some(now);
    }

    fn update_measured_rate(&mut self, now: f64) {
        let bucket = (now * 2.0).floor() / 2.0;
        self.request_count += 1;

        if bucket > self.last_tx_rate_bucket {
            let current_rate = self.request_count as f64 / (bucket - self.last_tx_rate_bucket);
            self.measured_tx_rate = current_rate * SMOOTH + self.measured_tx_rate * (1.0 - SMOOTH);
            self.request_count = 0;
            self.last_tx_rate_bucket = bucket;
        }
    }

    fn time_window(&self) -> f64 {
        ((self.last_max_rate * (1.0 - BETA)) / SCALE_CONSTANT).cbrt()
    }

    fn cubic_success(&self, now: f64) -> f64 {
        let dt = now - self.time_of_last_throttle - self.time_window();
        SCALE_CONSTANT * dt.powi(3) + self.last_max_rate
    }

    fn update(&mut self, now: f64, throttled: bool) {
        self.update_measured_rate(now);

        let calculated = if throttled {
            let rate = if self.enabled {
                f64::min(self.measured_tx_rate, self.fill_rate)
            } else {
                self.measured_tx_rate
            };

            self.last_max_rate = rate;
            self.time_of_last_throttle = now;
            if !self.enabled {
                debug!("rate limiter enabled after the first throttling response");
            }
            self.enabled = true;
            rate * BETA
        } else {
            self.cubic_success(now)
        };

        let new_rate = f64::min(calculated, 2.0 * self.measured_tx_rate);

        // Settle the bucket at the old rate before switching to the new one.
        self.refill(now);
        self.fill_rate = f64::max(new_rate, MIN_FILL_RATE);
        self.max_capacity = f64::max(new_rate, MIN_CAPACITY);
        self.current_capacity = f64::min(self.current_capacity, self.max_capacity);

        debug!(
            "rate limiter updated: fill rate {:.3}, max capacity {:.3}, measured rate {:.3}",
            self.fill_rate, self.max_capacity, self.measured_tx_rate
        );
    }
}

/// Clock reading as fractional unix seconds, millisecond precision.
fn seconds(clock: &dyn Clock) -> f64 {
    clock.now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn clock() -> ManualClock {
        ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    /// Send `n` successful requests, one every 100ms.
    fn warm_up(limiter: &RateLimiter, clock: &ManualClock, n: usize) -> Vec<f64> {
        (0..n)
            .map(|_| {
                clock.advance(Duration::from_millis(100));
                limiter.update_sample(false).measured_tx_rate
            })
            .collect()
    }

    #[test]
    fn test_disabled_until_first_throttle() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());

        for _ in 0..100 {
            assert_eq!(limiter.acquire_token(), Admission::Allowed);
        }
        warm_up(&limiter, &clock, 10);
        assert_eq!(limiter.acquire_token(), Admission::Allowed);
    }

    #[test]
    fn test_wait_after_throttle() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());

        // Nothing has been measured yet, so the rate collapses to the floor.
        let resp = limiter.update_sample(true);
        assert_eq!(resp.fill_rate, MIN_FILL_RATE);

        // Empty bucket refilling at 0.5 tokens/s needs 2s for one token.
        assert_eq!(
            limiter.acquire_token(),
            Admission::Wait(Duration::from_secs(2))
        );

        // The first token was reserved, so the second one takes another 2s.
        assert_eq!(
            limiter.acquire_token(),
            Admission::Wait(Duration::from_secs(4))
        );

        clock.advance(Duration::from_secs(6));
        assert_eq!(limiter.acquire_token(), Admission::Allowed);
    }

    #[test]
    fn test_invalid_cost_is_rejected() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());
        limiter.update_sample(true);

        for amount in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1.0] {
            let err = limiter.acquire(amount).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::RequestInvalid);
        }

        // The bucket is untouched, so the limiter still rations tokens.
        assert_eq!(
            limiter.acquire_token(),
            Admission::Wait(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_huge_cost_saturates_wait() {
        let limiter = RateLimiter::with_clock(clock());
        limiter.update_sample(true);

        assert_eq!(limiter.acquire(1e300).unwrap(), Admission::Wait(Duration::MAX));
    }

    #[test]
    fn test_measured_rate_never_decreases_on_success() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());

        let rates = warm_up(&limiter, &clock, 40);
        for pair in rates.windows(2) {
            assert!(pair[1] >= pair[0], "measured rate dropped: {pair:?}");
        }

        // Ten requests per second, smoothed.
        let last = *rates.last().unwrap();
        assert!(last > 9.9 && last <= 10.0, "unexpected measured rate {last}");
    }

    #[test]
    fn test_fill_rate_strictly_decreases_on_throttle() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());
        warm_up(&limiter, &clock, 40);

        let mut previous = f64::MAX;
        for _ in 0..6 {
            clock.advance(Duration::from_millis(100));
            let resp = limiter.update_sample(true);
            assert!(
                resp.fill_rate < previous,
                "fill rate {} did not drop below {previous}",
                resp.fill_rate
            );
            previous = resp.fill_rate;
        }

        // Roughly 10 * 0.7^6.
        assert!((previous - 1.176).abs() < 0.01, "unexpected fill rate {previous}");

        for _ in 0..20 {
            clock.advance(Duration::from_millis(100));
            limiter.update_sample(true);
        }
        clock.advance(Duration::from_millis(100));
        assert_eq!(limiter.update_sample(true).fill_rate, MIN_FILL_RATE);
    }

    #[test]
    fn test_recovers_after_throttle() {
        let clock = clock();
        let limiter = RateLimiter::with_clock(clock.clone());
        warm_up(&limiter, &clock, 40);

        clock.advance(Duration::from_millis(100));
        let throttled = limiter.update_sample(true).fill_rate;

        // The cubic curve climbs back towards the pre-throttle rate.
        let rates = warm_up(&limiter, &clock, 30);
        let recovered = *rates.last().unwrap();
        assert!(recovered > 0.0);
        clock.advance(Duration::from_millis(100));
        assert!(limiter.update_sample(false).fill_rate > throttled);
    }
}
