//! Retry support for the network calls made while resolving credentials.
//!
//! - [`RateLimiter`]: adaptive token bucket fed with success/throttle samples.
//! - [`ExponentialBackoff`]: delay between attempts.
//! - [`RetryPolicy`]: ties both together around an async operation.

mod backoff;
pub use backoff::ExponentialBackoff;

mod rate_limiter;
pub use rate_limiter::Admission;
pub use rate_limiter::RateLimiter;
pub use rate_limiter::RateLimiterUpdateResponse;

mod policy;
pub use policy::RetryPolicy;
