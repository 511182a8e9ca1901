//! Connect-phase retry for the model endpoint.
//!
//! One concern, narrowly scoped: the POST that opens a model stream can hit
//! transient failures (connection refused, 429, 5xx) and is safe to
//! re-issue because no SSE bytes have been consumed yet.
//! [`retry_with_backoff`] re-runs such an operation under a
//! [`RetryPolicy`]: delays double per attempt up to a ceiling, with a
//! random additive spread so simultaneous conversations don't hammer the
//! endpoint in lockstep. Anything non-transient (a 4xx, a bad key) fails on
//! the first attempt, and nothing in the crate retries past the first
//! stream byte.
//!
//! # Examples
//!
//! ```rust,no_run
//! use page_audit::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .attempts(4)
//!     .base_delay(Duration::from_millis(500))
//!     .build()?;
//!
//! let opened = retry_with_backoff(policy, || async {
//!     open_stream().await
//! })
//! .await?;
//! # Ok(())
//! # }
//! # async fn open_stream() -> page_audit::Result<u32> { Ok(0) }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How [`retry_with_backoff`] paces its attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    ceiling: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Total tries, the first one included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the first retry; each later retry doubles it.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound the doubling never exceeds.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Fraction of the delay randomly added on top (`0.0..=1.0`).
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Pause before retry number `retry_index` (0 for the first retry).
    ///
    /// The configured delay acts as a floor: jitter only ever stretches the
    /// wait, up to `jitter` of the capped delay. Doubling is a saturating
    /// bit shift, so absurd retry indices cannot overflow.
    fn pause_before(&self, retry_index: u32) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << retry_index.min(20));
        let capped = doubled.min(self.ceiling);
        let spread = capped.mul_f64(rand::random::<f64>() * self.jitter);
        capped.saturating_add(spread)
    }
}

/// Builder for [`RetryPolicy`], validated at `build()`.
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    attempts: Option<u32>,
    base_delay: Option<Duration>,
    ceiling: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryPolicyBuilder {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Validate and construct.
    ///
    /// # Errors
    ///
    /// At least one attempt is required, and jitter must lie in
    /// `0.0..=1.0`.
    pub fn build(self) -> Result<RetryPolicy> {
        let defaults = RetryPolicy::default();

        let attempts = self.attempts.unwrap_or(defaults.attempts);
        if attempts == 0 {
            return Err(Error::config("retry attempts must be at least 1"));
        }

        let jitter = self.jitter.unwrap_or(defaults.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::config("retry jitter must be between 0.0 and 1.0"));
        }

        Ok(RetryPolicy {
            attempts,
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            ceiling: self.ceiling.unwrap_or(defaults.ceiling),
            jitter,
        })
    }
}

/// Run `operation` until it succeeds, a non-transient error appears, or
/// the policy's attempts run out.
///
/// Transience is decided by [`Error::is_transient`]; everything else is
/// returned to the caller untouched, with no pause burned on it.
pub async fn retry_with_backoff<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let final_attempt = policy.attempts().saturating_sub(1);

    for attempt in 0.. {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= final_attempt => return Err(err),
            Err(err) => {
                log::debug!(
                    "attempt {}/{} hit a transient error, retrying: {err}",
                    attempt + 1,
                    policy.attempts()
                );
                sleep(policy.pause_before(attempt)).await;
            }
        }
    }
    unreachable!("the final attempt always returns")
}
