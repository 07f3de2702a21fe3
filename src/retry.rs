//! Retry delay curves and jitter.
//!
//! When a job's work action fails and the job still has retry budget, the
//! scheduler asks a [`RetryStrategy`] how long to wait before the job becomes
//! eligible again. The scheduler's own policy is a capped exponential curve with
//! proportional jitter:
//!
//! ```text
//! raw     = min(max_delay, base * multiplier^(attempt - 1))
//! delay   = raw - raw * ratio + uniform(0, raw * ratio)
//! ```
//!
//! With the default ratio of `0.5` the delay lands between half and all of the
//! raw backoff, which spreads out retries of jobs that failed together.
//!
//! # Examples
//!
//! ```rust
//! use batchwork::retry::{JitterType, RetryStrategy};
//! use std::time::Duration;
//!
//! let strategy = RetryStrategy::jittered_exponential(
//!     Duration::from_millis(100),
//!     2.0,
//!     Duration::from_secs(60),
//!     0.5,
//! );
//!
//! // Third attempt: raw backoff 400ms, jittered into [200ms, 400ms].
//! let delay = strategy.calculate_delay(3);
//! assert!(delay >= Duration::from_millis(200));
//! assert!(delay <= Duration::from_millis(400));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Types of jitter that can be applied to retry delays.
///
/// Jitter keeps jobs that failed at the same moment from all retrying at the
/// same moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JitterType {
    /// Add or subtract a random duration between 0 and the specified value.
    Additive(Duration),

    /// Multiply the delay by a random factor in `1 ± factor`.
    Multiplicative(f64),

    /// Keep the delay inside `[delay * (1 - ratio), delay]`.
    ///
    /// The delay is reduced by `delay * ratio` and a uniform random amount in
    /// `[0, delay * ratio]` is added back. Never exceeds the raw delay, so a
    /// capped curve stays capped.
    Proportional(f64),
}

impl JitterType {
    /// Apply jitter to a given delay duration. Never returns a negative delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs();
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor)).max(0.0);
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
            JitterType::Proportional(ratio) => {
                let ratio = ratio.clamp(0.0, 1.0);
                let window = delay.as_millis() as f64 * ratio;
                let kept = delay.as_millis() as f64 - window;
                let jittered_millis = kept + rng.gen_range(0.0..=window);
                Duration::from_millis(jittered_millis.round() as u64).min(delay)
            }
        }
    }
}

/// Strategies for the delay between a failed attempt and the next one.
///
/// `attempt` is 1-based: the delay scheduled after the first failed attempt is
/// `calculate_delay(1)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RetryStrategy {
    /// The same delay after every attempt.
    Fixed(Duration),

    /// `base + attempt * increment`, optionally capped.
    Linear {
        base: Duration,
        increment: Duration,
        max_delay: Option<Duration>,
    },

    /// `base * multiplier^(attempt - 1)`, optionally capped, then jittered.
    Exponential {
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: Option<JitterType>,
    },
}

impl RetryStrategy {
    /// Calculate the delay before the next attempt, jitter included.
    ///
    /// ```rust
    /// use batchwork::retry::RetryStrategy;
    /// use std::time::Duration;
    ///
    /// let strategy = RetryStrategy::exponential(
    ///     Duration::from_secs(1),
    ///     2.0,
    ///     Some(Duration::from_secs(60)),
    /// );
    ///
    /// assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
    /// assert_eq!(strategy.calculate_delay(4), Duration::from_secs(8));
    /// assert_eq!(strategy.calculate_delay(10), Duration::from_secs(60));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            RetryStrategy::Exponential {
                jitter: Some(jitter_type),
                ..
            } => jitter_type.apply(self.base_delay(attempt)),
            _ => self.base_delay(attempt),
        };

        // Ensure delay is never zero (minimum 1ms)
        delay.max(Duration::from_millis(1))
    }

    /// The delay curve before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,

            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => {
                let delay = *base + increment.mul_f64(attempt as f64);
                cap(delay, *max_delay)
            }

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                ..
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                let delay = if factor.is_finite() {
                    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                        .unwrap_or(Duration::MAX)
                } else {
                    Duration::MAX
                };
                cap(delay, *max_delay)
            }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed(delay)
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    /// Capped exponential backoff with [`JitterType::Proportional`] jitter.
    /// This is the curve the scheduler applies to failed attempts.
    pub fn jittered_exponential(
        base: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter_ratio: f64,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay: Some(max_delay),
            jitter: Some(JitterType::Proportional(jitter_ratio)),
        }
    }
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}
