/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

/// The smallest delay any backoff schedule will produce, regardless of
/// configuration.
pub const MIN_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// A reconnect backoff schedule.
///
/// `next_attempt_time` is consulted when a connection attempt starts: the
/// attempt's deadline is `max(next_attempt_time, now + min_connect_timeout)`,
/// and if the attempt fails, the retry timer fires at that same
/// `next_attempt_time`.  Each call advances the schedule.
pub trait Backoff: Send + Sync {
    /// Returns the earliest time the next connection attempt may finish or
    /// be retried, advancing the schedule.
    fn next_attempt_time(&self) -> Instant;

    /// Resets the schedule to its initial delay.
    fn reset(&self);

    /// The minimum time a single connection attempt is given to complete.
    fn min_connect_timeout(&self) -> Duration;
}

#[derive(Clone)]
pub struct BackoffConfig {
    /// The delay before the first retry.
    pub base_delay: Duration,

    /// The factor with which to multiply the delay after each failed retry.
    /// Must be at least 1.
    pub multiplier: f64,

    /// The factor with which delays are randomized, in [0, 1].
    pub jitter: f64,

    /// The upper bound on the delay.
    pub max_delay: Duration,

    /// The minimum time a single connection attempt is given to complete.
    pub min_connect_timeout: Duration,
}

/// The default schedule from the gRPC connection backoff specification.
pub const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
    min_connect_timeout: Duration::from_secs(20),
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffConfigError {
    #[error("base_delay must not exceed max_delay")]
    BaseExceedsMax,
    #[error("multiplier must be at least 1.0")]
    MultiplierTooSmall,
    #[error("jitter must be within [0, 1]")]
    JitterOutOfRange,
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), BackoffConfigError> {
        if self.base_delay > self.max_delay {
            return Err(BackoffConfigError::BaseExceedsMax);
        }
        if self.multiplier < 1.0 {
            return Err(BackoffConfigError::MultiplierTooSmall);
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BackoffConfigError::JitterOutOfRange);
        }
        Ok(())
    }

    // Every configured duration is floored at MIN_BACKOFF_STEP.
    fn floored(mut self) -> Self {
        self.base_delay = self.base_delay.max(MIN_BACKOFF_STEP);
        self.max_delay = self.max_delay.max(MIN_BACKOFF_STEP);
        self.min_connect_timeout = self.min_connect_timeout.max(MIN_BACKOFF_STEP);
        self
    }
}

/// Jittered exponential backoff.
pub struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter.  Kept as f64
    /// to avoid accumulating rounding errors.
    next_delay_secs: Mutex<f64>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffConfigError> {
        config.validate()?;
        let config = config.floored();
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    pub(crate) fn backoff_duration(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        let jittered =
            *next_delay * (1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0));
        *next_delay = self
            .config
            .max_delay
            .as_secs_f64()
            .min(*next_delay * self.config.multiplier);
        Duration::from_secs_f64(jittered).max(MIN_BACKOFF_STEP)
    }
}

impl Default for ExponentialBackoff {
    /// The default schedule from the gRPC connection backoff specification.
    fn default() -> Self {
        Self {
            config: DEFAULT_EXPONENTIAL_CONFIG,
            next_delay_secs: Mutex::new(DEFAULT_EXPONENTIAL_CONFIG.base_delay.as_secs_f64()),
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_attempt_time(&self) -> Instant {
        Instant::now() + self.backoff_duration()
    }

    fn reset(&self) {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        *next_delay = self.config.base_delay.as_secs_f64();
    }

    fn min_connect_timeout(&self) -> Duration {
        self.config.min_connect_timeout
    }
}

/// Backoff pinned to a fixed delay with no jitter or growth.  Used by tests
/// that need deterministic reconnect timing.
pub struct FixedBackoff {
    delay: Duration,
    min_connect_timeout: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration, min_connect_timeout: Duration) -> Self {
        Self {
            delay: delay.max(MIN_BACKOFF_STEP),
            min_connect_timeout: min_connect_timeout.max(MIN_BACKOFF_STEP),
        }
    }
}

impl Backoff for FixedBackoff {
    fn next_attempt_time(&self) -> Instant {
        Instant::now() + self.delay
    }

    fn reset(&self) {}

    fn min_connect_timeout(&self) -> Duration {
        self.min_connect_timeout
    }
}
