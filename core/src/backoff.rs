//! Reconnect backoff: multiplicative growth with jitter, capped, reset on success

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("Minimum retry delay must be non-zero")]
    ZeroMinimum,
    #[error("Minimum retry delay {min_ms}ms exceeds maximum {max_ms}ms")]
    MinExceedsMax { min_ms: u64, max_ms: u64 },
    #[error("Jitter must be in [0, 1), got {0}")]
    InvalidJitter(String),
    #[error("Backoff factor {0} cannot keep delays from shrinking")]
    InvalidFactor(String),
}

/// Retry delay settings, in milliseconds so they read naturally in a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth per consecutive failure
    pub factor: f64,
    /// Relative spread applied to each growth step, e.g. 0.1 for ±10%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Reject settings under which a delay could ever shrink before the cap
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.min_delay_ms == 0 {
            return Err(BackoffError::ZeroMinimum);
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(BackoffError::MinExceedsMax {
                min_ms: self.min_delay_ms,
                max_ms: self.max_delay_ms,
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(BackoffError::InvalidJitter(self.jitter.to_string()));
        }
        if !self.factor.is_finite() || self.factor * (1.0 - self.jitter) < 1.0 {
            return Err(BackoffError::InvalidFactor(self.factor.to_string()));
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry delay tracker for one reconnecting session.
///
/// Consecutive calls to [`Backoff::next_delay`] never decrease until the cap
/// is reached; [`Backoff::reset`] returns to the minimum.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffError> {
        config.validate()?;
        Ok(Self {
            current: config.min_delay(),
            config,
        })
    }

    /// The delay the next retry will wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the delay for this retry and grow the one after it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let spread = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter)
        } else {
            0.0
        };
        let grown_ms = delay.as_millis() as f64 * self.config.factor * (1.0 + spread);
        let capped_ms = grown_ms.clamp(
            self.config.min_delay_ms as f64,
            self.config.max_delay_ms as f64,
        );
        self.current = Duration::from_millis(capped_ms.round() as u64);

        delay
    }

    /// Successful connection: start over from the minimum
    pub fn reset(&mut self) {
        self.current = self.config.min_delay();
    }
}
