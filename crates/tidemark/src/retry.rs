//! Backoff policy for transient query failures
//!
//! The policy is kept apart from the attempt bookkeeping: [`BackoffPolicy`]
//! maps a retry number onto a delay, [`RetryContext`] counts the attempts of a
//! single query and remembers the error that triggered the last one.

use std::time::Duration;

use tidemark_rdbc::Error as SourceError;

/// Exponential backoff with a cap
///
/// The delay before retry `n` (1-based) is `initial_delay * multiplier^(n-1)`,
/// capped at `max_delay`. With `multiplier > 1` and no jitter, successive
/// delays strictly increase until the cap is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts for one query, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between successive delays, strictly greater than 1
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total attempts (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set initial delay (builder pattern)
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set max delay (builder pattern)
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier (builder pattern)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Check the policy can only produce growing, bounded delays
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.initial_delay.is_zero() {
            return Err("initial_delay must be greater than zero".into());
        }
        if self.max_delay < self.initial_delay {
            return Err(format!(
                "max_delay ({:?}) must not be below initial_delay ({:?})",
                self.max_delay, self.initial_delay
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(format!(
                "multiplier must be a finite number greater than 1, got {}",
                self.multiplier
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        // cap the exponent to keep powi finite
        let exponent = (retry - 1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Attempt bookkeeping for one query execution
#[derive(Debug, Default)]
pub struct RetryContext {
    attempts: u32,
    last_error: Option<SourceError>,
}

impl RetryContext {
    /// Fresh context for a new query
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and get the delay before the next one
    ///
    /// Returns `None` once the attempt budget is spent; the error is kept
    /// either way and can be taken with [`RetryContext::into_last_error`].
    pub fn record_failure(&mut self, error: SourceError, policy: &BackoffPolicy) -> Option<Duration> {
        self.attempts += 1;
        self.last_error = Some(error);
        if self.attempts < policy.max_attempts {
            Some(policy.delay_for_retry(self.attempts))
        } else {
            None
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Error from the most recent failed attempt
    pub fn last_error(&self) -> Option<&SourceError> {
        self.last_error.as_ref()
    }

    /// Consume the context, returning the most recent error
    pub fn into_last_error(self) -> Option<SourceError> {
        self.last_error
    }
}
