//! Step-level retry with exponential backoff

use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::metrics::STEP_RETRIES;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetryBackoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: RetryBackoff::default(),
        }
    }

    /// Delay before the attempt after `attempt` (1-based)
    pub fn delay_for_attempt_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        let base = self.backoff.initial_delay_ms as f64 * self.backoff.backoff_factor.powi(exp);
        base.min(self.backoff.max_delay_ms as f64).round().max(0.0) as u64
    }
}

/// Errors that know whether another attempt may help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// The last error of a step together with how many attempts were made
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub step: &'static str,
    pub attempts: u32,
    pub error: E,
}

/// Attempt counter for one step
///
/// ```text
/// let mut attempts = Attempts::new(&policy, "agent");
/// let value = loop {
///     match step().await {
///         Ok(value) => break value,
///         Err(e) => attempts.after_failure(e).await?,
///     }
/// };
/// ```
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    step: &'static str,
    attempt: u32,
}

impl<'a> Attempts<'a> {
    pub fn new(policy: &'a RetryPolicy, step: &'static str) -> Self {
        Self {
            policy,
            step,
            attempt: 1,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wait out the backoff if `error` allows another attempt, otherwise give
    /// the error back
    pub async fn after_failure<E>(&mut self, error: E) -> Result<(), RetryFailure<E>>
    where
        E: Retryable + fmt::Display,
    {
        if !error.is_retryable() || self.attempt >= self.policy.max_attempts.max(1) {
            return Err(RetryFailure {
                step: self.step,
                attempts: self.attempt,
                error,
            });
        }

        let delay_ms = self.policy.delay_for_attempt_ms(self.attempt);
        warn!(
            step = self.step,
            attempt = self.attempt,
            delay_ms,
            error = %error,
            "Step failed, retrying"
        );
        STEP_RETRIES.with_label_values(&[self.step]).inc();
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        self.attempt += 1;
        Ok(())
    }
}
