//! Retry backoff for failed jobs and for the background loops.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy applied between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Every retry waits `base_delay`
    Fixed,
    /// Retry `n` waits `base_delay * 2^(n-1)`
    #[default]
    Exponential,
}

/// Retry delay policy of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Strategy
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Delay before the first retry
    #[serde(rename = "delay", with = "crate::duration::millis")]
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(1000))
    }
}

impl BackoffPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
        }
    }

    /// Doubling delay between attempts.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay to wait after the given number of failed attempts (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        }
    }
}

/// Bounded exponential backoff for loops that hit store errors.
///
/// Starts at `base`, doubles on every consecutive failure and never exceeds
/// `max`. A success resets it.
#[derive(Debug, Clone)]
pub(crate) struct LoopBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl LoopBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Register a failure and return how long to pause.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}
