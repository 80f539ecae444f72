use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::Deserialize;

/// Retry configuration, immutable for the lifetime of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay for a zero-based attempt index, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Outcome of asking the controller for the next retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// One-based index of the retry being scheduled, equal to the failures so far.
        attempt: u32,
        server_directed: bool,
    },
    Exhausted {
        attempts: u32,
    },
}

/// Capped exponential backoff with jitter and a bounded retry budget.
///
/// The policy lives here rather than in the session actor: the actor only reports
/// failures and successes and applies whatever delay comes back.
#[derive(Debug, Clone)]
pub struct ReconnectionController {
    policy: RetryPolicy,
    attempt: u32,
    server_delay: Option<Duration>,
    rng: SmallRng,
}

impl ReconnectionController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, SmallRng::from_entropy())
    }

    /// Deterministic jitter for reproducible schedules.
    pub fn seeded(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: SmallRng) -> Self {
        Self {
            policy,
            attempt: 0,
            server_delay: None,
            rng,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Record a failure and decide the delay before the next attempt.
    ///
    /// `max_attempts` bounds consecutive failed attempts, the initial one included: the
    /// failure that reaches it exhausts the budget instead of scheduling another retry.
    pub fn next_retry(&mut self) -> RetryDecision {
        if !self.is_exhausted() {
            self.attempt = self.attempt.saturating_add(1);
        }
        if self.is_exhausted() {
            self.server_delay = None;
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        let (delay, server_directed) = match self.server_delay.take() {
            Some(delay) => (delay, true),
            None => (self.policy.backoff(self.attempt - 1) + self.jitter(), false),
        };
        RetryDecision::Retry {
            delay,
            attempt: self.attempt,
            server_directed,
        }
    }

    /// Replace the computed backoff with a server-provided delay for exactly one retry.
    pub fn server_directed(&mut self, delay: Duration) {
        self.server_delay = Some(delay);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.server_delay = None;
    }

    fn jitter(&mut self) -> Duration {
        if self.policy.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..=self.policy.jitter_ms))
    }
}
