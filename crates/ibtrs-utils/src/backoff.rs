//! Delay schedules for reconnect attempts.

use std::time::Duration;

/// How the delay between reconnect attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// Starts at `initial`, doubles after each attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Tracks attempts and delays for one reconnect episode.
///
/// `next_wait` returns `None` once `max_attempts` attempts have been handed
/// out. A limit of `None` means retry forever.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    max_attempts: Option<u32>,
    current_wait: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy, max_attempts: Option<u32>) -> Self {
        Self {
            policy,
            max_attempts,
            current_wait: Self::initial(policy),
            attempts: 0,
        }
    }

    fn initial(policy: BackoffPolicy) -> Duration {
        match policy {
            BackoffPolicy::Fixed(d) => d,
            BackoffPolicy::Exponential { initial, .. } => initial,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are used up.
    ///
    /// Increments the attempt counter.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let wait = self.current_wait;
        if let BackoffPolicy::Exponential { max, .. } = self.policy {
            self.current_wait = (self.current_wait * 2).min(max);
        }
        self.attempts += 1;
        Some(wait)
    }

    /// Start over, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.current_wait = Self::initial(self.policy);
        self.attempts = 0;
    }

    /// Swap in a new schedule without losing the attempt count.
    pub fn update(&mut self, policy: BackoffPolicy, max_attempts: Option<u32>) {
        if policy != self.policy {
            self.policy = policy;
            self.current_wait = Self::initial(policy);
        }
        self.max_attempts = max_attempts;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_attempts, Some(max) if self.attempts >= max)
    }
}
