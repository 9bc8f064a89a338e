/*
    backoff.rs - Retry state machine

    Exponential backoff with an injectable jitter source:

        ceiling(n) = min(cap, base * 2^n)
        delay(n)   = jitter(ceiling(n))

    State is just the attempt counter. Callers record a failure with
    next_delay(), a success with reset(), and check is_exhausted() against
    the policy's max_attempts. Used by the signaling reconnect loop and by
    swarm connection attempts.
*/

use std::time::Duration;

use rand::Rng;

/// Retry tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Maps a ceiling to the actual delay
pub trait Jitter: Send + Sync + std::fmt::Debug {
    fn apply(&self, ceiling: Duration) -> Duration;
}

/// Uniform in `[0, ceiling]`
#[derive(Debug, Clone, Copy, Default)]
pub struct FullJitter;

impl Jitter for FullJitter {
    fn apply(&self, ceiling: Duration) -> Duration {
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(0..=nanos))
    }
}

/// Always the ceiling. Deterministic, for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn apply(&self, ceiling: Duration) -> Duration {
        ceiling
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Number of failures recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ceiling(&self) -> Duration {
        2u32.checked_pow(self.attempt)
            .and_then(|factor| self.policy.base.checked_mul(factor))
            .map_or(self.policy.cap, |d| d.min(self.policy.cap))
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn next_delay(&mut self, jitter: &dyn Jitter) -> Duration {
        let delay = jitter.apply(self.ceiling());
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay(&NoJitter).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..200 {
            backoff.next_delay(&NoJitter);
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(30));
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..4 {
            backoff.next_delay(&NoJitter);
        }
        assert!(!backoff.is_exhausted());
        backoff.next_delay(&NoJitter);
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..50 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay(&FullJitter);
            assert!(delay <= ceiling);
        }
    }
}
