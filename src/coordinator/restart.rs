use std::future::Future;
use std::time::Duration;

use crate::config::RestartConfig;

/// Bounded exponential backoff: attempt `n` waits `base^n` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl RestartPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_delay_secs.saturating_pow(attempt))
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_secs: config.base_delay_secs,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

/// Result of one recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Reconnected,
    Failed { attempt: u32 },
    /// The attempt budget is spent; the daemon should shut down.
    Exhausted,
}

/// Tracks consecutive restart attempts against a policy.
#[derive(Debug, Clone)]
pub struct RestartSupervisor {
    policy: RestartPolicy,
    attempt: u32,
}

impl RestartSupervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts made since the last successful reconnect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Claim the next attempt and its delay, or `None` once the cap is reached.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.policy.delay_for_attempt(self.attempt)))
    }

    /// Wait out the backoff for the next attempt and run `reconnect`.
    /// A successful reconnect resets the attempt counter.
    pub async fn recover<F, Fut>(&mut self, reconnect: F) -> RecoveryOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let Some((attempt, delay)) = self.next_attempt() else {
            tracing::error!(
                "max restart attempts ({}) reached, giving up",
                self.policy.max_attempts
            );
            return RecoveryOutcome::Exhausted;
        };

        tracing::warn!(
            "agent exited, restart attempt {}/{} in {:?}",
            attempt,
            self.policy.max_attempts,
            delay
        );
        tokio::time::sleep(delay).await;

        if reconnect().await {
            tracing::info!("agent reconnected");
            self.reset();
            RecoveryOutcome::Reconnected
        } else {
            tracing::error!("restart attempt {} failed", attempt);
            RecoveryOutcome::Failed { attempt }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn delays_are_powers_of_base() {
        let policy = RestartPolicy {
            max_attempts: 3,
            base_delay_secs: 2,
        };
        let delays: Vec<u64> = (1..=3)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn attempts_never_exceed_cap() {
        let mut supervisor = RestartSupervisor::new(RestartPolicy::default());
        let mut granted = 0;
        while supervisor.next_attempt().is_some() {
            granted += 1;
            assert!(granted <= 3);
        }
        assert_eq!(granted, 3);
        assert_eq!(supervisor.attempt(), 3);
        assert!(supervisor.next_attempt().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reconnects_back_off_then_exhaust() {
        let mut supervisor = RestartSupervisor::new(RestartPolicy {
            max_attempts: 3,
            base_delay_secs: 2,
        });

        let mut waits = Vec::new();
        for expected in 1..=3 {
            let before = Instant::now();
            let outcome = supervisor.recover(|| async { false }).await;
            waits.push(before.elapsed().as_secs());
            assert_eq!(outcome, RecoveryOutcome::Failed { attempt: expected });
        }
        assert_eq!(waits, vec![2, 4, 8]);

        let before = Instant::now();
        assert_eq!(
            supervisor.recover(|| async { true }).await,
            RecoveryOutcome::Exhausted
        );
        assert_eq!(before.elapsed().as_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_counter() {
        let mut supervisor = RestartSupervisor::new(RestartPolicy::default());

        assert_eq!(
            supervisor.recover(|| async { false }).await,
            RecoveryOutcome::Failed { attempt: 1 }
        );
        assert_eq!(supervisor.attempt(), 1);

        assert_eq!(
            supervisor.recover(|| async { true }).await,
            RecoveryOutcome::Reconnected
        );
        assert_eq!(supervisor.attempt(), 0);

        // The next outage starts again from base^1.
        let before = Instant::now();
        supervisor.recover(|| async { false }).await;
        assert_eq!(before.elapsed().as_secs(), 2);
    }
}
