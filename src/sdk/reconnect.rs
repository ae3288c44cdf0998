use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for abnormal connection loss.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before reconnection attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Counts consecutive reconnection attempts. Reset after every successful connect.
#[derive(Debug, Clone, Default)]
pub struct ReconnectionState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectionState {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The connection dropped abnormally (or a reconnection attempt failed).
    pub fn on_connection_lost(&mut self) -> ReconnectDecision {
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::Exhausted { attempts: self.attempts };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(3_000));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut state = ReconnectionState::new(ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        });
        assert!(matches!(state.on_connection_lost(), ReconnectDecision::Retry { attempt: 1, .. }));
        assert!(matches!(state.on_connection_lost(), ReconnectDecision::Retry { attempt: 2, .. }));
        assert_eq!(state.on_connection_lost(), ReconnectDecision::Exhausted { attempts: 2 });
    }

    #[test]
    fn reset_restores_budget() {
        let mut state = ReconnectionState::new(ReconnectPolicy::default());
        state.on_connection_lost();
        state.on_connection_lost();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert!(matches!(state.on_connection_lost(), ReconnectDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut state = ReconnectionState::new(ReconnectPolicy::disabled());
        assert_eq!(state.on_connection_lost(), ReconnectDecision::Exhausted { attempts: 0 });
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1_000);
    }
}
