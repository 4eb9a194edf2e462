use std::time::Duration;

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Connecting,
    Connected,
    Backoff,
    /// Retry budget exhausted. Only a fresh open leaves this phase.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base: settings.reconnect_base_delay,
            max: settings.reconnect_max_delay,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// `min(base * 2^attempt, max)`, attempt counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

#[derive(Debug)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    phase: ReconnectPhase,
    attempt: u32,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            attempt: 0,
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_failed(&self) -> bool {
        self.phase == ReconnectPhase::Failed
    }

    /// A caller-driven open always starts from a clean slate, even after `Failed`.
    pub fn begin_open(&mut self) {
        self.attempt = 0;
        self.phase = ReconnectPhase::Connecting;
    }

    /// Backoff elapsed; returns false when the timer no longer applies.
    pub fn begin_retry(&mut self) -> bool {
        if self.phase != ReconnectPhase::Backoff {
            return false;
        }
        self.phase = ReconnectPhase::Connecting;
        true
    }

    pub fn on_opened(&mut self) {
        self.attempt = 0;
        self.phase = ReconnectPhase::Connected;
    }

    /// Records a lost or refused connection and decides whether another attempt is
    /// scheduled.
    pub fn on_lost(&mut self) -> ReconnectDecision {
        if self.phase == ReconnectPhase::Failed || self.attempt >= self.policy.max_attempts {
            self.phase = ReconnectPhase::Failed;
            return ReconnectDecision::GiveUp {
                attempts: self.attempt,
            };
        }
        let attempt = self.attempt;
        self.attempt += 1;
        self.phase = ReconnectPhase::Backoff;
        ReconnectDecision::Retry {
            attempt,
            delay: self.policy.delay_for(attempt),
        }
    }

    pub fn on_clean_close(&mut self) {
        self.attempt = 0;
        self.phase = ReconnectPhase::Idle;
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
