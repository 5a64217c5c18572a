//! Reconnection policy and scheduling
//!
//! After an unexpected connection loss the engine asks the controller whether
//! to try again and when. Delays grow exponentially from `initial_delay_ms` and
//! are capped at `max_delay_ms`. The number of attempts is always bounded.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive attempts after one loss
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 120_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based): `min(initial * 2^(attempt-1), max)`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Sum of all delays when every attempt fails
    pub fn calculate_max_total_time(&self) -> u64 {
        (1..=self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .fold(0u64, u64::saturating_add)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.initial_delay_ms == 0 {
            return Err("initial_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must not be below initial_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Try again after `delay_ms`
    Proceed { attempt: u32, delay_ms: u64 },
    /// The application disconnected on purpose
    AbortExplicitDisconnect,
    /// Attempts exhausted, stay disconnected
    AbortMaxAttemptsExceeded,
}

/// Decide whether another attempt should be made (pure function)
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    explicit_disconnect: bool,
) -> ReconnectionDecision {
    if explicit_disconnect {
        return ReconnectionDecision::AbortExplicitDisconnect;
    }
    if current_attempts >= config.max_attempts {
        return ReconnectionDecision::AbortMaxAttemptsExceeded;
    }
    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay_ms: config.calculate_backoff_delay(attempt),
    }
}

/// Tracks the reconnect cycle that follows one connection loss
#[derive(Debug)]
pub struct ReconnectController {
    config: ReconnectConfig,
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            next_attempt_at: None,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Attempts made in the current cycle
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_scheduled(&self) -> bool {
        self.next_attempt_at.is_some()
    }

    /// Schedule the next attempt, or give up
    pub fn schedule(&mut self, now: Instant, explicit_disconnect: bool) -> ReconnectionDecision {
        let decision = should_attempt_reconnection(self.attempts, &self.config, explicit_disconnect);
        match &decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                info!(attempt, delay_ms, "Scheduling reconnection attempt");
                self.next_attempt_at = Some(now + Duration::from_millis(*delay_ms));
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(
                    attempts = self.attempts,
                    "Reconnection attempts exhausted, staying disconnected"
                );
                self.next_attempt_at = None;
            }
            ReconnectionDecision::AbortExplicitDisconnect => {
                self.next_attempt_at = None;
            }
        }
        decision
    }

    /// If an attempt is due, consume the schedule and return its number
    pub fn take_due(&mut self, now: Instant) -> Option<u32> {
        match self.next_attempt_at {
            Some(at) if now >= at => {
                self.next_attempt_at = None;
                self.attempts += 1;
                Some(self.attempts)
            }
            _ => None,
        }
    }

    /// Drop any pending schedule (explicit connect or disconnect)
    pub fn cancel(&mut self) {
        if self.next_attempt_at.take().is_some() {
            info!("Scheduled reconnection cancelled");
        }
        self.attempts = 0;
    }

    /// A connection was established, start the next cycle from scratch
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
    }
}
