//! Per-sink retry policy and circuit state machine

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total delivery attempts per batch before the circuit opens
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any retry delay
    pub max_backoff: Duration,

    /// Randomize delays by ±50%
    pub jitter: bool,

    /// How often an open circuit probes the sink
    pub probe_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
            probe_interval: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempts`-th consecutive failure (1-based).
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .checked_mul(2_u32.pow(exponent))
            .unwrap_or(self.max_backoff);

        let delay = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            base.mul_f64(factor)
        } else {
            base
        };

        delay.min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be greater than 0".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("retry initial_backoff cannot exceed max_backoff".to_string());
        }
        if self.probe_interval.is_zero() {
            return Err("probe_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Healthy,
    Degraded,
    CircuitOpen,
}

impl CircuitState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CircuitState::Healthy => 0,
            CircuitState::Degraded => 1,
            CircuitState::CircuitOpen => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Degraded,
            2 => CircuitState::CircuitOpen,
            _ => CircuitState::Healthy,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Healthy => write!(f, "healthy"),
            CircuitState::Degraded => write!(f, "degraded"),
            CircuitState::CircuitOpen => write!(f, "circuit-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    OpenCircuit,
}

/// Healthy -> Degraded -> CircuitOpen -> Healthy, tracked per sink.
#[derive(Debug)]
pub struct CircuitBreaker {
    sink: String,
    policy: RetryPolicy,
    state: CircuitState,
    attempts_for_batch: u32,
}

impl CircuitBreaker {
    pub fn new(sink: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            sink: sink.into(),
            policy,
            state: CircuitState::Healthy,
            attempts_for_batch: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failed attempts recorded against the batch currently being delivered.
    pub fn attempts_for_batch(&self) -> u32 {
        self.attempts_for_batch
    }

    pub fn on_attempt_failed(&mut self) -> RetryDecision {
        self.attempts_for_batch += 1;

        if self.attempts_for_batch >= self.policy.max_attempts {
            self.attempts_for_batch = 0;
            self.transition(CircuitState::CircuitOpen);
            return RetryDecision::OpenCircuit;
        }

        self.transition(CircuitState::Degraded);
        RetryDecision::RetryAfter(self.policy.backoff(self.attempts_for_batch))
    }

    pub fn on_delivered(&mut self) {
        self.attempts_for_batch = 0;
        self.transition(CircuitState::Healthy);
    }

    /// Returns true when the probe closed the circuit.
    pub fn on_probe(&mut self, reachable: bool) -> bool {
        if self.state != CircuitState::CircuitOpen {
            return false;
        }
        if reachable {
            self.transition(CircuitState::Healthy);
            return true;
        }
        false
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        match next {
            CircuitState::CircuitOpen => warn!(sink = %self.sink, "Sink circuit opened after {} failed attempts", self.policy.max_attempts),
            _ => info!(sink = %self.sink, "Sink state changed from {} to {}", self.state, next),
        }
        self.state = next;
    }
}
