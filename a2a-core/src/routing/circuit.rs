//! Circuit breaker pattern for fault tolerance

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, blocking requests
    Open,
    /// Circuit is half-open, testing if the route recovered
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before trial requests are let through
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// Trial requests allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// A state change, reported so the owner can publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Circuit breaker for one (source, destination) route.
///
/// The only transitions are closed→open, open→half-open, half-open→closed
/// and half-open→open.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Current state of the circuit
    state: CircuitState,
    /// Number of consecutive failures
    failure_count: u32,
    /// Last failure timestamp
    last_failure: Option<Instant>,
    /// Trial requests admitted since entering half-open
    half_open_in_flight: u32,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_in_flight: 0,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn half_open_in_flight(&self) -> u32 {
        self.half_open_in_flight
    }

    /// Checks if a request may proceed, moving open→half-open once the recovery timeout elapsed.
    pub fn try_acquire(&mut self, now: Instant) -> (bool, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.recovery_timeout);
                if !recovered {
                    return (false, None);
                }
                let transition = self.transition(CircuitState::HalfOpen);
                self.half_open_in_flight = 1;
                (true, transition)
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight >= self.config.half_open_max_requests {
                    return (false, None);
                }
                self.half_open_in_flight += 1;
                (true, None)
            }
        }
    }

    /// Records a success and potentially closes the circuit
    pub fn record_success(&mut self) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.last_failure = None;
                self.half_open_in_flight = 0;
                self.transition(CircuitState::Closed)
            }
            // A late result from before the circuit opened does not close it.
            CircuitState::Open => None,
        }
    }

    /// Records a failure and potentially opens the circuit
    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.transition(CircuitState::Open)
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = 0;
                self.transition(CircuitState::Open)
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(Transition { from, to })
    }
}
