//! Failure gate for the warm store
//!
//! After `failure_threshold` consecutive failures the warm tier stops calling
//! its store and serves from cold storage instead. Once `reset_timeout` has
//! passed one probe is let through; its outcome closes or reopens the gate.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Externally visible breaker position, reported in health output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, failures: usize) -> Self {
        self.failure_threshold = failures.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { streak: usize },
    Open { since: Instant },
    HalfOpen,
}

impl Phase {
    fn visible(self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Consecutive-failure breaker shared by all callers of one store
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            phase: Mutex::new(Phase::Closed { streak: 0 }),
        }
    }

    /// Current position, promoting an expired open gate to half-open
    pub fn state(&self) -> CircuitState {
        let mut phase = self.phase.lock();
        if let Phase::Open { since } = *phase {
            if since.elapsed() >= self.config.reset_timeout {
                *phase = Phase::HalfOpen;
            }
        }
        phase.visible()
    }

    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::HalfOpen => {
                tracing::info!("Warm store probe succeeded, circuit closed");
                *phase = Phase::Closed { streak: 0 };
            }
            Phase::Closed { .. } => *phase = Phase::Closed { streak: 0 },
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut phase = self.phase.lock();
        *phase = match *phase {
            Phase::Closed { streak } if streak + 1 >= self.config.failure_threshold => {
                tracing::warn!(failures = streak + 1, "Warm store circuit opened");
                Phase::Open { since: Instant::now() }
            }
            Phase::Closed { streak } => Phase::Closed { streak: streak + 1 },
            Phase::HalfOpen => {
                tracing::warn!("Warm store probe failed, circuit reopened");
                Phase::Open { since: Instant::now() }
            }
            open @ Phase::Open { .. } => open,
        };
    }

    /// Consecutive failures while closed; zero in any other phase
    pub fn consecutive_failures(&self) -> usize {
        match *self.phase.lock() {
            Phase::Closed { streak } => streak,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("phase", &*self.phase.lock())
            .field("threshold", &self.config.failure_threshold)
            .finish()
    }
}
