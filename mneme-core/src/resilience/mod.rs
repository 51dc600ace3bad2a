//! Retry and circuit-breaking helpers shared by the storage tiers

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryConfig;
