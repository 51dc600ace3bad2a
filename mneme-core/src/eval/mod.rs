//! Load-test and acceptance harness
//!
//! Drives many simulated agents of one archetype through the full turn
//! pipeline and checks the result against fixed gates:
//!
//! - behavioral coherence: replies come from the right archetype and see
//!   the agent's previous turn in their memory card
//! - p95 turn latency
//! - peak resident adapter footprint
//! - sustained throughput
//!
//! Run before enabling a new archetype, and as a regression check after
//! changes to the tiers or the coordinator.
//!
//! # Example
//!
//! ```rust,no_run
//! use mneme_core::eval::EvalHarness;
//!
//! # async fn demo(system: mneme_core::MnemeSystem) -> mneme_core::Result<()> {
//! let harness = EvalHarness::new(system.pipeline().clone(), system.config().eval.clone());
//! let report = harness.run_scenario(&"blacksmith".parse()?, 500).await?;
//! assert!(report.passed, "{:?}", report.failed_gates);
//! # Ok(())
//! # }
//! ```

pub mod fixture;
mod harness;

pub use fixture::{synthetic_adapters, synthetic_archetype};
pub use harness::{EvalHarness, percentile};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::GIB;
use crate::error::{MnemeError, Result};

/// Thresholds a scenario must meet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioGates {
    /// Minimum fraction of coherent turns, 0.0..=1.0
    pub min_coherence: f64,

    /// Ceiling on the 95th percentile turn latency
    #[serde(with = "humantime_serde")]
    pub max_p95_latency: Duration,

    /// Ceiling on peak resident adapter bytes
    pub max_resident_bytes: u64,

    /// Floor on completed turns per second
    pub min_throughput: f64,
}

impl Default for ScenarioGates {
    fn default() -> Self {
        Self {
            min_coherence: 0.9,
            max_p95_latency: Duration::from_millis(250),
            max_resident_bytes: 15 * GIB,
            min_throughput: 50.0,
        }
    }
}

impl ScenarioGates {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_coherence) {
            return Err(MnemeError::Configuration(format!(
                "eval.gates.min_coherence must be within [0, 1], got {}",
                self.min_coherence
            )));
        }
        if !self.min_throughput.is_finite() || self.min_throughput < 0.0 {
            return Err(MnemeError::Configuration(format!(
                "eval.gates.min_throughput must be a non-negative number, got {}",
                self.min_throughput
            )));
        }
        if self.max_resident_bytes == 0 {
            return Err(MnemeError::Configuration(
                "eval.gates.max_resident_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Compare metrics against every gate
    pub fn check(&self, metrics: &ScenarioMetrics) -> Vec<GateFailure> {
        let mut failed = Vec::new();
        if metrics.coherence < self.min_coherence {
            failed.push(GateFailure {
                gate: Gate::Coherence,
                threshold: format!("{:.3}", self.min_coherence),
                observed: format!("{:.3}", metrics.coherence),
            });
        }
        if metrics.p95_latency > self.max_p95_latency {
            failed.push(GateFailure {
                gate: Gate::P95Latency,
                threshold: format!("{:?}", self.max_p95_latency),
                observed: format!("{:?}", metrics.p95_latency),
            });
        }
        if metrics.peak_resident_bytes > self.max_resident_bytes {
            failed.push(GateFailure {
                gate: Gate::ResidentMemory,
                threshold: self.max_resident_bytes.to_string(),
                observed: metrics.peak_resident_bytes.to_string(),
            });
        }
        if metrics.throughput < self.min_throughput {
            failed.push(GateFailure {
                gate: Gate::Throughput,
                threshold: format!("{:.1}/s", self.min_throughput),
                observed: format!("{:.1}/s", metrics.throughput),
            });
        }
        failed
    }
}

/// Gate identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Coherence,
    P95Latency,
    ResidentMemory,
    Throughput,
}

/// One gate a scenario missed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: Gate,
    pub threshold: String,
    pub observed: String,
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: observed {} against threshold {}",
            self.gate, self.observed, self.threshold
        )
    }
}

/// Measurements from one scenario run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub agents: usize,
    pub turns_attempted: u64,
    pub turns_completed: u64,
    /// Failed turns by error kind
    pub errors: BTreeMap<String, u64>,
    /// Coherent turns over attempted turns
    pub coherence: f64,
    #[serde(with = "humantime_serde")]
    pub p50_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Completed turns per second of wall time
    pub throughput: f64,
    pub peak_resident_bytes: u64,
}

/// Outcome of [`EvalHarness::run_scenario`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub archetype: String,
    pub passed: bool,
    pub metrics: ScenarioMetrics,
    pub failed_gates: Vec<GateFailure>,
}
