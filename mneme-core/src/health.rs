//! Health snapshot for external monitoring
//!
//! Every component exposes its own stats; [`HealthReport`] gathers them into
//! one document a poller can scrape. No alerting policy lives here, only a
//! coarse status derived from signals an operator would page on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archetype::{MemoryStats, RegistryStats};
use crate::archive::ArchiverStats;
use crate::coordinator::CoordinatorStats;
use crate::error::Result;
use crate::memory::{HotTierStats, WarmTierStats};
use crate::pipeline::PipelineStats;
use crate::resilience::CircuitState;

/// Queue fill ratio above which the archiver counts as degraded
const QUEUE_PRESSURE: f64 = 0.8;

/// Coarse status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Serving, with reduced memory fidelity or durability headroom
    Degraded,
    /// Not serving
    Unavailable,
}

/// Stats of every component at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Why the status is not healthy
    pub reasons: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub registry: RegistryStats,
    pub chains: MemoryStats,
    pub coordinator: CoordinatorStats,
    pub hot: HotTierStats,
    pub warm: WarmTierStats,
    pub archiver: ArchiverStats,
    pub pipeline: PipelineStats,
}

impl HealthReport {
    /// Assemble a report and derive its status
    pub fn new(
        registry: RegistryStats,
        chains: MemoryStats,
        coordinator: CoordinatorStats,
        hot: HotTierStats,
        warm: WarmTierStats,
        archiver: ArchiverStats,
        pipeline: PipelineStats,
    ) -> Self {
        let mut report = Self {
            status: HealthStatus::Healthy,
            reasons: Vec::new(),
            generated_at: Utc::now(),
            registry,
            chains,
            coordinator,
            hot,
            warm,
            archiver,
            pipeline,
        };
        report.assess();
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn assess(&mut self) {
        if !self.registry.initialized {
            self.status = HealthStatus::Unavailable;
            self.reasons
                .push("registry has not loaded its snapshot".to_string());
            return;
        }

        if self.warm.breaker != CircuitState::Closed {
            self.reasons.push(format!(
                "warm tier circuit is {:?}; reads served from cold tier",
                self.warm.breaker
            ));
        }
        if self.archiver.queue_capacity > 0 {
            let fill = self.archiver.queue_depth as f64 / self.archiver.queue_capacity as f64;
            if fill >= QUEUE_PRESSURE {
                self.reasons.push(format!(
                    "archiver queue at {:.0}% of capacity",
                    fill * 100.0
                ));
            }
        }
        if self.archiver.dead_letters > 0 {
            self.reasons.push(format!(
                "{} archive records dead-lettered",
                self.archiver.dead_letters
            ));
        }
        if self.archiver.pending_retry > 0 {
            self.reasons.push(format!(
                "{} archive records awaiting retry",
                self.archiver.pending_retry
            ));
        }

        if !self.reasons.is_empty() {
            self.status = HealthStatus::Degraded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(archiver: ArchiverStats, warm_breaker: CircuitState) -> HealthReport {
        let registry = RegistryStats {
            initialized: true,
            ..RegistryStats::default()
        };
        let warm = WarmTierStats {
            hits: 0,
            misses: 0,
            hit_rate: 0.0,
            cold_fallbacks: 0,
            store_failures: 0,
            skipped_writes: 0,
            breaker: warm_breaker,
            last_failure_at: None,
        };
        let pipeline = PipelineStats {
            turns: 0,
            failed_turns: 0,
            warm_fallbacks: 0,
            degraded_reads: 0,
            archive_backpressure: 0,
            sessions_closed: 0,
            last_failure_at: None,
        };
        HealthReport::new(
            registry,
            MemoryStats::default(),
            CoordinatorStats::default(),
            HotTierStats::default(),
            warm,
            archiver,
            pipeline,
        )
    }

    #[test]
    fn test_quiet_system_is_healthy() {
        let archiver = ArchiverStats {
            queue_capacity: 100,
            ..ArchiverStats::default()
        };
        let health = report(archiver, CircuitState::Closed);
        assert!(health.is_healthy());
        assert!(health.reasons.is_empty());
    }

    #[test]
    fn test_degraded_signals() {
        let archiver = ArchiverStats {
            queue_depth: 90,
            queue_capacity: 100,
            dead_letters: 2,
            ..ArchiverStats::default()
        };
        let health = report(archiver, CircuitState::Open);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.reasons.len(), 3);
    }

    #[test]
    fn test_serializes_to_json() {
        let health = report(ArchiverStats::default(), CircuitState::Closed);
        let json: serde_json::Value = serde_json::from_str(&health.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["warm"]["breaker"], "closed");
    }
}
