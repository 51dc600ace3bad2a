//! Scenario driver

use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::fixture::{marker, scripted_input};
use super::{ScenarioMetrics, ScenarioReport};
use crate::archetype::{ArchetypeId, Task};
use crate::config::EvalConfig;
use crate::error::{MnemeError, Result};
use crate::pipeline::{TurnPipeline, TurnRequest};

/// Runs synthetic load through a [`TurnPipeline`]
#[derive(Debug, Clone)]
pub struct EvalHarness {
    pipeline: TurnPipeline,
    config: EvalConfig,
    turn_deadline: Duration,
}

#[derive(Debug, Default)]
struct AgentOutcome {
    latencies: Vec<Duration>,
    attempted: u64,
    completed: u64,
    coherent: u64,
    errors: Vec<&'static str>,
}

impl EvalHarness {
    pub fn new(pipeline: TurnPipeline, config: EvalConfig) -> Self {
        Self {
            pipeline,
            config,
            turn_deadline: Duration::from_secs(5),
        }
    }

    /// Deadline handed to each simulated turn
    pub fn with_turn_deadline(mut self, deadline: Duration) -> Self {
        self.turn_deadline = deadline;
        self
    }

    /// Drive `agent_count` simulated agents of `archetype` and check the gates.
    ///
    /// Each agent holds a short scripted conversation with its own
    /// counterpart. A turn counts as coherent when it completes with a
    /// non-empty reply and its memory card carries the agent's previous line.
    ///
    /// # Errors
    ///
    /// Fails before any load is generated when the archetype cannot be
    /// resolved or `agent_count` is zero. Per-turn failures are reported in
    /// the metrics instead.
    pub async fn run_scenario(&self, archetype: &ArchetypeId, agent_count: usize) -> Result<ScenarioReport> {
        if agent_count == 0 {
            return Err(MnemeError::Configuration(
                "a scenario needs at least one agent".to_string(),
            ));
        }
        self.pipeline
            .coordinator()
            .registry()
            .resolve(archetype, Instant::now() + self.turn_deadline)
            .await?;

        info!(
            archetype = %archetype,
            agents = agent_count,
            turns_per_agent = self.config.turns_per_agent,
            "Starting evaluation scenario"
        );

        let started = Instant::now();
        let outcomes: Vec<AgentOutcome> = futures::stream::iter(0..agent_count)
            .map(|index| self.run_agent(archetype, index))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let elapsed = started.elapsed();

        let mut latencies = Vec::new();
        let mut errors: BTreeMap<String, u64> = BTreeMap::new();
        let (mut attempted, mut completed, mut coherent) = (0u64, 0u64, 0u64);
        for outcome in outcomes {
            latencies.extend(outcome.latencies);
            attempted += outcome.attempted;
            completed += outcome.completed;
            coherent += outcome.coherent;
            for kind in outcome.errors {
                *errors.entry(kind.to_string()).or_default() += 1;
            }
        }
        latencies.sort_unstable();

        let metrics = ScenarioMetrics {
            agents: agent_count,
            turns_attempted: attempted,
            turns_completed: completed,
            errors,
            coherence: if attempted == 0 {
                0.0
            } else {
                coherent as f64 / attempted as f64
            },
            p50_latency: percentile(&latencies, 50.0),
            p95_latency: percentile(&latencies, 95.0),
            p99_latency: percentile(&latencies, 99.0),
            elapsed,
            throughput: completed as f64 / elapsed.as_secs_f64().max(1e-6),
            peak_resident_bytes: self.pipeline.coordinator().stats().peak_resident_bytes,
        };

        let failed_gates = self.config.gates.check(&metrics);
        for failure in &failed_gates {
            warn!(archetype = %archetype, gate = ?failure.gate, "{}", failure);
        }
        info!(
            archetype = %archetype,
            completed,
            attempted,
            coherence = metrics.coherence,
            p95_ms = metrics.p95_latency.as_millis() as u64,
            throughput = metrics.throughput,
            passed = failed_gates.is_empty(),
            "Evaluation scenario finished"
        );

        Ok(ScenarioReport {
            archetype: archetype.to_string(),
            passed: failed_gates.is_empty(),
            metrics,
            failed_gates,
        })
    }

    async fn run_agent(&self, archetype: &ArchetypeId, index: usize) -> AgentOutcome {
        let agent_id = format!("eval-{}-{:05}", archetype, index);
        let counterpart_id = format!("eval-player-{:05}", index);
        // Continue after earlier runs against the same pipeline
        let first_ordinal = self
            .pipeline
            .hot()
            .last_ordinal(&agent_id, &counterpart_id)
            .map_or(1, |last| last + 1);

        let turns = self.config.turns_per_agent;
        let mut outcome = AgentOutcome {
            attempted: turns as u64,
            ..AgentOutcome::default()
        };
        let mut previous: Option<String> = None;

        for turn in 0..turns {
            let request = TurnRequest::new(
                agent_id.clone(),
                counterpart_id.clone(),
                archetype.clone(),
                Task::Dialogue,
                first_ordinal + turn as u64,
                scripted_input(index, turn),
            );
            let start = Instant::now();
            match self.pipeline.respond(request, start + self.turn_deadline).await {
                Ok(response) => {
                    outcome.latencies.push(start.elapsed());
                    outcome.completed += 1;
                    let remembered = previous
                        .as_ref()
                        .is_none_or(|m| response.memory_card.text.contains(m.as_str()));
                    if remembered && !response.output.trim().is_empty() {
                        outcome.coherent += 1;
                    }
                    previous = Some(marker(index, turn));
                }
                Err(e) => {
                    // Later ordinals would be out of order; the rest count as failed
                    outcome.errors.push(e.kind());
                    break;
                }
            }
        }
        outcome
    }
}

/// Nearest-rank percentile of an ascending slice; zero when empty
pub fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
