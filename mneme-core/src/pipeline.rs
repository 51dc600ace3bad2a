//! Turn pipeline
//!
//! Produces an agent's next utterance:
//!
//! 1. recent turns from the hot tier, falling back to the warm tier
//! 2. relationship, salient memories and summaries from the warm tier
//! 3. a lease on the archetype's adapters from the coordinator
//! 4. a memory card, then the inference call
//! 5. the new turn into the hot tier synchronously, then the warm tier and
//!    the archiver in the background
//!
//! Memory reads degrade to an emptier card rather than failing the turn.
//! Capacity and deadline errors from the coordinator or runtime are returned
//! to the caller.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::archetype::{ArchetypeId, Task};
use crate::archive::ColdTierArchiver;
use crate::coordinator::{AdapterCoordinator, GenerateRequest, InferenceRuntime};
use crate::error::{MnemeError, Result};
use crate::memory::{
    ArchiveRecord, CardBudget, CardInputs, ConversationTurn, HotTier, MemoryCard,
    RelationshipSnapshot, SalientMemory, SessionCloser, SessionSummary, WarmTierManager,
    render_card,
};

/// One request for an agent's next turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub agent_id: String,
    pub counterpart_id: String,
    pub archetype: ArchetypeId,
    pub task: Task,
    /// Next ordinal for this (agent, counterpart) pair
    pub ordinal: u64,
    pub input: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TurnRequest {
    pub fn new(
        agent_id: impl Into<String>,
        counterpart_id: impl Into<String>,
        archetype: ArchetypeId,
        task: Task,
        ordinal: u64,
        input: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            counterpart_id: counterpart_id.into(),
            archetype,
            task,
            ordinal,
            input: input.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// The agent's reply and what went into it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub output: String,
    pub memory_card: MemoryCard,
    /// The turn as recorded in the hot tier
    pub turn: ConversationTurn,
    /// Whether the recent-turn context came from the warm tier
    pub warm_fallback: bool,
    /// Whether the turn was queued for the cold tier; `false` under backpressure
    pub archived: bool,
}

/// Pipeline counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub turns: u64,
    pub failed_turns: u64,
    pub warm_fallbacks: u64,
    /// Memory reads that failed and were served empty
    pub degraded_reads: u64,
    pub archive_backpressure: u64,
    pub sessions_closed: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct PipelineInner {
    coordinator: AdapterCoordinator,
    runtime: Arc<dyn InferenceRuntime>,
    hot: Arc<HotTier>,
    warm: Arc<WarmTierManager>,
    archiver: Arc<ColdTierArchiver>,
    closer: SessionCloser,
    budget: CardBudget,
    turns: AtomicU64,
    failed_turns: AtomicU64,
    warm_fallbacks: AtomicU64,
    degraded_reads: AtomicU64,
    archive_backpressure: AtomicU64,
    sessions_closed: AtomicU64,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Request path from agent input to agent output
#[derive(Clone)]
pub struct TurnPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for TurnPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPipeline")
            .field("budget", &self.inner.budget)
            .finish_non_exhaustive()
    }
}

impl TurnPipeline {
    pub fn new(
        coordinator: AdapterCoordinator,
        runtime: Arc<dyn InferenceRuntime>,
        hot: Arc<HotTier>,
        warm: Arc<WarmTierManager>,
        archiver: Arc<ColdTierArchiver>,
        closer: SessionCloser,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                coordinator,
                runtime,
                hot,
                warm,
                archiver,
                closer,
                budget: CardBudget::default(),
                turns: AtomicU64::new(0),
                failed_turns: AtomicU64::new(0),
                warm_fallbacks: AtomicU64::new(0),
                degraded_reads: AtomicU64::new(0),
                archive_backpressure: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Replace the memory card budget. Only valid before the pipeline is shared.
    pub fn with_card_budget(mut self, budget: CardBudget) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.budget = budget;
        }
        self
    }

    pub fn coordinator(&self) -> &AdapterCoordinator {
        &self.inner.coordinator
    }

    pub fn hot(&self) -> &Arc<HotTier> {
        &self.inner.hot
    }

    pub fn warm(&self) -> &Arc<WarmTierManager> {
        &self.inner.warm
    }

    pub fn archiver(&self) -> &Arc<ColdTierArchiver> {
        &self.inner.archiver
    }

    /// Produce the agent's next turn.
    ///
    /// # Errors
    ///
    /// - [`MnemeError::OutOfOrder`] when `ordinal` does not follow the pair's
    ///   last turn; nothing is generated. After a restart the last turn is
    ///   looked up in the warm and cold tiers.
    /// - [`MnemeError::CapacityExceeded`], [`MnemeError::Timeout`] and
    ///   [`MnemeError::NotFound`] from the adapter coordinator
    /// - [`MnemeError::Timeout`] when generation outlives `deadline`
    pub async fn respond(&self, request: TurnRequest, deadline: Instant) -> Result<TurnResponse> {
        let result = self.respond_inner(request, deadline).await;
        match &result {
            Ok(_) => {
                self.inner.turns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.failed_turns.fetch_add(1, Ordering::Relaxed);
                *self.inner.last_failure.lock() = Some(Utc::now());
            }
        }
        result
    }

    async fn respond_inner(&self, request: TurnRequest, deadline: Instant) -> Result<TurnResponse> {
        let inner = &self.inner;
        let TurnRequest {
            agent_id,
            counterpart_id,
            archetype,
            task,
            ordinal,
            input,
            metadata,
        } = request;

        let mut turn = ConversationTurn::new(&agent_id, &counterpart_id, ordinal, input, "");
        turn.metadata = metadata;
        turn.validate()?;
        let last = match inner.hot.last_ordinal(&agent_id, &counterpart_id) {
            Some(last) => Some(last),
            None => self.archived_ordinal(&agent_id, &counterpart_id).await,
        };
        if let Some(last) = last {
            if ordinal != last + 1 {
                return Err(MnemeError::OutOfOrder {
                    agent_id,
                    expected: last + 1,
                    got: ordinal,
                });
            }
        }

        let context_turns = inner.budget.max_recent_turns;
        let (recent, warm_fallback) = self
            .recent_context(&agent_id, &counterpart_id, context_turns)
            .await;
        let relationship = self.relationship(&agent_id, &counterpart_id).await;
        let salient = self.salient(&agent_id, &counterpart_id).await;
        let summaries = self.summaries(&agent_id, &counterpart_id).await;

        let lease = inner.coordinator.ensure_loaded(&archetype, deadline).await?;

        let card = render_card(
            CardInputs {
                relationship: relationship.as_ref(),
                salient: &salient,
                summaries: &summaries,
                recent: &recent,
            },
            &inner.budget,
        );

        let generate = inner.runtime.generate(GenerateRequest {
            archetype: archetype.clone(),
            task,
            prompt: turn.input.clone(),
            memory_card: card.text.clone(),
        });
        let output = tokio::time::timeout_at(deadline, generate)
            .await
            .map_err(|_| {
                MnemeError::Timeout(format!(
                    "generation for '{}' as {} exceeded its deadline",
                    agent_id, archetype
                ))
            })??;
        drop(lease);

        turn.output = output.clone();
        turn.timestamp = Utc::now();
        inner.hot.append(&agent_id, turn.clone())?;

        let warm = inner.warm.clone();
        let cached = turn.clone();
        tokio::spawn(async move {
            if let Err(e) = warm.put_turn(&cached).await {
                debug!(agent_id = %cached.agent_id, error = %e, "Warm turn write failed");
            }
        });

        let archived = match inner.archiver.enqueue(ArchiveRecord::Turn(turn.clone())) {
            Ok(()) => true,
            Err(e) => {
                inner.archive_backpressure.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent_id = %agent_id,
                    ordinal,
                    error = %e,
                    "Turn not queued for archiving"
                );
                false
            }
        };

        Ok(TurnResponse {
            output,
            memory_card: card,
            turn,
            warm_fallback,
            archived,
        })
    }

    /// Record a salient memory in the warm tier and the archive
    pub async fn remember(&self, memory: SalientMemory) -> Result<()> {
        memory.validate()?;
        self.inner
            .archiver
            .enqueue(ArchiveRecord::Salient(memory.clone()))?;
        if let Err(e) = self.inner.warm.put_salient(&memory).await {
            warn!(agent_id = %memory.agent_id, error = %e, "Salient memory not cached");
        }
        Ok(())
    }

    /// Record the latest relationship state in the warm tier and the archive
    pub async fn update_relationship(&self, snapshot: RelationshipSnapshot) -> Result<()> {
        snapshot.validate()?;
        self.inner
            .archiver
            .enqueue(ArchiveRecord::Relationship(snapshot.clone()))?;
        if let Err(e) = self.inner.warm.put_relationship_snapshot(&snapshot).await {
            warn!(agent_id = %snapshot.agent_id, error = %e, "Relationship snapshot not cached");
        }
        Ok(())
    }

    /// Close the pair's session now instead of waiting for the idle sweep
    pub async fn end_session(
        &self,
        agent_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<SessionSummary>> {
        let turns = self.inner.hot.take_session(agent_id, counterpart_id);
        let summary = self.inner.closer.close(&turns).await?;
        if summary.is_some() {
            self.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(summary)
    }

    /// Sweep idle hot-tier windows and summarize them. Returns sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let expired = self.inner.hot.evict_expired();
        if expired.is_empty() {
            return 0;
        }
        let closed = self.inner.closer.close_expired(expired).await.len();
        self.inner
            .sessions_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    pub fn stats(&self) -> PipelineStats {
        let inner = &self.inner;
        PipelineStats {
            turns: inner.turns.load(Ordering::Relaxed),
            failed_turns: inner.failed_turns.load(Ordering::Relaxed),
            warm_fallbacks: inner.warm_fallbacks.load(Ordering::Relaxed),
            degraded_reads: inner.degraded_reads.load(Ordering::Relaxed),
            archive_backpressure: inner.archive_backpressure.load(Ordering::Relaxed),
            sessions_closed: inner.sessions_closed.load(Ordering::Relaxed),
            last_failure_at: *inner.last_failure.lock(),
        }
    }

    async fn recent_context(
        &self,
        agent_id: &str,
        counterpart_id: &str,
        n: usize,
    ) -> (Vec<ConversationTurn>, bool) {
        let hot = self.inner.hot.recent_with(agent_id, counterpart_id, n);
        if !hot.is_empty() {
            return (hot, false);
        }
        self.inner.warm_fallbacks.fetch_add(1, Ordering::Relaxed);
        match self.inner.warm.recent_turns(agent_id, self.inner.warm_window()).await {
            Ok(turns) => {
                let mut pair: Vec<ConversationTurn> = turns
                    .into_iter()
                    .filter(|t| t.counterpart_id == counterpart_id)
                    .collect();
                let skip = pair.len().saturating_sub(n);
                (pair.split_off(skip), true)
            }
            Err(e) => {
                self.degraded(agent_id, "recent turns", &e);
                (Vec::new(), true)
            }
        }
    }

    /// Last ordinal stored for a pair the hot tier has not seen since startup
    async fn archived_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Option<u64> {
        match self.inner.warm.last_ordinal(agent_id, counterpart_id).await {
            Ok(last) => last,
            Err(e) => {
                self.degraded(agent_id, "ordinal check", &e);
                None
            }
        }
    }

    async fn relationship(&self, agent_id: &str, counterpart_id: &str) -> Option<RelationshipSnapshot> {
        match self.inner.warm.get_relationship(agent_id, counterpart_id).await {
            Ok(rel) => rel,
            Err(e) => {
                self.degraded(agent_id, "relationship", &e);
                None
            }
        }
    }

    async fn salient(&self, agent_id: &str, counterpart_id: &str) -> Vec<SalientMemory> {
        match self.inner.warm.get_salient(agent_id).await {
            Ok(all) => all
                .into_iter()
                .filter(|m| m.counterpart_id == counterpart_id)
                .collect(),
            Err(e) => {
                self.degraded(agent_id, "salient memories", &e);
                Vec::new()
            }
        }
    }

    async fn summaries(&self, agent_id: &str, counterpart_id: &str) -> Vec<SessionSummary> {
        match self.inner.warm.get_summaries(agent_id).await {
            Ok(all) => all
                .into_iter()
                .filter(|s| s.counterpart_id == counterpart_id)
                .collect(),
            Err(e) => {
                self.degraded(agent_id, "session summaries", &e);
                Vec::new()
            }
        }
    }

    fn degraded(&self, agent_id: &str, what: &str, error: &MnemeError) {
        self.inner.degraded_reads.fetch_add(1, Ordering::Relaxed);
        warn!(agent_id = %agent_id, error = %error, "Serving turn without {}", what);
    }
}

impl PipelineInner {
    /// Turns read from the warm tier on a hot miss; wider than the card so
    /// that filtering to one counterpart still leaves context
    fn warm_window(&self) -> usize {
        self.budget.max_recent_turns.saturating_mul(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{ArchetypeRegistry, FileSnapshotStore, SnapshotStore};
    use crate::archive::{ColdStore, InMemoryColdStore};
    use crate::config::{ColdTierConfig, HotTierConfig, RegistryConfig, WarmTierConfig};
    use crate::coordinator::StubRuntime;
    use crate::eval::{synthetic_adapters, synthetic_archetype};
    use crate::memory::{ExtractiveSummarizer, InMemoryWarmStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        pipeline: TurnPipeline,
        runtime: Arc<StubRuntime>,
        warm_store: Arc<InMemoryWarmStore>,
        cold: Arc<InMemoryColdStore>,
    }

    async fn harness(ceiling: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            snapshot_path: dir.path().join("chains.json"),
            adapter_root: dir.path().join("adapters"),
            ..RegistryConfig::default()
        };
        std::fs::create_dir_all(&config.adapter_root).unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::new(config.snapshot_path.clone()));
        let registry = ArchetypeRegistry::new(config, store);
        registry.initialize().await.unwrap();

        let id = ArchetypeId::new("blacksmith").unwrap();
        let adapters = synthetic_adapters(&id, 100).unwrap();
        registry
            .register(synthetic_archetype(&id), adapters, "gpu-0")
            .await
            .unwrap();

        let runtime = Arc::new(StubRuntime::new());
        let coordinator = AdapterCoordinator::new(registry, runtime.clone(), ceiling);
        let cold = Arc::new(InMemoryColdStore::new());
        let warm_store = Arc::new(InMemoryWarmStore::new());
        let warm = Arc::new(WarmTierManager::new(
            WarmTierConfig::default(),
            warm_store.clone(),
            cold.clone(),
        ));
        let archiver = Arc::new(ColdTierArchiver::new(ColdTierConfig::default(), cold.clone()));
        let closer = SessionCloser::new(
            Arc::new(ExtractiveSummarizer::new()),
            warm.clone(),
            archiver.clone(),
        );
        let pipeline = TurnPipeline::new(
            coordinator,
            runtime.clone(),
            Arc::new(HotTier::new(HotTierConfig::default())),
            warm,
            archiver,
            closer,
        );
        Harness {
            _dir: dir,
            pipeline,
            runtime,
            warm_store,
            cold,
        }
    }

    fn request(ordinal: u64, input: &str) -> TurnRequest {
        TurnRequest::new(
            "smith-1",
            "player-1",
            ArchetypeId::new("blacksmith").unwrap(),
            Task::Dialogue,
            ordinal,
            input,
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_turns_flow_through_every_tier() {
        let h = harness(1_000).await;
        let first = h.pipeline.respond(request(1, "hello there"), deadline()).await.unwrap();
        assert!(first.output.starts_with("[blacksmith/dialogue]"));
        assert!(first.archived);

        let second = h.pipeline.respond(request(2, "need a blade"), deadline()).await.unwrap();
        assert!(!second.warm_fallback);
        assert!(second.memory_card.text.contains("hello there"));

        assert_eq!(h.pipeline.hot().recent("smith-1", 10).len(), 2);
        assert_eq!(h.pipeline.archiver().drain().await.unwrap(), 2);
        assert_eq!(h.cold.load_turns("smith-1", 10).await.unwrap().len(), 2);
        assert_eq!(h.runtime.load_calls(), Task::ALL.len());
        assert_eq!(h.pipeline.stats().turns, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_rejected_before_generation() {
        let h = harness(1_000).await;
        h.pipeline.respond(request(1, "a"), deadline()).await.unwrap();
        h.pipeline.respond(request(2, "b"), deadline()).await.unwrap();
        let calls = h.runtime.generate_calls();

        let err = h.pipeline.respond(request(4, "d"), deadline()).await.unwrap_err();
        assert!(matches!(err, MnemeError::OutOfOrder { expected: 3, got: 4, .. }));
        assert_eq!(h.runtime.generate_calls(), calls);
        assert_eq!(h.pipeline.stats().failed_turns, 1);
    }

    #[tokio::test]
    async fn test_capacity_error_reaches_caller() {
        let h = harness(10).await;
        let err = h.pipeline.respond(request(1, "a"), deadline()).await.unwrap_err();
        assert!(matches!(err, MnemeError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_hot_miss_falls_back_to_cold_history() {
        let h = harness(1_000).await;
        let old = ConversationTurn::new("smith-1", "player-1", 1, "remember the ore?", "aye");
        h.cold.write_batch(&[ArchiveRecord::Turn(old)]).await.unwrap();

        // Empty hot and warm tiers, as after a restart
        let response = h.pipeline.respond(request(2, "back again"), deadline()).await.unwrap();
        assert!(response.warm_fallback);
        assert!(response.memory_card.text.contains("remember the ore?"));
        assert!(h.pipeline.warm().stats().cold_fallbacks >= 1);
    }

    #[tokio::test]
    async fn test_archived_ordinal_rejected_after_restart() {
        let h = harness(1_000).await;
        let old = ConversationTurn::new("smith-1", "player-1", 1, "first ever", "welcome");
        h.cold.write_batch(&[ArchiveRecord::Turn(old)]).await.unwrap();

        // Fresh hot tier: the stored turn still owns ordinal 1
        let err = h
            .pipeline
            .respond(request(1, "second life"), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, MnemeError::OutOfOrder { expected: 2, got: 1, .. }));
        assert_eq!(h.runtime.generate_calls(), 0);

        h.pipeline.respond(request(2, "second life"), deadline()).await.unwrap();
        assert_eq!(h.pipeline.archiver().drain().await.unwrap(), 1);
        let stored: Vec<_> = h
            .cold
            .load_turns("smith-1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.ordinal, t.input))
            .collect();
        assert_eq!(
            stored,
            vec![(1, "first ever".to_string()), (2, "second life".to_string())]
        );
    }

    #[tokio::test]
    async fn test_memory_outage_degrades_card() {
        let h = harness(1_000).await;
        h.warm_store.set_available(false);
        h.cold.set_available(false);
        let response = h.pipeline.respond(request(1, "anyone home?"), deadline()).await.unwrap();
        assert!(response.memory_card.is_empty());
        assert!(h.pipeline.stats().degraded_reads >= 1);
    }

    #[tokio::test]
    async fn test_relationship_and_salient_reach_card() {
        let h = harness(1_000).await;
        let mut rel = RelationshipSnapshot::neutral("smith-1", "player-1");
        rel.trust = 0.7;
        rel.active_objectives = vec!["deliver the horseshoes".to_string()];
        h.pipeline.update_relationship(rel).await.unwrap();
        h.pipeline
            .remember(SalientMemory::new("smith-1", "player-1", "debt", "owes 40 gold", 0.8))
            .await
            .unwrap();
        h.pipeline
            .remember(SalientMemory::new("smith-1", "player-2", "gift", "brought ale", 0.9))
            .await
            .unwrap();

        let response = h.pipeline.respond(request(1, "hi"), deadline()).await.unwrap();
        let card = &response.memory_card.text;
        assert!(card.contains("trusted"));
        assert!(card.contains("deliver the horseshoes"));
        assert!(card.contains("owes 40 gold"));
        assert!(!card.contains("brought ale"), "other counterpart's memory leaked");
    }

    #[tokio::test]
    async fn test_end_session_summarizes_and_keeps_ordinals() {
        let h = harness(1_000).await;
        h.pipeline.respond(request(1, "the sword please"), deadline()).await.unwrap();
        h.pipeline.respond(request(2, "the sword is fine"), deadline()).await.unwrap();

        let summary = h
            .pipeline
            .end_session("smith-1", "player-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((summary.first_ordinal, summary.last_ordinal), (1, 2));
        assert!(h.pipeline.hot().recent("smith-1", 10).is_empty());
        assert!(h.pipeline.end_session("smith-1", "player-1").await.unwrap().is_none());

        // Ordinal tracking survives the session close
        assert!(h.pipeline.respond(request(1, "again"), deadline()).await.is_err());
        h.pipeline.respond(request(3, "again"), deadline()).await.unwrap();
    }
}
