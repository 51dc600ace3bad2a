//! Durable cold tier storage

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{MnemeError, Result};
use crate::memory::records::{
    ArchiveRecord, ConversationTurn, RelationshipSnapshot, SalientMemory, SessionSummary,
};

/// Durable store behind the cold tier.
///
/// Writes are keyed by [`ArchiveRecord::record_id`], so writing a record that
/// is already stored is a no-op and a failed batch can always be retried.
#[async_trait]
pub trait ColdStore: Send + Sync {
    /// Persist a batch of records
    async fn write_batch(&self, records: &[ArchiveRecord]) -> Result<()>;

    /// Up to `limit` most recent turns for an agent, oldest first
    async fn load_turns(&self, agent_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    /// Every session summary for an agent, oldest first
    async fn load_summaries(&self, agent_id: &str) -> Result<Vec<SessionSummary>>;

    /// Every salient memory for an agent, oldest first
    async fn load_salient(&self, agent_id: &str) -> Result<Vec<SalientMemory>>;

    /// Latest relationship snapshot for a pair
    async fn load_relationship(
        &self,
        agent_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<RelationshipSnapshot>>;

    /// Highest archived turn ordinal for a pair
    async fn last_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Result<Option<u64>>;

    /// Total records stored
    async fn count(&self) -> Result<usize>;
}

/// Process-local cold store.
///
/// Supports fault injection: the whole store can be taken offline, and
/// records for chosen agents can be rejected permanently.
#[derive(Debug)]
pub struct InMemoryColdStore {
    records: RwLock<BTreeMap<String, ArchiveRecord>>,
    available: AtomicBool,
    rejected_agents: RwLock<HashSet<String>>,
    write_calls: AtomicUsize,
}

impl Default for InMemoryColdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryColdStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            rejected_agents: RwLock::new(HashSet::new()),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject every record owned by `agent_id` as invalid
    pub fn reject_agent(&self, agent_id: impl Into<String>) {
        self.rejected_agents.write().insert(agent_id.into());
    }

    /// Accept every agent again
    pub fn accept_all(&self) {
        self.rejected_agents.write().clear();
    }

    /// Number of `write_batch` calls, successful or not
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Whether a record id is stored
    pub fn contains(&self, record_id: &str) -> bool {
        self.records.read().contains_key(record_id)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MnemeError::StorageUnavailable(
                "cold store is offline".to_string(),
            ))
        }
    }

    fn agent_records<'a>(
        records: &'a BTreeMap<String, ArchiveRecord>,
        agent_id: &'a str,
    ) -> impl Iterator<Item = &'a ArchiveRecord> + 'a {
        records.values().filter(move |r| r.agent_id() == agent_id)
    }
}

#[async_trait]
impl ColdStore for InMemoryColdStore {
    async fn write_batch(&self, records: &[ArchiveRecord]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        {
            let rejected = self.rejected_agents.read();
            if let Some(bad) = records.iter().find(|r| rejected.contains(r.agent_id())) {
                return Err(MnemeError::InvalidRecord(format!(
                    "record '{}' rejected by store",
                    bad.record_id()
                )));
            }
        }

        let mut stored = self.records.write();
        for record in records {
            stored
                .entry(record.record_id())
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    async fn load_turns(&self, agent_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        self.check_available()?;
        let records = self.records.read();
        let mut turns: Vec<ConversationTurn> = Self::agent_records(&records, agent_id)
            .filter_map(|r| match r {
                ArchiveRecord::Turn(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        turns.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.split_off(skip))
    }

    async fn load_summaries(&self, agent_id: &str) -> Result<Vec<SessionSummary>> {
        self.check_available()?;
        let records = self.records.read();
        let mut summaries: Vec<SessionSummary> = Self::agent_records(&records, agent_id)
            .filter_map(|r| match r {
                ArchiveRecord::Summary(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        summaries.sort_by_key(|s| s.ended_at);
        Ok(summaries)
    }

    async fn load_salient(&self, agent_id: &str) -> Result<Vec<SalientMemory>> {
        self.check_available()?;
        let records = self.records.read();
        let mut salient: Vec<SalientMemory> = Self::agent_records(&records, agent_id)
            .filter_map(|r| match r {
                ArchiveRecord::Salient(m) => Some(m.clone()),
                _ => None,
            })
            .collect();
        salient.sort_by_key(|m| m.recorded_at);
        Ok(salient)
    }

    async fn load_relationship(
        &self,
        agent_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<RelationshipSnapshot>> {
        self.check_available()?;
        let records = self.records.read();
        Ok(Self::agent_records(&records, agent_id)
            .filter_map(|r| match r {
                ArchiveRecord::Relationship(rel) if rel.counterpart_id == counterpart_id => {
                    Some(rel)
                }
                _ => None,
            })
            .max_by_key(|rel| rel.updated_at)
            .cloned())
    }

    async fn last_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Result<Option<u64>> {
        self.check_available()?;
        let records = self.records.read();
        Ok(Self::agent_records(&records, agent_id)
            .filter_map(|r| match r {
                ArchiveRecord::Turn(t) if t.counterpart_id == counterpart_id => Some(t.ordinal),
                _ => None,
            })
            .max())
    }

    async fn count(&self) -> Result<usize> {
        self.check_available()?;
        Ok(self.records.read().len())
    }
}
