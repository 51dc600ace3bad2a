//! Warm tier: shared low-latency cache over the cold archive
//!
//! Keys are namespaced by record kind and agent/counterpart id:
//!
//! ```text
//! {prefix}:summary:{agent}
//! {prefix}:salient:{agent}
//! {prefix}:rel:{agent}:{counterpart}
//! {prefix}:turns:{agent}
//! ```
//!
//! Every write carries the retention expiry, fixed at write time. A miss, or
//! an unreachable store, falls back to the cold tier and repopulates the
//! cache from what it finds there. Repeated store failures open a circuit
//! breaker; while it is open reads go straight to the cold tier and writes
//! are skipped, since the archiver persists the same records.
//!
//! A list key is only ever created whole, from the cold tier's copy. Writes
//! append to a list that already exists; a write to an absent list seeds it
//! first, so a hit never returns just the records written since a restart.
//! Only the turn window is length-capped; salient memories and summaries
//! keep every entry until the retention expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::records::{ConversationTurn, RelationshipSnapshot, SalientMemory, SessionSummary};
use crate::archive::ColdStore;
use crate::config::WarmTierConfig;
use crate::error::{MnemeError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Key-value service backing the warm tier
#[async_trait]
pub trait WarmStore: Send + Sync {
    /// Set a scalar value with an expiry
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Get a scalar value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Append to an existing list and reset its expiry. A `max_len` keeps
    /// only the newest entries. Returns `false`, writing nothing, when the
    /// key is absent.
    async fn append(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        max_len: Option<usize>,
    ) -> Result<bool>;

    /// Create a list holding `values` unless the key already exists.
    /// Returns whether the list was created.
    async fn seed(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        max_len: Option<usize>,
    ) -> Result<bool>;

    /// Every entry of a list, oldest first; `None` when the key is absent
    async fn range(&self, key: &str) -> Result<Option<Vec<String>>>;
}

#[derive(Debug, Clone)]
enum WarmValue {
    Scalar(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct WarmEntry {
    value: WarmValue,
    expires_at: Instant,
}

/// Process-local warm store with expiry and an availability switch
#[derive(Debug)]
pub struct InMemoryWarmStore {
    entries: Mutex<HashMap<String, WarmEntry>>,
    available: AtomicBool,
}

impl Default for InMemoryWarmStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarmStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every key, as after a cache restart
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MnemeError::StorageUnavailable(
                "warm store is unreachable".to_string(),
            ))
        }
    }

    fn live(&self, key: &str) -> Option<WarmValue> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl WarmStore for InMemoryWarmStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            WarmEntry {
                value: WarmValue::Scalar(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(match self.live(key) {
            Some(WarmValue::Scalar(value)) => Some(value),
            _ => None,
        })
    }

    async fn append(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        max_len: Option<usize>,
    ) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.expires_at <= now {
            entries.remove(key);
            return Ok(false);
        }
        let WarmValue::List(list) = &mut entry.value else {
            return Ok(false);
        };
        list.push_back(value);
        trim(list, max_len);
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn seed(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        max_len: Option<usize>,
    ) -> Result<bool> {
        self.check_available()?;
        if self.live(key).is_some() {
            return Ok(false);
        }
        let mut list: VecDeque<String> = values.into();
        trim(&mut list, max_len);
        self.entries.lock().insert(
            key.to_string(),
            WarmEntry {
                value: WarmValue::List(list),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn range(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.check_available()?;
        Ok(match self.live(key) {
            Some(WarmValue::List(list)) => Some(list.into_iter().collect()),
            _ => None,
        })
    }
}

fn trim(list: &mut VecDeque<String>, max_len: Option<usize>) {
    if let Some(max_len) = max_len {
        while list.len() > max_len.max(1) {
            list.pop_front();
        }
    }
}

/// Warm tier counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmTierStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Reads served by the cold tier
    pub cold_fallbacks: u64,
    pub store_failures: u64,
    /// Writes skipped while the breaker was open
    pub skipped_writes: u64,
    pub breaker: CircuitState,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Warm tier access layer
pub struct WarmTierManager {
    config: WarmTierConfig,
    store: Arc<dyn WarmStore>,
    cold: Arc<dyn ColdStore>,
    breaker: CircuitBreaker,
    hits: AtomicU64,
    misses: AtomicU64,
    cold_fallbacks: AtomicU64,
    store_failures: AtomicU64,
    skipped_writes: AtomicU64,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for WarmTierManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmTierManager")
            .field("prefix", &self.config.key_prefix)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl WarmTierManager {
    pub fn new(config: WarmTierConfig, store: Arc<dyn WarmStore>, cold: Arc<dyn ColdStore>) -> Self {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(config.breaker_failure_threshold)
                .with_reset_timeout(config.breaker_reset_timeout),
        );
        Self {
            config,
            store,
            cold,
            breaker,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cold_fallbacks: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            skipped_writes: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub async fn put_summary(&self, summary: &SessionSummary) -> Result<()> {
        let agent_id = &summary.agent_id;
        let key = self.key(&["summary", agent_id]);
        self.append_record(&key, summary, None, || self.cold.load_summaries(agent_id))
            .await
    }

    /// Session summaries for an agent, oldest first
    pub async fn get_summaries(&self, agent_id: &str) -> Result<Vec<SessionSummary>> {
        let key = self.key(&["summary", agent_id]);
        if let Some(found) = self.read_list(&key).await {
            return Ok(found);
        }
        let from_cold = self.cold_read(agent_id, self.cold.load_summaries(agent_id)).await?;
        self.repopulate_list(&key, &from_cold, None).await;
        Ok(from_cold)
    }

    pub async fn put_salient(&self, memory: &SalientMemory) -> Result<()> {
        memory.validate()?;
        let agent_id = &memory.agent_id;
        let key = self.key(&["salient", agent_id]);
        self.append_record(&key, memory, None, || self.cold.load_salient(agent_id))
            .await
    }

    /// Salient memories for an agent, oldest first
    pub async fn get_salient(&self, agent_id: &str) -> Result<Vec<SalientMemory>> {
        let key = self.key(&["salient", agent_id]);
        if let Some(found) = self.read_list(&key).await {
            return Ok(found);
        }
        let from_cold = self.cold_read(agent_id, self.cold.load_salient(agent_id)).await?;
        self.repopulate_list(&key, &from_cold, None).await;
        Ok(from_cold)
    }

    pub async fn put_relationship_snapshot(&self, snapshot: &RelationshipSnapshot) -> Result<()> {
        snapshot.validate()?;
        let key = self.key(&["rel", &snapshot.agent_id, &snapshot.counterpart_id]);
        let value = serde_json::to_string(snapshot)?;
        self.guarded(|store, ttl| async move { store.set(&key, value, ttl).await })
            .await
            .map(|_| ())
    }

    /// Latest relationship snapshot for a pair
    pub async fn get_relationship(
        &self,
        agent_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<RelationshipSnapshot>> {
        let key = self.key(&["rel", agent_id, counterpart_id]);
        if let Some(found) = self.read_scalar::<RelationshipSnapshot>(&key).await {
            return Ok(Some(found));
        }
        let from_cold = self
            .cold_read(agent_id, self.cold.load_relationship(agent_id, counterpart_id))
            .await?;
        if let Some(snapshot) = &from_cold {
            if let Ok(value) = serde_json::to_string(snapshot) {
                let _ = self
                    .guarded(|store, ttl| async move { store.set(&key, value, ttl).await })
                    .await;
            }
        }
        Ok(from_cold)
    }

    /// Record a turn in the agent's recent-turn window
    pub async fn put_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let agent_id = &turn.agent_id;
        let key = self.key(&["turns", agent_id]);
        let window = self.config.max_recent_turns;
        self.append_record(&key, turn, Some(window), || {
            self.cold.load_turns(agent_id, window)
        })
        .await
    }

    /// Up to `n` most recent turns for an agent, oldest first
    pub async fn recent_turns(&self, agent_id: &str, n: usize) -> Result<Vec<ConversationTurn>> {
        let key = self.key(&["turns", agent_id]);
        if let Some(mut found) = self.read_list::<ConversationTurn>(&key).await {
            let skip = found.len().saturating_sub(n);
            return Ok(found.split_off(skip));
        }
        let limit = self.config.max_recent_turns;
        let from_cold = self.cold_read(agent_id, self.cold.load_turns(agent_id, limit)).await?;
        self.repopulate_list(&key, &from_cold, Some(limit)).await;
        let mut turns = from_cold;
        let skip = turns.len().saturating_sub(n);
        Ok(turns.split_off(skip))
    }

    /// Highest ordinal recorded for a pair, in the warm window or the archive.
    ///
    /// # Errors
    ///
    /// Returns the cold tier's error when the archive cannot be read; the
    /// warm window alone cannot rule out an older, higher ordinal.
    pub async fn last_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Result<Option<u64>> {
        let key = self.key(&["turns", agent_id]);
        let cached = self
            .read_list::<ConversationTurn>(&key)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|t| t.counterpart_id == counterpart_id)
            .map(|t| t.ordinal)
            .max();
        let archived = self.cold.last_ordinal(agent_id, counterpart_id).await?;
        Ok(cached.max(archived))
    }

    pub fn stats(&self) -> WarmTierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        WarmTierStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            cold_fallbacks: self.cold_fallbacks.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
            breaker: self.breaker.state(),
            last_failure_at: *self.last_failure.lock(),
        }
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.config.key_prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Append `record` to a list, seeding an absent list from `from_cold`
    async fn append_record<T, F, Fut>(
        &self,
        key: &str,
        record: &T,
        max_len: Option<usize>,
        from_cold: F,
    ) -> Result<()>
    where
        T: Serialize + Clone + PartialEq,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<T>>>,
    {
        let value = serde_json::to_string(record)?;
        let appended = self
            .guarded(|store, ttl| {
                let value = value.clone();
                async move { store.append(key, value, ttl, max_len).await }
            })
            .await?;
        if appended != Some(false) {
            return Ok(());
        }

        let mut items = match from_cold().await {
            Ok(items) => items,
            Err(e) => {
                // Left absent, the next read falls back to cold
                debug!(key, error = %e, "Cold tier unreadable, warm list left unseeded");
                return Ok(());
            }
        };
        if !items.contains(record) {
            items.push(record.clone());
        }
        let values = encode_all(&items)?;
        let seeded = self
            .guarded(|store, ttl| async move { store.seed(key, values, ttl, max_len).await })
            .await?;
        if seeded == Some(false) {
            // Another writer seeded the list first
            self.guarded(|store, ttl| async move { store.append(key, value, ttl, max_len).await })
                .await?;
        }
        Ok(())
    }

    /// Run a store operation unless the breaker is open; `None` when skipped
    async fn guarded<'a, T, F, Fut>(&'a self, op: F) -> Result<Option<T>>
    where
        F: FnOnce(&'a dyn WarmStore, Duration) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        if !self.breaker.is_allowed() {
            self.skipped_writes.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        match op(self.store.as_ref(), self.config.retention).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(Some(value))
            }
            Err(e) => {
                self.store_failed(&e);
                Err(e)
            }
        }
    }

    async fn read_list<T: DeserializeOwned>(&self, key: &str) -> Option<Vec<T>> {
        if !self.breaker.is_allowed() {
            return None;
        }
        match self.store.range(key).await {
            Ok(Some(values)) => {
                self.breaker.record_success();
                let decoded: std::result::Result<Vec<T>, _> =
                    values.iter().map(|v| serde_json::from_str(v)).collect();
                match decoded {
                    Ok(items) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(items)
                    }
                    Err(e) => {
                        warn!(key, error = %e, "Undecodable warm entry, treating as miss");
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Ok(None) => {
                self.breaker.record_success();
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.store_failed(&e);
                None
            }
        }
    }

    async fn read_scalar<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.breaker.is_allowed() {
            return None;
        }
        match self.store.get(key).await {
            Ok(Some(value)) => {
                self.breaker.record_success();
                match serde_json::from_str(&value) {
                    Ok(item) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(item)
                    }
                    Err(e) => {
                        warn!(key, error = %e, "Undecodable warm entry, treating as miss");
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Ok(None) => {
                self.breaker.record_success();
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.store_failed(&e);
                None
            }
        }
    }

    async fn cold_read<T, Fut>(&self, agent_id: &str, read: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.cold_fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(agent_id = %agent_id, "Warm tier miss, reading cold tier");
        read.await
    }

    async fn repopulate_list<T: Serialize>(&self, key: &str, items: &[T], max_len: Option<usize>) {
        let Ok(values) = encode_all(items) else {
            return;
        };
        let _ = self
            .guarded(|store, ttl| async move { store.seed(key, values, ttl, max_len).await })
            .await;
    }

    fn store_failed(&self, error: &MnemeError) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some(Utc::now());
        self.breaker.record_failure();
        warn!(error = %error, "Warm store operation failed");
    }
}

fn encode_all<T: Serialize>(items: &[T]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| serde_json::to_string(item).map_err(MnemeError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InMemoryColdStore;
    use crate::memory::records::ArchiveRecord;
    use uuid::Uuid;

    struct Fixture {
        warm: Arc<InMemoryWarmStore>,
        cold: Arc<InMemoryColdStore>,
        manager: WarmTierManager,
    }

    fn fixture() -> Fixture {
        let warm = Arc::new(InMemoryWarmStore::new());
        let cold = Arc::new(InMemoryColdStore::new());
        let config = WarmTierConfig {
            breaker_failure_threshold: 2,
            breaker_reset_timeout: Duration::from_secs(60),
            ..WarmTierConfig::default()
        };
        let manager = WarmTierManager::new(config, warm.clone(), cold.clone());
        Fixture { warm, cold, manager }
    }

    fn summary(agent: &str, text: &str) -> SessionSummary {
        SessionSummary {
            id: Uuid::new_v4(),
            agent_id: agent.to_string(),
            counterpart_id: "player-1".to_string(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            first_ordinal: 1,
            last_ordinal: 4,
            summary: text.to_string(),
            tone: "warm".to_string(),
            topics: vec!["harvest".to_string()],
            decisions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let f = fixture();
        f.manager.put_summary(&summary("npc-1", "first")).await.unwrap();
        f.manager.put_summary(&summary("npc-1", "second")).await.unwrap();
        let summaries = f.manager.get_summaries("npc-1").await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].summary, "second");

        let mut rel = RelationshipSnapshot::neutral("npc-1", "player-1");
        rel.trust = 0.5;
        f.manager.put_relationship_snapshot(&rel).await.unwrap();
        let got = f.manager.get_relationship("npc-1", "player-1").await.unwrap();
        assert_eq!(got, Some(rel));
        assert_eq!(f.manager.stats().cold_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let f = fixture();
        f.manager
            .put_relationship_snapshot(&RelationshipSnapshot::neutral("npc-1", "player-1"))
            .await
            .unwrap();
        assert!(f.warm.get("mneme:rel:npc-1:player-1").await.unwrap().is_some());
        assert!(f.warm.get("mneme:rel:npc-1:player-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cold_start_falls_back_and_repopulates() {
        let f = fixture();
        let memory = SalientMemory::new("npc-1", "player-1", "betrayal", "sold us out", 0.9);
        f.cold
            .write_batch(&[ArchiveRecord::Salient(memory.clone())])
            .await
            .unwrap();

        let first = f.manager.get_salient("npc-1").await.unwrap();
        assert_eq!(first, vec![memory.clone()]);
        assert_eq!(f.manager.stats().cold_fallbacks, 1);

        // Served from the repopulated warm tier now, even with cold offline
        f.cold.set_available(false);
        let second = f.manager.get_salient("npc-1").await.unwrap();
        assert_eq!(second, vec![memory]);
        assert_eq!(f.manager.stats().cold_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_unavailable_warm_store_falls_back_to_cold() {
        let f = fixture();
        let turn = ConversationTurn::new("npc-1", "player-1", 1, "hello", "greetings");
        f.cold
            .write_batch(&[ArchiveRecord::Turn(turn.clone())])
            .await
            .unwrap();

        f.warm.set_available(false);
        let turns = f.manager.recent_turns("npc-1", 5).await.unwrap();
        assert_eq!(turns, vec![turn]);
        assert!(f.manager.stats().store_failures >= 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_writes_are_skipped() {
        let f = fixture();
        f.warm.set_available(false);
        let turn = ConversationTurn::new("npc-1", "player-1", 1, "a", "b");
        assert!(f.manager.put_turn(&turn).await.is_err());
        assert!(f.manager.put_turn(&turn).await.is_err());
        assert_eq!(f.manager.stats().breaker, CircuitState::Open);

        // Open: writes skipped, reads bypass the store entirely
        assert!(f.manager.put_turn(&turn).await.is_ok());
        assert_eq!(f.manager.stats().skipped_writes, 1);
        assert!(f.manager.recent_turns("npc-1", 5).await.unwrap().is_empty());
        assert_eq!(f.manager.stats().store_failures, 2);
    }

    #[tokio::test]
    async fn test_turn_window_is_bounded() {
        let warm = Arc::new(InMemoryWarmStore::new());
        let cold = Arc::new(InMemoryColdStore::new());
        let config = WarmTierConfig {
            max_recent_turns: 3,
            ..WarmTierConfig::default()
        };
        let manager = WarmTierManager::new(config, warm, cold);
        for i in 1..=5 {
            manager
                .put_turn(&ConversationTurn::new("npc-1", "player-1", i, "in", "out"))
                .await
                .unwrap();
        }
        let ordinals: Vec<_> = manager
            .recent_turns("npc-1", 10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.ordinal)
            .collect();
        assert_eq!(ordinals, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_write_after_cold_start_keeps_archived_history() {
        let f = fixture();
        let old = SalientMemory::new("npc-1", "player-1", "betrayal", "sold us out", 0.9);
        f.cold
            .write_batch(&[ArchiveRecord::Salient(old.clone())])
            .await
            .unwrap();

        // Warm tier is empty, as after a cache restart
        let new = SalientMemory::new("npc-1", "player-1", "gift", "a rose", 0.6);
        f.manager.put_salient(&new).await.unwrap();

        let salient = f.manager.get_salient("npc-1").await.unwrap();
        assert_eq!(salient, vec![old, new]);
        assert_eq!(f.manager.stats().cold_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_unreadable_cold_leaves_list_unseeded() {
        let f = fixture();
        f.cold.set_available(false);
        f.manager
            .put_salient(&SalientMemory::new("npc-1", "player-1", "gift", "a rose", 0.6))
            .await
            .unwrap();
        assert!(f.warm.range("mneme:salient:npc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_turn_window_is_capped() {
        let warm = Arc::new(InMemoryWarmStore::new());
        let cold = Arc::new(InMemoryColdStore::new());
        let config = WarmTierConfig {
            max_recent_turns: 3,
            ..WarmTierConfig::default()
        };
        let manager = WarmTierManager::new(config, warm, cold);
        for i in 0..5 {
            let fact = format!("fact {i}");
            manager
                .put_salient(&SalientMemory::new("npc-1", "player-1", "lore", &fact, 0.5))
                .await
                .unwrap();
            manager
                .put_summary(&summary("npc-1", &fact))
                .await
                .unwrap();
        }
        assert_eq!(manager.get_salient("npc-1").await.unwrap().len(), 5);
        assert_eq!(manager.get_summaries("npc-1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_last_ordinal_reads_warm_and_cold() {
        let f = fixture();
        f.cold
            .write_batch(&[ArchiveRecord::Turn(ConversationTurn::new(
                "npc-1", "player-1", 4, "a", "b",
            ))])
            .await
            .unwrap();
        assert_eq!(f.manager.last_ordinal("npc-1", "player-1").await.unwrap(), Some(4));

        // Cached but not yet archived
        f.manager
            .put_turn(&ConversationTurn::new("npc-1", "player-1", 5, "c", "d"))
            .await
            .unwrap();
        assert_eq!(f.manager.last_ordinal("npc-1", "player-1").await.unwrap(), Some(5));
        assert_eq!(f.manager.last_ordinal("npc-1", "player-2").await.unwrap(), None);

        f.cold.set_available(false);
        assert!(f.manager.last_ordinal("npc-1", "player-1").await.is_err());
    }

    #[tokio::test]
    async fn test_append_needs_existing_list() {
        let store = InMemoryWarmStore::new();
        let ttl = Duration::from_secs(60);
        assert!(!store.append("k", "a".into(), ttl, None).await.unwrap());
        assert!(store.range("k").await.unwrap().is_none());

        assert!(store.seed("k", vec!["a".into()], ttl, None).await.unwrap());
        assert!(!store.seed("k", vec!["z".into()], ttl, None).await.unwrap());
        assert!(store.append("k", "b".into(), ttl, None).await.unwrap());
        assert_eq!(
            store.range("k").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fixed_at_write_time() {
        let store = InMemoryWarmStore::new();
        store
            .set("k", "v".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        // Reading does not extend the expiry
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }
}
