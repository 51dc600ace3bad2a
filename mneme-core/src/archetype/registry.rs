//! Archetype chain registry
//!
//! The registry is the single source of truth for archetype → task → adapter
//! metadata. Writes are validated in full before anything is persisted, then
//! committed by atomically replacing the durable snapshot; in-memory state is
//! only updated after that write succeeds.
//!
//! Reads go through a per-process cache with a short TTL. Registries in other
//! processes observe a new chain at most one TTL after it was written; this
//! bounded staleness is the consistency contract between replicas.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::path::AdapterRoot;
use super::snapshot::{FileSnapshotStore, RegistrySnapshot, SnapshotStore};
use super::types::{AdapterDescriptor, Archetype, ArchetypeChain, ArchetypeId, Task};
use crate::config::RegistryConfig;
use crate::error::{MnemeError, Result};
use crate::singleflight::SingleFlight;

/// Aggregate size of the registered chains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Registered archetype chains
    pub chain_count: usize,
    /// Adapter descriptors across every chain
    pub adapter_count: usize,
    /// Summed adapter footprint in bytes
    pub total_footprint: u64,
}

/// Registry health counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Whether the startup snapshot has been loaded
    pub initialized: bool,
    /// Generation of the latest known snapshot
    pub generation: u64,
    /// Resolves served from the cache
    pub cache_hits: u64,
    /// Resolves that needed a durable read
    pub cache_misses: u64,
    /// Hits over total resolves
    pub cache_hit_rate: f64,
    /// Durable snapshot reads actually performed
    pub durable_reads: u64,
    /// Most recent storage failure
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    chain: ArchetypeChain,
    fetched_at: Instant,
}

struct RegistryInner {
    config: RegistryConfig,
    store: Arc<dyn SnapshotStore>,
    root: AdapterRoot,
    ready: watch::Sender<bool>,
    writer: tokio::sync::Mutex<()>,
    registering: Mutex<HashSet<ArchetypeId>>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    cache: RwLock<HashMap<ArchetypeId, CacheEntry>>,
    reads: SingleFlight<ArchetypeId, Option<ArchetypeChain>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    durable_reads: AtomicU64,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Registry of archetype chains.
///
/// Cloning is cheap; every clone shares the same state. Construct one per
/// process at startup and hand it to the components that need it.
#[derive(Clone)]
pub struct ArchetypeRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ArchetypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchetypeRegistry")
            .field("adapter_root", &self.inner.root.path())
            .field("writer", &self.inner.config.writer)
            .field("generation", &self.inner.snapshot.read().generation)
            .finish()
    }
}

/// Removes the archetype from the registering set when dropped
struct RegisteringGuard<'a> {
    set: &'a Mutex<HashSet<ArchetypeId>>,
    id: ArchetypeId,
}

impl Drop for RegisteringGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl ArchetypeRegistry {
    /// Create a registry over an explicit snapshot store.
    ///
    /// The registry starts closed: every operation waits until
    /// [`initialize`](Self::initialize) has loaded the durable snapshot.
    pub fn new(config: RegistryConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let (ready, _) = watch::channel(false);
        let root = AdapterRoot::new(config.adapter_root.clone());
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                root,
                ready,
                writer: tokio::sync::Mutex::new(()),
                registering: Mutex::new(HashSet::new()),
                snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
                cache: RwLock::new(HashMap::new()),
                reads: SingleFlight::new(),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                durable_reads: AtomicU64::new(0),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Create and initialize a registry backed by the configured snapshot file
    pub async fn open(config: RegistryConfig) -> Result<Self> {
        let store = Arc::new(FileSnapshotStore::new(config.snapshot_path.clone()));
        let registry = Self::new(config, store);
        registry.initialize().await?;
        Ok(registry)
    }

    /// Load the durable snapshot and open the initialization gate
    pub async fn initialize(&self) -> Result<()> {
        let loaded = match self.inner.store.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        self.inner.durable_reads.fetch_add(1, Ordering::Relaxed);

        let snapshot = loaded.unwrap_or_else(RegistrySnapshot::empty);
        info!(
            generation = snapshot.generation,
            chains = snapshot.chains.len(),
            "Registry snapshot loaded"
        );
        *self.inner.snapshot.write() = Arc::new(snapshot);
        self.inner.ready.send_replace(true);
        Ok(())
    }

    /// Whether the startup snapshot has been loaded
    pub fn is_initialized(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// How long writes wait for the startup snapshot
    pub fn init_timeout(&self) -> std::time::Duration {
        self.inner.config.init_timeout
    }

    /// The approved adapter root
    pub fn adapter_root(&self) -> &AdapterRoot {
        &self.inner.root
    }

    /// Register a complete chain for `archetype`.
    ///
    /// Validation runs in full before anything is written: completeness,
    /// descriptor fields, path containment, then immutability of published
    /// descriptors. Re-registering identical content is a no-op success.
    ///
    /// # Errors
    ///
    /// - [`MnemeError::IncompleteChain`] when a required task has no descriptor
    /// - [`MnemeError::InvalidRecord`] when a descriptor is malformed
    /// - [`MnemeError::InvalidPath`] when a descriptor path leaves the adapter root
    /// - [`MnemeError::Conflict`] on a concurrent register for the same
    ///   archetype, a changed descriptor reusing a published `id@version`,
    ///   or when this instance is a read replica
    /// - [`MnemeError::StorageUnavailable`] when the snapshot write fails
    pub async fn register(
        &self,
        archetype: Archetype,
        adapters: BTreeMap<Task, AdapterDescriptor>,
        runtime_target: impl Into<String>,
    ) -> Result<ArchetypeChain> {
        let deadline = Instant::now() + self.inner.config.init_timeout;
        self.wait_ready(deadline).await?;

        if !self.inner.config.writer {
            return Err(MnemeError::Conflict(
                "this registry instance is a read replica and does not own the snapshot".to_string(),
            ));
        }

        let chain = ArchetypeChain {
            archetype,
            adapters,
            runtime_target: runtime_target.into(),
            registered_at: Utc::now(),
        };
        self.validate_chain(&chain)?;

        let id = chain.id().clone();
        let _guard = self.claim(&id)?;
        let _writer = self.inner.writer.lock().await;

        let current = Arc::clone(&self.inner.snapshot.read());
        if let Some(existing) = current.chains.get(&id) {
            if existing.same_content(&chain) {
                debug!(archetype = %id, "Identical chain already registered");
                return Ok(existing.clone());
            }
        }
        check_immutability(&current, &chain)?;

        let next = current.with_chain(chain.clone())?;
        if let Err(e) = self.inner.store.persist(&next).await {
            self.record_failure(&e);
            warn!(archetype = %id, error = %e, "Registry snapshot write failed");
            return Err(e);
        }

        let generation = next.generation;
        *self.inner.snapshot.write() = Arc::new(next);
        self.inner.cache.write().insert(
            id.clone(),
            CacheEntry {
                chain: chain.clone(),
                fetched_at: Instant::now(),
            },
        );

        info!(
            archetype = %id,
            generation,
            footprint = chain.footprint_bytes(),
            "Archetype chain registered"
        );
        Ok(chain)
    }

    /// Resolve the chain for `archetype`, waiting no later than `deadline`.
    ///
    /// Cached entries younger than the TTL are served directly. Concurrent
    /// misses for one archetype share a single durable read.
    ///
    /// # Errors
    ///
    /// - [`MnemeError::NotFound`] when no chain is registered
    /// - [`MnemeError::Timeout`] when the deadline elapses first
    /// - [`MnemeError::StorageUnavailable`] when the snapshot cannot be read
    pub async fn resolve(&self, archetype: &ArchetypeId, deadline: Instant) -> Result<ArchetypeChain> {
        self.wait_ready(deadline).await?;

        if let Some(chain) = self.cached(archetype) {
            self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(chain);
        }
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
        debug!(archetype = %archetype, "Registry cache miss");

        let inner = Arc::clone(&self.inner);
        let key = archetype.clone();
        let found = self
            .inner
            .reads
            .run(archetype.clone(), deadline, move || async move {
                read_through(inner, key).await
            })
            .await?;

        found.ok_or_else(|| MnemeError::NotFound(format!("archetype '{}'", archetype)))
    }

    /// Size of every registered chain, from the latest known snapshot
    pub fn memory_stats(&self) -> MemoryStats {
        let snapshot = self.inner.snapshot.read();
        MemoryStats {
            chain_count: snapshot.chains.len(),
            adapter_count: snapshot.chains.values().map(|c| c.adapters.len()).sum(),
            total_footprint: snapshot.chains.values().map(|c| c.footprint_bytes()).sum(),
        }
    }

    /// Archetypes in the latest known snapshot
    pub fn archetypes(&self) -> Vec<ArchetypeId> {
        self.inner.snapshot.read().chains.keys().cloned().collect()
    }

    /// Health counters
    pub fn stats(&self) -> RegistryStats {
        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RegistryStats {
            initialized: self.is_initialized(),
            generation: self.inner.snapshot.read().generation,
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            durable_reads: self.inner.durable_reads.load(Ordering::Relaxed),
            last_failure_at: *self.inner.last_failure.lock(),
        }
    }

    async fn wait_ready(&self, deadline: Instant) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let mut rx = self.inner.ready.subscribe();
        match tokio::time::timeout_at(deadline, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MnemeError::Other("registry shut down".to_string())),
            Err(_) => Err(MnemeError::Timeout(
                "registry snapshot has not finished loading".to_string(),
            )),
        }
    }

    fn cached(&self, archetype: &ArchetypeId) -> Option<ArchetypeChain> {
        let cache = self.inner.cache.read();
        cache
            .get(archetype)
            .filter(|entry| entry.fetched_at.elapsed() < self.inner.config.cache_ttl)
            .map(|entry| entry.chain.clone())
    }

    fn claim(&self, id: &ArchetypeId) -> Result<RegisteringGuard<'_>> {
        let mut registering = self.inner.registering.lock();
        if !registering.insert(id.clone()) {
            return Err(MnemeError::Conflict(format!(
                "archetype '{}' is already being registered",
                id
            )));
        }
        Ok(RegisteringGuard {
            set: &self.inner.registering,
            id: id.clone(),
        })
    }

    fn validate_chain(&self, chain: &ArchetypeChain) -> Result<()> {
        let missing = chain.missing_tasks();
        if !missing.is_empty() {
            return Err(MnemeError::IncompleteChain {
                archetype: chain.id().to_string(),
                missing: missing.iter().map(|t| t.to_string()).collect(),
            });
        }

        for (task, descriptor) in &chain.adapters {
            if descriptor.task != *task {
                return Err(MnemeError::InvalidRecord(format!(
                    "adapter '{}' is filed under task '{}' but declares '{}'",
                    descriptor.id, task, descriptor.task
                )));
            }
            if descriptor.archetype != *chain.id() {
                return Err(MnemeError::InvalidRecord(format!(
                    "adapter '{}' belongs to archetype '{}', not '{}'",
                    descriptor.id,
                    descriptor.archetype,
                    chain.id()
                )));
            }
            descriptor.validate()?;
        }

        for descriptor in chain.adapters.values() {
            self.inner.root.resolve(&descriptor.path)?;
        }
        Ok(())
    }

    fn record_failure(&self, error: &MnemeError) {
        record_failure(&self.inner, error);
    }
}

fn record_failure(inner: &RegistryInner, error: &MnemeError) {
    if error.is_transient() {
        *inner.last_failure.lock() = Some(Utc::now());
    }
}

/// A published `id@version` may never change its metadata
fn check_immutability(current: &RegistrySnapshot, chain: &ArchetypeChain) -> Result<()> {
    let published: HashMap<String, &AdapterDescriptor> = current
        .chains
        .values()
        .flat_map(|c| c.adapters.values())
        .map(|d| (d.versioned_key(), d))
        .collect();

    for descriptor in chain.adapters.values() {
        if let Some(existing) = published.get(&descriptor.versioned_key()) {
            if *existing != descriptor {
                return Err(MnemeError::Conflict(format!(
                    "adapter '{}' is already published with different metadata",
                    descriptor.versioned_key()
                )));
            }
        }
    }
    Ok(())
}

/// Durable read on cache miss; refreshes the snapshot and cache.
///
/// A read that raced a newer local write must not win: when the loaded
/// snapshot is older than the one already known, the known chain is served
/// and cached instead.
async fn read_through(
    inner: Arc<RegistryInner>,
    archetype: ArchetypeId,
) -> Result<Option<ArchetypeChain>> {
    let loaded = match inner.store.load().await {
        Ok(loaded) => loaded,
        Err(e) => {
            record_failure(&inner, &e);
            warn!(archetype = %archetype, error = %e, "Registry durable read failed");
            return Err(e);
        }
    };
    inner.durable_reads.fetch_add(1, Ordering::Relaxed);

    let loaded = loaded.unwrap_or_else(RegistrySnapshot::empty);
    let mut known = inner.snapshot.write();
    if loaded.generation > known.generation {
        *known = Arc::new(loaded);
    } else if loaded.generation < known.generation {
        debug!(
            archetype = %archetype,
            loaded = loaded.generation,
            known = known.generation,
            "Discarding stale snapshot read"
        );
    }

    let chain = known.chains.get(&archetype).cloned();
    if let Some(chain) = &chain {
        inner.cache.write().insert(
            archetype.clone(),
            CacheEntry {
                chain: chain.clone(),
                fetched_at: Instant::now(),
            },
        );
    }
    Ok(chain)
}
