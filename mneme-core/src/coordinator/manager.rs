//! Resident adapter set management
//!
//! The coordinator keeps the adapters of recently used archetypes resident on
//! the inference runtime while holding their summed footprint under a fixed
//! ceiling. Capacity accounting lives behind one mutex that is only held for
//! the bookkeeping itself; runtime load and unload calls happen outside it.
//!
//! Bytes are counted against the ceiling from the moment a load is planned
//! until the matching unload has completed, so the runtime never holds more
//! than the ceiling even while one archetype is swapped for another.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::runtime::InferenceRuntime;
use crate::archetype::{ArchetypeChain, ArchetypeId, ArchetypeRegistry};
use crate::error::{MnemeError, Result};
use crate::singleflight::SingleFlight;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Loading,
    Resident,
}

#[derive(Debug)]
struct ResidentEntry {
    chain: ArchetypeChain,
    footprint: u64,
    last_used: Instant,
    in_use: usize,
    state: EntryState,
}

#[derive(Debug, Default)]
struct ResidentSet {
    entries: HashMap<ArchetypeId, ResidentEntry>,
    /// Footprint of every entry, loading or resident
    reserved: u64,
    /// Footprint of evicted chains whose unload has not finished
    releasing: u64,
    peak: u64,
}

impl ResidentSet {
    fn committed(&self) -> u64 {
        self.reserved + self.releasing
    }

    /// Idle resident entries in eviction order: oldest use first, then id
    fn eviction_order(&self) -> Vec<(ArchetypeId, u64)> {
        let mut idle: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Resident && e.in_use == 0)
            .map(|(id, e)| (e.last_used, id.clone(), e.footprint))
            .collect();
        idle.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        idle.into_iter().map(|(_, id, fp)| (id, fp)).collect()
    }
}

/// Coordinator health counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Configured ceiling
    pub ceiling_bytes: u64,
    /// Bytes currently committed (resident, loading, or still unloading)
    pub resident_bytes: u64,
    /// Highest committed byte count observed
    pub peak_resident_bytes: u64,
    /// Archetypes with a resident or loading chain
    pub resident_archetypes: usize,
    /// Archetypes with at least one live lease
    pub leased_archetypes: usize,
    /// Chains loaded onto the runtime
    pub loads: u64,
    /// Chains evicted from the runtime
    pub evictions: u64,
    /// Loads refused for lack of capacity
    pub capacity_rejections: u64,
    /// Loads that failed at the runtime
    pub load_failures: u64,
    /// Most recent load failure
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct CoordinatorInner {
    registry: ArchetypeRegistry,
    runtime: Arc<dyn InferenceRuntime>,
    ceiling: u64,
    /// Budget of a shared load, independent of any caller's deadline
    load_timeout: Duration,
    resident: Mutex<ResidentSet>,
    loads: SingleFlight<ArchetypeId, ()>,
    load_count: AtomicU64,
    evictions: AtomicU64,
    capacity_rejections: AtomicU64,
    load_failures: AtomicU64,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Keeps archetype chains resident on the inference runtime under a ceiling
#[derive(Clone)]
pub struct AdapterCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for AdapterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resident = self.inner.resident.lock();
        f.debug_struct("AdapterCoordinator")
            .field("ceiling", &self.inner.ceiling)
            .field("reserved", &resident.reserved)
            .field("archetypes", &resident.entries.len())
            .finish()
    }
}

/// Proof that an archetype's chain is resident.
///
/// While any lease for an archetype is alive, that archetype is never chosen
/// for eviction. Dropping the lease refreshes its last-use time.
pub struct AdapterLease {
    inner: Arc<CoordinatorInner>,
    chain: ArchetypeChain,
}

impl AdapterLease {
    /// Archetype the lease covers
    pub fn archetype(&self) -> &ArchetypeId {
        self.chain.id()
    }

    /// The resident chain
    pub fn chain(&self) -> &ArchetypeChain {
        &self.chain
    }
}

impl std::fmt::Debug for AdapterLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterLease")
            .field("archetype", self.chain.id())
            .finish()
    }
}

impl Drop for AdapterLease {
    fn drop(&mut self) {
        let mut resident = self.inner.resident.lock();
        if let Some(entry) = resident.entries.get_mut(self.chain.id()) {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

impl AdapterCoordinator {
    /// Create a coordinator with a capacity ceiling in bytes
    pub fn new(registry: ArchetypeRegistry, runtime: Arc<dyn InferenceRuntime>, ceiling: u64) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                load_timeout: registry.init_timeout(),
                registry,
                runtime,
                ceiling,
                resident: Mutex::new(ResidentSet::default()),
                loads: SingleFlight::new(),
                load_count: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                capacity_rejections: AtomicU64::new(0),
                load_failures: AtomicU64::new(0),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Make sure `archetype`'s chain is resident and lease it.
    ///
    /// A resident chain is leased without touching the runtime. Otherwise
    /// least-recently-used idle archetypes are evicted until the chain fits,
    /// and its adapters are loaded. Concurrent calls for the same archetype
    /// share one load. `deadline` bounds only this caller's wait: a caller
    /// that gives up leaves the load running for the others.
    ///
    /// # Errors
    ///
    /// - [`MnemeError::CapacityExceeded`] when the chain cannot fit even after
    ///   evicting every idle archetype
    /// - [`MnemeError::Timeout`] when the deadline elapses
    /// - [`MnemeError::NotFound`] when the archetype has no registered chain
    pub async fn ensure_loaded(&self, archetype: &ArchetypeId, deadline: Instant) -> Result<AdapterLease> {
        loop {
            if let Some(lease) = self.try_lease(archetype) {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                return Err(MnemeError::Timeout(format!(
                    "archetype '{}' did not become resident before the deadline",
                    archetype
                )));
            }

            let inner = Arc::clone(&self.inner);
            let id = archetype.clone();
            self.inner
                .loads
                .run(archetype.clone(), deadline, move || async move {
                    let budget = Instant::now() + inner.load_timeout;
                    load_chain(inner, id, budget).await
                })
                .await?;
        }
    }

    /// Evict an archetype's chain.
    ///
    /// Returns `false` when the archetype was not resident.
    ///
    /// # Errors
    ///
    /// Returns [`MnemeError::InUse`] when the archetype has live leases or is
    /// still loading.
    pub async fn evict(&self, archetype: &ArchetypeId) -> Result<bool> {
        let chain = {
            let mut resident = self.inner.resident.lock();
            let Some(entry) = resident.entries.get(archetype) else {
                return Ok(false);
            };
            if entry.state == EntryState::Loading || entry.in_use > 0 {
                return Err(MnemeError::InUse(format!(
                    "archetype '{}' has {} live lease(s)",
                    archetype, entry.in_use
                )));
            }
            let Some(entry) = resident.entries.remove(archetype) else {
                return Ok(false);
            };
            resident.reserved -= entry.footprint;
            resident.releasing += entry.footprint;
            entry.chain
        };

        unload_chains(&self.inner, vec![chain]).await;
        Ok(true)
    }

    /// Whether an archetype's chain is resident
    pub fn is_resident(&self, archetype: &ArchetypeId) -> bool {
        self.inner
            .resident
            .lock()
            .entries
            .get(archetype)
            .is_some_and(|e| e.state == EntryState::Resident)
    }

    /// Resident archetypes, sorted by id
    pub fn resident_archetypes(&self) -> Vec<ArchetypeId> {
        let resident = self.inner.resident.lock();
        let mut ids: Vec<_> = resident
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Resident)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Registry chains are resolved from
    pub fn registry(&self) -> &ArchetypeRegistry {
        &self.inner.registry
    }

    /// Configured ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.inner.ceiling
    }

    /// Health counters
    pub fn stats(&self) -> CoordinatorStats {
        let resident = self.inner.resident.lock();
        CoordinatorStats {
            ceiling_bytes: self.inner.ceiling,
            resident_bytes: resident.committed(),
            peak_resident_bytes: resident.peak,
            resident_archetypes: resident.entries.len(),
            leased_archetypes: resident.entries.values().filter(|e| e.in_use > 0).count(),
            loads: self.inner.load_count.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            capacity_rejections: self.inner.capacity_rejections.load(Ordering::Relaxed),
            load_failures: self.inner.load_failures.load(Ordering::Relaxed),
            last_failure_at: *self.inner.last_failure.lock(),
        }
    }

    fn try_lease(&self, archetype: &ArchetypeId) -> Option<AdapterLease> {
        let mut resident = self.inner.resident.lock();
        let entry = resident.entries.get_mut(archetype)?;
        if entry.state != EntryState::Resident {
            return None;
        }
        entry.in_use += 1;
        entry.last_used = Instant::now();
        Some(AdapterLease {
            inner: Arc::clone(&self.inner),
            chain: entry.chain.clone(),
        })
    }
}

/// Plan room for `chain`, evict the victims, then load its adapters
async fn load_chain(inner: Arc<CoordinatorInner>, archetype: ArchetypeId, budget: Instant) -> Result<()> {
    let chain = inner.registry.resolve(&archetype, budget).await?;
    let footprint = chain.footprint_bytes();

    let victims = {
        let mut resident = inner.resident.lock();
        if resident.entries.contains_key(&archetype) {
            return Ok(());
        }

        let victims = match plan_victims(&resident, footprint, inner.ceiling) {
            Some(victims) => victims,
            None => {
                drop(resident);
                inner.capacity_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(
                    archetype = %archetype,
                    footprint,
                    ceiling = inner.ceiling,
                    "No idle archetypes left to evict"
                );
                return Err(MnemeError::CapacityExceeded(format!(
                    "archetype '{}' needs {} bytes; ceiling is {} and every resident archetype is in use",
                    archetype, footprint, inner.ceiling
                )));
            }
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in &victims {
            if let Some(entry) = resident.entries.remove(victim) {
                resident.reserved -= entry.footprint;
                resident.releasing += entry.footprint;
                evicted.push(entry.chain);
            }
        }

        resident.entries.insert(
            archetype.clone(),
            ResidentEntry {
                chain: chain.clone(),
                footprint,
                last_used: Instant::now(),
                in_use: 0,
                state: EntryState::Loading,
            },
        );
        resident.reserved += footprint;
        resident.peak = resident.peak.max(resident.committed());
        evicted
    };

    if !victims.is_empty() {
        debug!(
            archetype = %archetype,
            victims = victims.len(),
            "Evicting least recently used archetypes"
        );
        unload_chains(&inner, victims).await;
    }

    let mut loaded = Vec::with_capacity(chain.adapters.len());
    for descriptor in chain.adapters.values() {
        if let Err(e) = inner.runtime.load_adapter(descriptor).await {
            warn!(
                archetype = %archetype,
                adapter = %descriptor.id,
                error = %e,
                "Adapter load failed, rolling back"
            );
            for id in &loaded {
                if let Err(unload_err) = inner.runtime.unload_adapter(id).await {
                    warn!(adapter = %id, error = %unload_err, "Rollback unload failed");
                }
            }
            {
                let mut resident = inner.resident.lock();
                if resident.entries.remove(&archetype).is_some() {
                    resident.reserved -= footprint;
                }
            }
            inner.load_failures.fetch_add(1, Ordering::Relaxed);
            *inner.last_failure.lock() = Some(Utc::now());
            return Err(e);
        }
        loaded.push(descriptor.id.clone());
    }

    {
        let mut resident = inner.resident.lock();
        if let Some(entry) = resident.entries.get_mut(&archetype) {
            entry.state = EntryState::Resident;
            entry.last_used = Instant::now();
        }
    }
    inner.load_count.fetch_add(1, Ordering::Relaxed);
    info!(archetype = %archetype, footprint, "Archetype chain resident");
    Ok(())
}

/// Idle archetypes to evict so `footprint` fits; `None` when impossible
fn plan_victims(resident: &ResidentSet, footprint: u64, ceiling: u64) -> Option<Vec<ArchetypeId>> {
    if footprint > ceiling {
        return None;
    }
    let mut needed = (resident.committed() + footprint).saturating_sub(ceiling);
    let mut victims = Vec::new();
    for (id, size) in resident.eviction_order() {
        if needed == 0 {
            break;
        }
        needed = needed.saturating_sub(size);
        victims.push(id);
    }
    (needed == 0).then_some(victims)
}

async fn unload_chains(inner: &CoordinatorInner, chains: Vec<ArchetypeChain>) {
    for chain in chains {
        for descriptor in chain.adapters.values() {
            if let Err(e) = inner.runtime.unload_adapter(&descriptor.id).await {
                warn!(
                    archetype = %chain.id(),
                    adapter = %descriptor.id,
                    error = %e,
                    "Adapter unload failed"
                );
            }
        }
        inner.resident.lock().releasing -= chain.footprint_bytes();
        inner.evictions.fetch_add(1, Ordering::Relaxed);
        info!(archetype = %chain.id(), "Archetype chain evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{AdapterDescriptor, AdapterId, Archetype, Task};
    use crate::config::RegistryConfig;
    use crate::coordinator::StubRuntime;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: ArchetypeRegistry,
        runtime: Arc<StubRuntime>,
    }

    async fn fixture(runtime: StubRuntime) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = ArchetypeRegistry::open(RegistryConfig {
            snapshot_path: dir.path().join("chains.json"),
            adapter_root: dir.path().join("adapters"),
            ..RegistryConfig::default()
        })
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            registry,
            runtime: Arc::new(runtime),
        }
    }

    async fn register(registry: &ArchetypeRegistry, id: &str, per_adapter: u64) -> ArchetypeId {
        let archetype_id = ArchetypeId::new(id).unwrap();
        let adapters: BTreeMap<_, _> = Task::ALL
            .into_iter()
            .map(|task| {
                (
                    task,
                    AdapterDescriptor {
                        id: AdapterId::new(format!("{}-{}", id, task)).unwrap(),
                        archetype: archetype_id.clone(),
                        task,
                        path: PathBuf::from(format!("{}/{}", id, task)),
                        base_model: "base-7b".to_string(),
                        rank: 8,
                        footprint_bytes: per_adapter,
                        version: "1.0.0".to_string(),
                        provenance: None,
                    },
                )
            })
            .collect();
        registry
            .register(Archetype::new(archetype_id.clone(), id), adapters, "runtime-a")
            .await
            .unwrap();
        archetype_id
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let f = fixture(StubRuntime::new()).await;
        let vampire = register(&f.registry, "vampire", 10).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 1_000);

        drop(coordinator.ensure_loaded(&vampire, deadline()).await.unwrap());
        drop(coordinator.ensure_loaded(&vampire, deadline()).await.unwrap());

        assert_eq!(f.runtime.load_calls(), 3);
        assert_eq!(coordinator.stats().loads, 1);
        assert_eq!(coordinator.stats().resident_bytes, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_loaded_shares_one_load() {
        let f = fixture(StubRuntime::new().with_load_delay(Duration::from_millis(20))).await;
        let vampire = register(&f.registry, "vampire", 10).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 1_000);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let vampire = vampire.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_loaded(&vampire, deadline()).await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(f.runtime.load_calls(), 3);
    }

    #[tokio::test]
    async fn test_lru_eviction_makes_room() {
        let f = fixture(StubRuntime::new()).await;
        let a = register(&f.registry, "aswang", 10).await;
        let b = register(&f.registry, "banshee", 10).await;
        let c = register(&f.registry, "cyclops", 10).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 60);

        drop(coordinator.ensure_loaded(&a, deadline()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(coordinator.ensure_loaded(&b, deadline()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch a so b becomes least recently used
        drop(coordinator.ensure_loaded(&a, deadline()).await.unwrap());

        drop(coordinator.ensure_loaded(&c, deadline()).await.unwrap());
        assert_eq!(coordinator.resident_archetypes(), vec![a, c]);
        assert_eq!(coordinator.stats().evictions, 1);
        assert!(f.runtime.peak_resident_bytes() <= 60);
    }

    #[tokio::test]
    async fn test_in_use_archetype_is_never_evicted() {
        let f = fixture(StubRuntime::new()).await;
        let a = register(&f.registry, "aswang", 10).await;
        let b = register(&f.registry, "banshee", 10).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 30);

        let lease = coordinator.ensure_loaded(&a, deadline()).await.unwrap();
        assert!(matches!(
            coordinator.ensure_loaded(&b, deadline()).await,
            Err(MnemeError::CapacityExceeded(_))
        ));
        assert!(matches!(
            coordinator.evict(&a).await,
            Err(MnemeError::InUse(_))
        ));

        drop(lease);
        drop(coordinator.ensure_loaded(&b, deadline()).await.unwrap());
        assert_eq!(coordinator.resident_archetypes(), vec![b]);
    }

    #[tokio::test]
    async fn test_chain_larger_than_ceiling_rejected() {
        let f = fixture(StubRuntime::new()).await;
        let giant = register(&f.registry, "giant", 100).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 200);

        assert!(matches!(
            coordinator.ensure_loaded(&giant, deadline()).await,
            Err(MnemeError::CapacityExceeded(_))
        ));
        assert_eq!(f.runtime.load_calls(), 0);
        assert_eq!(coordinator.stats().capacity_rejections, 1);
    }

    #[tokio::test]
    async fn test_failed_load_rolls_back() {
        let f = fixture(StubRuntime::new()).await;
        let ghoul = register(&f.registry, "ghoul", 10).await;
        f.runtime
            .fail_loads_of(AdapterId::new("ghoul-dialogue").unwrap());
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 100);

        assert!(coordinator.ensure_loaded(&ghoul, deadline()).await.is_err());
        assert_eq!(f.runtime.resident_bytes(), 0);
        assert_eq!(coordinator.stats().resident_bytes, 0);
        assert!(!coordinator.is_resident(&ghoul));
        assert!(coordinator.stats().last_failure_at.is_some());

        f.runtime.clear_failures();
        drop(coordinator.ensure_loaded(&ghoul, deadline()).await.unwrap());
        assert!(coordinator.is_resident(&ghoul));
    }

    #[tokio::test]
    async fn test_explicit_evict() {
        let f = fixture(StubRuntime::new()).await;
        let ghoul = register(&f.registry, "ghoul", 10).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 100);

        assert!(!coordinator.evict(&ghoul).await.unwrap());
        drop(coordinator.ensure_loaded(&ghoul, deadline()).await.unwrap());
        assert!(coordinator.evict(&ghoul).await.unwrap());
        assert_eq!(f.runtime.resident_bytes(), 0);
        assert_eq!(coordinator.stats().resident_bytes, 0);
        assert_eq!(f.runtime.unload_calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_archetype_not_found() {
        let f = fixture(StubRuntime::new()).await;
        let coordinator = AdapterCoordinator::new(f.registry.clone(), f.runtime.clone(), 100);
        assert!(matches!(
            coordinator
                .ensure_loaded(&ArchetypeId::new("kraken").unwrap(), deadline())
                .await,
            Err(MnemeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_impatient_caller_does_not_fail_shared_load() {
        let f = fixture(StubRuntime::new()).await;
        register(&f.registry, "ghoul", 10).await;

        // A second process over the same snapshot, still behind its startup gate
        let snapshot_path = f._dir.path().join("chains.json");
        let registry = ArchetypeRegistry::new(
            RegistryConfig {
                snapshot_path: snapshot_path.clone(),
                adapter_root: f._dir.path().join("adapters"),
                ..RegistryConfig::default()
            },
            Arc::new(crate::archetype::FileSnapshotStore::new(snapshot_path)),
        );
        let runtime = Arc::new(StubRuntime::new());
        let coordinator = AdapterCoordinator::new(registry.clone(), runtime, 1_000);
        let ghoul = ArchetypeId::new("ghoul").unwrap();

        let impatient = {
            let coordinator = coordinator.clone();
            let ghoul = ghoul.clone();
            tokio::spawn(async move {
                let short = Instant::now() + Duration::from_millis(30);
                coordinator.ensure_loaded(&ghoul, short).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let patient = {
            let coordinator = coordinator.clone();
            let ghoul = ghoul.clone();
            tokio::spawn(async move { coordinator.ensure_loaded(&ghoul, deadline()).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.initialize().await.unwrap();

        assert!(matches!(
            impatient.await.unwrap(),
            Err(MnemeError::Timeout(_))
        ));
        patient.await.unwrap().unwrap();
        assert!(coordinator.is_resident(&ghoul));
    }

    #[test]
    fn test_equal_last_use_breaks_ties_by_id() {
        let now = Instant::now();
        let mut set = ResidentSet::default();
        for id in ["wight", "banshee", "lich"] {
            let archetype = ArchetypeId::new(id).unwrap();
            set.entries.insert(
                archetype.clone(),
                ResidentEntry {
                    chain: ArchetypeChain {
                        archetype: Archetype::new(archetype, id),
                        adapters: BTreeMap::new(),
                        runtime_target: "runtime-a".to_string(),
                        registered_at: Utc::now(),
                    },
                    footprint: 10,
                    last_used: now,
                    in_use: 0,
                    state: EntryState::Resident,
                },
            );
            set.reserved += 10;
        }

        let victims = plan_victims(&set, 15, 40).unwrap();
        let names: Vec<_> = victims.iter().map(|v| v.as_str().to_string()).collect();
        assert_eq!(names, vec!["banshee"]);
    }
}
