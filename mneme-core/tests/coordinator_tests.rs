//! Residency ceiling under concurrent load

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use mneme_core::archetype::{FileSnapshotStore, RegistrySnapshot, SnapshotStore};
use mneme_core::config::RegistryConfig;
use mneme_core::eval::{synthetic_adapters, synthetic_archetype};
use mneme_core::prelude::*;

const CEILING: u64 = 1_000;

async fn registry(dir: &TempDir, names: &[&str], per_adapter: u64) -> (ArchetypeRegistry, Vec<ArchetypeId>) {
    let registry = ArchetypeRegistry::open(RegistryConfig {
        snapshot_path: dir.path().join("chains.json"),
        adapter_root: dir.path().join("adapters"),
        ..RegistryConfig::default()
    })
    .await
    .unwrap();

    let mut ids = Vec::new();
    for name in names {
        let id = ArchetypeId::new(*name).unwrap();
        registry
            .register(
                synthetic_archetype(&id),
                synthetic_adapters(&id, per_adapter).unwrap(),
                "gpu-0",
            )
            .await
            .unwrap();
        ids.push(id);
    }
    (registry, ids)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resident_bytes_never_exceed_ceiling() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    // 300 bytes per chain, so at most three chains fit
    let (registry, ids) = registry(
        &dir,
        &["guard", "bard", "smith", "healer", "thief"],
        100,
    )
    .await;
    let runtime = Arc::new(StubRuntime::new().with_load_delay(Duration::from_millis(2)));
    let coordinator = AdapterCoordinator::new(registry, runtime.clone(), CEILING);

    let workers: Vec<_> = (0..60)
        .map(|i| {
            let coordinator = coordinator.clone();
            let id = ids[i % ids.len()].clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                match coordinator.ensure_loaded(&id, deadline).await {
                    Ok(lease) => {
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        drop(lease);
                        true
                    }
                    Err(MnemeError::CapacityExceeded(_)) => false,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();

    let mut served = 0;
    for worker in workers {
        if worker.await.unwrap() {
            served += 1;
        }
    }

    assert!(served > 0);
    assert!(runtime.peak_resident_bytes() <= CEILING);
    assert!(coordinator.stats().peak_resident_bytes <= CEILING);
    assert!(coordinator.resident_archetypes().len() <= 3);
}

#[tokio::test]
async fn test_eviction_cycles_through_archetypes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (registry, ids) = registry(&dir, &["guard", "bard", "smith", "healer"], 100).await;
    let runtime = Arc::new(StubRuntime::new());
    let coordinator = AdapterCoordinator::new(registry, runtime.clone(), CEILING);

    for round in 0..3 {
        for id in &ids {
            let deadline = Instant::now() + Duration::from_secs(5);
            let lease = coordinator.ensure_loaded(id, deadline).await.unwrap();
            assert_eq!(lease.archetype(), id, "round {round}");
            assert!(runtime.resident_bytes() <= CEILING);
        }
    }

    // Least recently used chains went first; the three newest remain
    let resident = coordinator.resident_archetypes();
    assert_eq!(resident.len(), 3);
    assert!(!coordinator.is_resident(&ids[0]));
    assert!(runtime.peak_resident_bytes() <= CEILING);
}

/// Snapshot store whose reads take a while
struct SlowStore {
    inner: FileSnapshotStore,
    delay: Duration,
}

#[async_trait]
impl SnapshotStore for SlowStore {
    async fn load(&self) -> mneme_core::Result<Option<RegistrySnapshot>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load().await
    }

    async fn persist(&self, snapshot: &RegistrySnapshot) -> mneme_core::Result<()> {
        self.inner.persist(snapshot).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_patient_caller_outlives_impatient_leader() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (_, ids) = registry(&dir, &["ferryman"], 100).await;

    let slow = ArchetypeRegistry::new(
        RegistryConfig {
            snapshot_path: dir.path().join("chains.json"),
            adapter_root: dir.path().join("adapters"),
            ..RegistryConfig::default()
        },
        Arc::new(SlowStore {
            inner: FileSnapshotStore::new(dir.path().join("chains.json")),
            delay: Duration::from_millis(100),
        }),
    );
    slow.initialize().await.unwrap();
    let coordinator = AdapterCoordinator::new(slow, Arc::new(StubRuntime::new()), CEILING);

    let leader = {
        let coordinator = coordinator.clone();
        let id = ids[0].clone();
        tokio::spawn(async move {
            let short = Instant::now() + Duration::from_millis(20);
            coordinator.ensure_loaded(&id, short).await.map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let waiter = {
        let coordinator = coordinator.clone();
        let id = ids[0].clone();
        tokio::spawn(async move {
            let long = Instant::now() + Duration::from_secs(5);
            coordinator.ensure_loaded(&id, long).await.map(|_| ())
        })
    };

    assert!(matches!(leader.await.unwrap(), Err(MnemeError::Timeout(_))));
    waiter.await.unwrap().unwrap();
    assert!(coordinator.is_resident(&ids[0]));
    assert_eq!(coordinator.stats().loads, 1);
}
