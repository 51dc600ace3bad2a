//! End-to-end acceptance scenarios

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mneme_core::config::{ColdTierConfig, GIB};
use mneme_core::eval::{synthetic_adapters, synthetic_archetype};
use mneme_core::memory::ConversationTurn;
use mneme_core::prelude::*;
use mneme_core::resilience::RetryConfig;

const MIB: u64 = 1024 * 1024;

fn config(dir: &TempDir) -> MnemeConfig {
    let mut config = MnemeConfig::default();
    config.registry.snapshot_path = dir.path().join("registry/chains.json");
    config.registry.adapter_root = dir.path().join("adapters");
    config.cold.flush_interval = Duration::from_millis(20);
    std::fs::create_dir_all(&config.registry.adapter_root).expect("Failed to create adapter root");
    config
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test]
async fn scenario_a_registered_chain_resolves() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let system = MnemeSystem::start(config(&dir), Arc::new(StubRuntime::new()))
        .await
        .unwrap();
    let id = ArchetypeId::new("blacksmith").unwrap();
    let adapters = synthetic_adapters(&id, 64 * MIB).unwrap();

    system
        .registry()
        .register(synthetic_archetype(&id), adapters.clone(), "gpu-0")
        .await
        .unwrap();

    let chain = system.registry().resolve(&id, deadline()).await.unwrap();
    assert!(chain.is_complete());
    assert_eq!(chain.adapters, adapters);
    assert_eq!(chain.runtime_target, "gpu-0");
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_b_incomplete_chain_is_never_visible() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let system = MnemeSystem::start(config(&dir), Arc::new(StubRuntime::new()))
        .await
        .unwrap();
    let id = ArchetypeId::new("vampire").unwrap();
    let mut adapters = synthetic_adapters(&id, 64 * MIB).unwrap();
    adapters.remove(&Task::Combat);

    let err = system
        .registry()
        .register(synthetic_archetype(&id), adapters, "gpu-0")
        .await
        .unwrap_err();
    match err {
        MnemeError::IncompleteChain { missing, .. } => assert_eq!(missing, vec!["combat"]),
        other => panic!("expected IncompleteChain, got {other:?}"),
    }

    assert!(matches!(
        system.registry().resolve(&id, deadline()).await,
        Err(MnemeError::NotFound(_))
    ));
    system.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_c_five_hundred_agents_stay_within_bounds() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = config(&dir);
    config.coordinator.ceiling_bytes = GIB;
    config.eval.turns_per_agent = 3;
    let system = MnemeSystem::start(config.clone(), Arc::new(StubRuntime::new()))
        .await
        .unwrap();

    let id = ArchetypeId::new("villager").unwrap();
    system
        .registry()
        .register(
            synthetic_archetype(&id),
            synthetic_adapters(&id, 100 * MIB).unwrap(),
            "gpu-0",
        )
        .await
        .unwrap();

    let harness = EvalHarness::new(system.pipeline().clone(), config.eval.clone());
    let report = harness.run_scenario(&id, 500).await.unwrap();

    assert_eq!(report.metrics.agents, 500);
    assert_eq!(report.metrics.turns_completed, 1_500);
    assert!(report.metrics.peak_resident_bytes <= GIB);
    assert!(report.metrics.p95_latency <= config.eval.gates.max_p95_latency);
    assert!(report.passed, "{:?}", report.failed_gates);

    system.shutdown().await.unwrap();
}

fn outage_config() -> ColdTierConfig {
    ColdTierConfig {
        queue_capacity: 1_000,
        batch_size: 128,
        flush_interval: Duration::from_millis(10),
        retry: RetryConfig::default()
            .with_initial_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(50)),
        ..ColdTierConfig::default()
    }
}

fn turn(index: u64) -> ArchiveRecord {
    let agent = format!("npc-{:03}", index % 100);
    ArchiveRecord::Turn(ConversationTurn::new(
        agent,
        "player-1",
        index / 100 + 1,
        "where is the mill",
        "past the bridge",
    ))
}

#[tokio::test]
async fn scenario_d_outage_loses_no_records() {
    let store = Arc::new(InMemoryColdStore::new());
    let archiver = ColdTierArchiver::new(outage_config(), store.clone());

    store.set_available(false);
    for i in 0..1_000 {
        archiver.enqueue(turn(i)).unwrap();
    }
    for _ in 0..3 {
        assert!(archiver.flush_batch().await.is_err());
    }
    assert_eq!(archiver.queue_depth(), 1_000);
    assert!(archiver.dead_letters().is_empty());

    store.set_available(true);
    assert_eq!(archiver.drain().await.unwrap(), 1_000);
    assert_eq!(store.count().await.unwrap(), 1_000);
    assert_eq!(archiver.queue_depth(), 0);
    assert!(archiver.dead_letters().is_empty());
}

#[tokio::test]
async fn scenario_d_background_loop_recovers_after_outage() {
    let store = Arc::new(InMemoryColdStore::new());
    let archiver = Arc::new(ColdTierArchiver::new(outage_config(), store.clone()));
    let cancel = CancellationToken::new();

    store.set_available(false);
    let handle = tokio::spawn(Arc::clone(&archiver).run(cancel.clone()));
    for i in 0..1_000 {
        archiver.enqueue(turn(i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.count().await.is_err());
    assert_eq!(archiver.queue_depth(), 1_000);

    store.set_available(true);
    let recovered = tokio::time::timeout(Duration::from_secs(10), async {
        while archiver.queue_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recovered.is_ok(), "archiver did not drain after recovery");

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1_000);
    assert!(archiver.stats().failed_batches > 0);
}
