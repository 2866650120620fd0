// File: tests/store_invariants_test.rs
//
// Store- and bus-level invariants: version density, atomic batches,
// snapshot/tail equivalence, and ordered delivery per aggregate.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use trading_engine_core::account::{AccountEvent, TradingAccount};
use trading_engine_core::aggregate::AggregateRoot;
use trading_engine_core::bus::{EventBus, EventSourcedBus, EventSubscriber, SyncEventBus};
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::EventEnvelope;
use trading_engine_core::repository::AggregateRepository;
use trading_engine_core::snapshot::{SnapshotConfig, SnapshotManager};
use trading_engine_core::store::{EventStore, InMemoryEventStore};

fn deposit(id: &str, version: i64) -> EventEnvelope {
    EventEnvelope::new("account", id, "funds_deposited", version, json!({"amount": 1}))
}

async fn repository(
    store: Arc<InMemoryEventStore>,
    snapshots: Option<SnapshotConfig>,
) -> Arc<AggregateRepository> {
    let bus = Arc::new(EventSourcedBus::new(
        store.clone(),
        Arc::new(SyncEventBus::new()),
    ));
    let mut repository = AggregateRepository::new(store.clone(), bus);
    if let Some(config) = snapshots {
        repository = repository.with_snapshots(Arc::new(SnapshotManager::new(store, config)));
    }
    let repository = Arc::new(repository);
    repository.register::<TradingAccount>().await.unwrap();
    repository
}

#[tokio::test]
async fn load_after_save_reproduces_the_aggregate() {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = repository(store, None).await;

    let mut account = TradingAccount::open("A1", Decimal::from(10)).unwrap();
    account.deposit(Decimal::from(5)).unwrap();
    account.withdraw(Decimal::from(3)).unwrap();
    let expected_balance = account.balance();
    let expected_version = account.version();
    repository.save(&mut account).await.unwrap();

    let loaded: TradingAccount = repository.load("A1").await.unwrap();
    assert_eq!(loaded.balance(), expected_balance);
    assert_eq!(loaded.version(), expected_version);
    assert!(loaded.uncommitted().is_empty());
}

#[tokio::test]
async fn persisted_versions_are_dense_from_one() {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = repository(store.clone(), None).await;

    let mut account = TradingAccount::open("A1", Decimal::ZERO).unwrap();
    repository.save(&mut account).await.unwrap();
    for _ in 0..7 {
        let mut loaded: TradingAccount = repository.load("A1").await.unwrap();
        loaded
            .record(AccountEvent::FundsDeposited { amount: Decimal::ONE })
            .unwrap();
        repository.save(&mut loaded).await.unwrap();
    }

    let events = store.events_for("account", "A1", 0).await.unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn append_returns_the_batch_in_version_order() {
    let store = InMemoryEventStore::new();
    store
        .append(vec![deposit("A1", 1), deposit("A1", 2), deposit("A1", 3)])
        .await
        .unwrap();

    let events = store.events_for("account", "A1", 0).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.version).collect::<Vec<i64>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn zero_length_batch_is_invalid() {
    let store = InMemoryEventStore::new();
    let err = store.append(Vec::new()).await.unwrap_err();
    assert!(matches!(err, EventError::InvalidBatch { .. }));
}

#[tokio::test]
async fn failed_batch_leaves_no_partial_state() {
    let store = InMemoryEventStore::new();
    store.append(vec![deposit("A1", 1)]).await.unwrap();

    // Conflicting batch: nothing from it may become visible.
    let err = store
        .append(vec![deposit("A1", 1), deposit("A1", 2)])
        .await
        .unwrap_err();
    assert!(matches!(err, EventError::ConcurrencyConflict { .. }));
    assert_eq!(store.len().await, 1);
    assert_eq!(store.latest_version("account", "A1").await.unwrap(), 1);
}

#[tokio::test]
async fn snapshot_plus_tail_equals_full_replay() {
    let store = Arc::new(InMemoryEventStore::new());
    let with_snapshots = repository(
        store.clone(),
        Some(SnapshotConfig {
            frequency: 4,
            event_threshold: 0,
            compression_enabled: true,
            compression_threshold_bytes: 0,
            ..SnapshotConfig::default()
        }),
    )
    .await;

    let mut account = TradingAccount::open("A1", Decimal::from(100)).unwrap();
    repository_cycle(&with_snapshots, &mut account, 9).await;

    // Load via snapshot + tail.
    let via_snapshot: TradingAccount = with_snapshots.load("A1").await.unwrap();

    // Full replay from scratch against the same log.
    let mut from_scratch = TradingAccount::new("A1");
    for envelope in store.events_for("account", "A1", 0).await.unwrap() {
        from_scratch.replay(&envelope).unwrap();
    }

    assert_eq!(via_snapshot.balance(), from_scratch.balance());
    assert_eq!(via_snapshot.version(), from_scratch.version());
}

async fn repository_cycle(
    repository: &Arc<AggregateRepository>,
    first: &mut TradingAccount,
    deposits: usize,
) {
    repository.save(first).await.unwrap();
    for _ in 0..deposits {
        let mut loaded: TradingAccount = repository.load("A1").await.unwrap();
        loaded
            .record(AccountEvent::FundsDeposited { amount: Decimal::ONE })
            .unwrap();
        repository.save(&mut loaded).await.unwrap();
    }
}

/// Records the version sequence seen per aggregate.
struct OrderRecorder {
    seen: Mutex<HashMap<String, Vec<i64>>>,
}

impl OrderRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl EventSubscriber for OrderRecorder {
    async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
        self.seen
            .lock()
            .unwrap()
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(event.version);
        Ok(())
    }

    fn name(&self) -> &str {
        "order_recorder"
    }
}

#[tokio::test]
async fn aggregate_kind_subscribers_see_per_aggregate_version_order() {
    let store = Arc::new(InMemoryEventStore::new());
    let bus = EventSourcedBus::new(store, Arc::new(SyncEventBus::new()));
    let recorder = OrderRecorder::new();
    bus.subscribe_to_aggregate_kind("account", recorder.clone())
        .await
        .unwrap();

    // Interleave two aggregates through a single publisher.
    for version in 1..=5 {
        bus.publish(deposit("A1", version)).await.unwrap();
        bus.publish(deposit("A2", version)).await.unwrap();
    }

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen["A1"], vec![1, 2, 3, 4, 5]);
    assert_eq!(seen["A2"], vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn subscribers_only_observe_durable_events() {
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(EventSourcedBus::new(
        store.clone(),
        Arc::new(SyncEventBus::new()),
    ));

    struct DurabilityProbe {
        store: Arc<InMemoryEventStore>,
        checked: Mutex<usize>,
    }

    #[async_trait]
    impl EventSubscriber for DurabilityProbe {
        async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
            let version = self
                .store
                .latest_version(&event.aggregate_kind, &event.aggregate_id)
                .await?;
            assert!(version >= event.version, "event observed before durable append");
            *self.checked.lock().unwrap() += 1;
            Ok(())
        }

        fn name(&self) -> &str {
            "durability_probe"
        }
    }

    let probe = Arc::new(DurabilityProbe {
        store: store.clone(),
        checked: Mutex::new(0),
    });
    bus.subscribe(probe.clone()).await.unwrap();

    bus.publish_batch(vec![deposit("A1", 1), deposit("A1", 2)])
        .await
        .unwrap();
    assert_eq!(*probe.checked.lock().unwrap(), 2);
}
