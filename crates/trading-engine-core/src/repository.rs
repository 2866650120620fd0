// File: src/repository.rs
//
// Load/save cycle for aggregates: snapshot plus tail replay on the way
// in, durable append plus publication on the way out

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::aggregate::AggregateRoot;
use crate::bus::{EventBus, EventSourcedBus};
use crate::error::{EventError, EventResult};
use crate::event::AggregateRef;
use crate::snapshot::SnapshotManager;
use crate::store::EventStore;

/// Repository over the event store. Aggregate kinds are registered at
/// startup; loading an unregistered kind fails `UnknownAggregateKind`.
/// Exactly one load-act-save cycle owns an aggregate at a time: the
/// repository hands out owned values and never caches them.
pub struct AggregateRepository {
    store: Arc<dyn EventStore>,
    bus: Arc<EventSourcedBus>,
    snapshots: Option<Arc<SnapshotManager>>,
    registered: RwLock<HashSet<&'static str>>,
}

impl AggregateRepository {
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<EventSourcedBus>) -> Self {
        Self {
            store,
            bus,
            snapshots: None,
            registered: RwLock::new(HashSet::new()),
        }
    }

    /// Attach the snapshot capability. Without it, loads are full
    /// replays and saves never snapshot.
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Register an aggregate kind. `T::new` is the factory used by
    /// `load`.
    pub async fn register<T: AggregateRoot>(&self) -> EventResult<()> {
        let mut registered = self.registered.write().await;
        if !registered.insert(T::KIND) {
            return Err(EventError::AlreadyRegistered {
                name: T::KIND.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_registered<T: AggregateRoot>(&self) -> EventResult<()> {
        if !self.registered.read().await.contains(T::KIND) {
            return Err(EventError::UnknownAggregateKind {
                kind: T::KIND.to_string(),
            });
        }
        Ok(())
    }

    /// Load an aggregate: latest snapshot (when available) plus a tail
    /// replay of everything past it.
    pub async fn load<T: AggregateRoot>(&self, aggregate_id: &str) -> EventResult<T> {
        self.ensure_registered::<T>().await?;
        let mut aggregate = T::new(aggregate_id);

        let base_version = match &self.snapshots {
            Some(snapshots) => snapshots.load_into(&mut aggregate).await?,
            None => 0,
        };

        let tail = self.store.events_for(T::KIND, aggregate_id, base_version).await?;
        if tail.is_empty() && base_version == 0 {
            return Err(EventError::AggregateNotFound {
                aggregate_kind: T::KIND.to_string(),
                aggregate_id: aggregate_id.to_string(),
            });
        }
        for envelope in &tail {
            aggregate.replay(envelope)?;
        }
        debug!(
            aggregate_kind = T::KIND,
            aggregate_id,
            base_version,
            replayed = tail.len(),
            version = aggregate.version(),
            "aggregate loaded"
        );
        Ok(aggregate)
    }

    /// Whether the aggregate has any history (snapshot or events).
    pub async fn exists<T: AggregateRoot>(&self, aggregate_id: &str) -> EventResult<bool> {
        self.ensure_registered::<T>().await?;
        Ok(self.store.latest_version(T::KIND, aggregate_id).await? > 0)
    }

    /// Persist the uncommitted buffer and publish it. An empty buffer
    /// is a successful no-op. The buffer is cleared only after the
    /// durable append succeeds, so a `ConcurrencyConflict` caller can
    /// reload and retry.
    pub async fn save<T: AggregateRoot>(&self, aggregate: &mut T) -> EventResult<()> {
        self.ensure_registered::<T>().await?;
        if aggregate.uncommitted().is_empty() {
            return Ok(());
        }
        let events = aggregate.uncommitted().to_vec();
        let appended = events.len() as i64;

        // Append-then-broadcast happens inside the event-sourced bus;
        // publication never precedes the durable write.
        self.bus.publish_batch(events).await?;
        aggregate.take_uncommitted();

        if let Some(snapshots) = &self.snapshots {
            let aggregate_ref = AggregateRef::new(T::KIND, aggregate.id());
            if snapshots
                .should_snapshot(&aggregate_ref, aggregate.version(), appended)
                .await
            {
                // Capture failures are logged by the manager; the save
                // has already succeeded.
                if let Err(e) = snapshots.capture_if_slot_free(aggregate).await {
                    tracing::warn!(
                        aggregate = %aggregate_ref,
                        error = %e,
                        "snapshot capture failed after save"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountEvent, TradingAccount};
    use crate::bus::SyncEventBus;
    use crate::snapshot::SnapshotConfig;
    use crate::store::InMemoryEventStore;
    use rust_decimal::Decimal;

    fn fixture() -> (Arc<InMemoryEventStore>, AggregateRepository) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(EventSourcedBus::new(
            store.clone(),
            Arc::new(SyncEventBus::new()),
        ));
        let repository = AggregateRepository::new(store.clone(), bus);
        (store, repository)
    }

    async fn registered() -> (Arc<InMemoryEventStore>, AggregateRepository) {
        let (store, repository) = fixture();
        repository.register::<TradingAccount>().await.unwrap();
        (store, repository)
    }

    #[tokio::test]
    async fn unregistered_kind_is_rejected() {
        let (_store, repository) = fixture();
        let err = repository.load::<TradingAccount>("A1").await.unwrap_err();
        assert!(matches!(err, EventError::UnknownAggregateKind { .. }));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (_store, repository) = registered().await;
        let err = repository.register::<TradingAccount>().await.unwrap_err();
        assert!(matches!(err, EventError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn missing_aggregate_is_not_found() {
        let (_store, repository) = registered().await;
        let err = repository.load::<TradingAccount>("missing").await.unwrap_err();
        assert!(matches!(err, EventError::AggregateNotFound { .. }));
    }

    #[tokio::test]
    async fn save_then_load_round_trips_state() {
        let (_store, repository) = registered().await;

        let mut account = TradingAccount::open("A1", Decimal::from(100)).unwrap();
        account
            .record(AccountEvent::FundsDeposited { amount: Decimal::from(50) })
            .unwrap();
        repository.save(&mut account).await.unwrap();
        assert!(account.uncommitted().is_empty());

        let loaded: TradingAccount = repository.load("A1").await.unwrap();
        assert_eq!(loaded.balance(), Decimal::from(150));
        assert_eq!(loaded.version(), 2);
    }

    #[tokio::test]
    async fn empty_buffer_save_is_a_no_op() {
        let (store, repository) = registered().await;
        let mut account = TradingAccount::open("A1", Decimal::from(1)).unwrap();
        repository.save(&mut account).await.unwrap();
        assert_eq!(store.len().await, 1);

        // Second save with nothing uncommitted.
        repository.save(&mut account).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn conflicting_save_keeps_the_buffer() {
        let (_store, repository) = registered().await;
        let mut first = TradingAccount::open("A1", Decimal::from(100)).unwrap();
        repository.save(&mut first).await.unwrap();

        let mut stale: TradingAccount = repository.load("A1").await.unwrap();
        let mut winner: TradingAccount = repository.load("A1").await.unwrap();

        winner
            .record(AccountEvent::FundsDeposited { amount: Decimal::from(10) })
            .unwrap();
        repository.save(&mut winner).await.unwrap();

        stale
            .record(AccountEvent::FundsDeposited { amount: Decimal::from(10) })
            .unwrap();
        let err = repository.save(&mut stale).await.unwrap_err();
        assert!(matches!(err, EventError::ConcurrencyConflict { .. }));
        assert_eq!(stale.uncommitted().len(), 1);

        // Reload-and-retry succeeds.
        let mut retry: TradingAccount = repository.load("A1").await.unwrap();
        retry
            .record(AccountEvent::FundsDeposited { amount: Decimal::from(10) })
            .unwrap();
        repository.save(&mut retry).await.unwrap();
        assert_eq!(retry.balance(), Decimal::from(120));
        assert_eq!(retry.version(), 3);
    }

    #[tokio::test]
    async fn snapshot_policy_fires_after_save() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(EventSourcedBus::new(
            store.clone(),
            Arc::new(SyncEventBus::new()),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            store.clone(),
            SnapshotConfig {
                frequency: 3,
                event_threshold: 0,
                compression_enabled: false,
                ..SnapshotConfig::default()
            },
        ));
        let repository =
            AggregateRepository::new(store.clone(), bus).with_snapshots(snapshots.clone());
        repository.register::<TradingAccount>().await.unwrap();

        let mut account = TradingAccount::open("A1", Decimal::ZERO).unwrap();
        repository.save(&mut account).await.unwrap();
        for _ in 0..2 {
            let mut loaded: TradingAccount = repository.load("A1").await.unwrap();
            loaded
                .record(AccountEvent::FundsDeposited { amount: Decimal::ONE })
                .unwrap();
            repository.save(&mut loaded).await.unwrap();
        }

        use crate::store::SnapshotStore;
        let snapshot = store.latest_snapshot("account", "A1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 3);
    }
}
