// File: src/snapshot.rs
//
// Snapshot capture and restore: policy-driven state capture with gzip
// compression, a concurrency cap, and retention pruning

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::aggregate::AggregateRoot;
use crate::error::{EventError, EventResult};
use crate::event::AggregateRef;
use crate::store::{Snapshot, SnapshotStore};

/// Configuration for snapshot management.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Snapshot whenever the post-save version is a multiple of this.
    pub frequency: i64,
    /// Snapshot once this many events accumulate past the last capture.
    pub event_threshold: i64,
    /// Snapshot once this much wall-clock time passes since the last
    /// capture.
    pub time_frequency: Duration,
    /// Drop snapshots older than this on cleanup.
    pub retention: Duration,
    /// Keep at most this many snapshots per aggregate.
    pub max_per_aggregate: usize,
    pub compression_enabled: bool,
    /// Only compress blobs at least this large.
    pub compression_threshold_bytes: usize,
    /// Concurrent capture cap; overruns are skipped, not queued.
    pub max_concurrent: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            frequency: 100,
            event_threshold: 100,
            time_frequency: Duration::from_secs(3600),
            retention: Duration::from_secs(90 * 24 * 3600),
            max_per_aggregate: 5,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            max_concurrent: 4,
        }
    }
}

/// Capture counters.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStatistics {
    pub taken: u64,
    pub skipped: u64,
    pub compressed: u64,
    pub pruned: u64,
    pub load_failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct CaptureMark {
    version: i64,
    at: DateTime<Utc>,
}

/// Policy-driven snapshot manager over a [`SnapshotStore`].
pub struct SnapshotManager {
    store: Arc<dyn SnapshotStore>,
    config: SnapshotConfig,
    capture_slots: Arc<Semaphore>,
    last_capture: RwLock<HashMap<AggregateRef, CaptureMark>>,
    statistics: RwLock<SnapshotStatistics>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn SnapshotStore>, config: SnapshotConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            store,
            config,
            capture_slots: Arc::new(Semaphore::new(max_concurrent)),
            last_capture: RwLock::new(HashMap::new()),
            statistics: RwLock::new(SnapshotStatistics::default()),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub async fn statistics(&self) -> SnapshotStatistics {
        self.statistics.read().await.clone()
    }

    /// Whether the policy fires for a save that left the aggregate at
    /// `current_version` after appending `events_appended` events.
    pub async fn should_snapshot(
        &self,
        aggregate: &AggregateRef,
        current_version: i64,
        events_appended: i64,
    ) -> bool {
        if self.config.frequency > 0 && current_version % self.config.frequency == 0 {
            return true;
        }
        let mark = self.last_capture.read().await.get(aggregate).copied();
        let (last_version, last_at) = match mark {
            Some(mark) => (mark.version, Some(mark.at)),
            None => (0, None),
        };
        let since_last = (current_version - last_version).max(events_appended);
        if self.config.event_threshold > 0 && since_last >= self.config.event_threshold {
            return true;
        }
        if let Some(last_at) = last_at {
            let elapsed = Utc::now() - last_at;
            if elapsed
                >= ChronoDuration::from_std(self.config.time_frequency)
                    .unwrap_or_else(|_| ChronoDuration::MAX)
            {
                return true;
            }
        }
        false
    }

    /// Capture a snapshot of the aggregate's current state, then prune
    /// per the retention policy.
    pub async fn capture<T: AggregateRoot>(&self, aggregate: &T) -> EventResult<()> {
        let state = aggregate.snapshot_state()?;
        self.capture_blob(
            AggregateRef::new(T::KIND, aggregate.id()),
            aggregate.version(),
            state,
        )
        .await
    }

    /// Capture without blocking the save path: the capture is skipped
    /// (and logged) when all concurrency slots are in use.
    pub async fn capture_if_slot_free<T: AggregateRoot>(&self, aggregate: &T) -> EventResult<bool> {
        let permit = match self.capture_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.statistics.write().await.skipped += 1;
                warn!(
                    aggregate_kind = T::KIND,
                    aggregate_id = aggregate.id(),
                    "snapshot capture skipped: concurrency cap reached"
                );
                return Ok(false);
            }
            Err(TryAcquireError::Closed) => {
                return Err(EventError::SnapshotError {
                    message: "snapshot semaphore closed".to_string(),
                })
            }
        };
        let result = self.capture(aggregate).await;
        drop(permit);
        result.map(|_| true)
    }

    async fn capture_blob(
        &self,
        aggregate: AggregateRef,
        version: i64,
        state: serde_json::Value,
    ) -> EventResult<()> {
        let raw = serde_json::to_vec(&state)?;
        let (blob, compressed) = if self.config.compression_enabled
            && raw.len() >= self.config.compression_threshold_bytes
        {
            (gzip_compress(&raw)?, true)
        } else {
            (raw, false)
        };

        let mut snapshot = Snapshot::new(aggregate.kind.clone(), aggregate.id.clone(), version, blob);
        snapshot.compressed = compressed;
        self.store.save_snapshot(&snapshot).await?;

        let older_than = ChronoDuration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let pruned = self
            .store
            .prune_snapshots(
                &aggregate.kind,
                &aggregate.id,
                self.config.max_per_aggregate,
                older_than,
            )
            .await?;

        {
            let mut stats = self.statistics.write().await;
            stats.taken += 1;
            stats.pruned += pruned as u64;
            if compressed {
                stats.compressed += 1;
            }
        }
        self.last_capture
            .write()
            .await
            .insert(aggregate.clone(), CaptureMark { version, at: Utc::now() });

        info!(
            aggregate = %aggregate,
            version,
            compressed,
            pruned,
            "snapshot captured"
        );
        Ok(())
    }

    /// Rehydrate the aggregate from its latest snapshot, if one exists.
    /// Returns the base version to tail-replay from (0 when no snapshot
    /// applied). A corrupt snapshot is logged and ignored so the caller
    /// falls back to full replay.
    pub async fn load_into<T: AggregateRoot>(&self, aggregate: &mut T) -> EventResult<i64> {
        let snapshot = match self.store.latest_snapshot(T::KIND, aggregate.id()).await? {
            Some(snapshot) => snapshot,
            None => return Ok(0),
        };
        match Self::restore_from(aggregate, &snapshot) {
            Ok(()) => {
                debug!(
                    aggregate_kind = T::KIND,
                    aggregate_id = aggregate.id(),
                    version = snapshot.version,
                    "aggregate rehydrated from snapshot"
                );
                Ok(snapshot.version)
            }
            Err(e) => {
                self.statistics.write().await.load_failures += 1;
                warn!(
                    aggregate_kind = T::KIND,
                    aggregate_id = aggregate.id(),
                    version = snapshot.version,
                    error = %e,
                    "snapshot load failed, falling back to full replay"
                );
                Ok(0)
            }
        }
    }

    fn restore_from<T: AggregateRoot>(aggregate: &mut T, snapshot: &Snapshot) -> EventResult<()> {
        let raw = if snapshot.compressed {
            gzip_decompress(&snapshot.blob)?
        } else {
            snapshot.blob.clone()
        };
        let state: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| EventError::SnapshotError {
                message: format!("snapshot blob is not valid JSON: {}", e),
            })?;
        aggregate.restore_state(&state)?;
        aggregate.set_version(snapshot.version);
        Ok(())
    }
}

pub(crate) fn gzip_compress(data: &[u8]) -> EventResult<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).map_err(|e| EventError::SnapshotError {
        message: format!("gzip compression failed: {}", e),
    })?;
    encoder.finish().map_err(|e| EventError::SnapshotError {
        message: format!("gzip finalization failed: {}", e),
    })
}

pub(crate) fn gzip_decompress(data: &[u8]) -> EventResult<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| EventError::SnapshotError {
        message: format!("gzip decompression failed: {}", e),
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateBase;
    use crate::event::DomainEvent;
    use crate::store::InMemoryEventStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum NoteEvent {
        Appended { text: String },
    }

    impl DomainEvent for NoteEvent {
        fn kind(&self) -> &'static str {
            "note_appended"
        }

        fn payload(&self) -> EventResult<serde_json::Value> {
            Ok(serde_json::to_value(self)?)
        }

        fn from_payload(_kind: &str, payload: &serde_json::Value) -> EventResult<Self> {
            Ok(serde_json::from_value(payload.clone())?)
        }
    }

    struct Notebook {
        base: AggregateBase,
        text: String,
    }

    impl AggregateRoot for Notebook {
        type Event = NoteEvent;
        const KIND: &'static str = "notebook";

        fn new(id: impl Into<String>) -> Self {
            Self {
                base: AggregateBase::new(id),
                text: String::new(),
            }
        }

        fn base(&self) -> &AggregateBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut AggregateBase {
            &mut self.base
        }

        fn apply(&mut self, event: &Self::Event) -> EventResult<()> {
            let NoteEvent::Appended { text } = event;
            self.text.push_str(text);
            Ok(())
        }

        fn snapshot_state(&self) -> EventResult<serde_json::Value> {
            Ok(json!({"text": self.text}))
        }

        fn restore_state(&mut self, state: &serde_json::Value) -> EventResult<()> {
            self.text = state["text"].as_str().unwrap_or_default().to_string();
            Ok(())
        }
    }

    fn manager(config: SnapshotConfig) -> (Arc<InMemoryEventStore>, SnapshotManager) {
        let store = Arc::new(InMemoryEventStore::new());
        let manager = SnapshotManager::new(store.clone(), config);
        (store, manager)
    }

    #[test]
    fn gzip_round_trip_is_identity() {
        let data = b"the quick brown fox jumps over the lazy dog, repeatedly and often";
        let compressed = gzip_compress(data).unwrap();
        assert_eq!(gzip_decompress(&compressed).unwrap(), data);
    }

    #[tokio::test]
    async fn capture_and_restore_round_trip() {
        let (_store, manager) = manager(SnapshotConfig {
            compression_enabled: false,
            ..SnapshotConfig::default()
        });
        let mut notebook = Notebook::new("n1");
        notebook
            .record(NoteEvent::Appended { text: "hello".to_string() })
            .unwrap();
        manager.capture(&notebook).await.unwrap();

        let mut restored = Notebook::new("n1");
        let base_version = manager.load_into(&mut restored).await.unwrap();
        assert_eq!(base_version, 1);
        assert_eq!(restored.text, "hello");
        assert_eq!(restored.version(), 1);
    }

    #[tokio::test]
    async fn large_state_is_gzip_compressed() {
        let (store, manager) = manager(SnapshotConfig {
            compression_threshold_bytes: 16,
            ..SnapshotConfig::default()
        });
        let mut notebook = Notebook::new("n1");
        notebook
            .record(NoteEvent::Appended { text: "x".repeat(4096) })
            .unwrap();
        manager.capture(&notebook).await.unwrap();

        let snapshot = store.latest_snapshot("notebook", "n1").await.unwrap().unwrap();
        assert!(snapshot.compressed);
        assert!(snapshot.blob.len() < 4096);

        let mut restored = Notebook::new("n1");
        manager.load_into(&mut restored).await.unwrap();
        assert_eq!(restored.text.len(), 4096);
    }

    #[tokio::test]
    async fn frequency_policy_fires_on_multiples() {
        let (_store, manager) = manager(SnapshotConfig {
            frequency: 3,
            event_threshold: 0,
            time_frequency: Duration::from_secs(3600),
            ..SnapshotConfig::default()
        });
        let aggregate = AggregateRef::new("notebook", "n1");
        assert!(!manager.should_snapshot(&aggregate, 2, 1).await);
        assert!(manager.should_snapshot(&aggregate, 3, 1).await);
        assert!(!manager.should_snapshot(&aggregate, 4, 1).await);
        assert!(manager.should_snapshot(&aggregate, 6, 1).await);
    }

    #[tokio::test]
    async fn event_threshold_counts_since_last_capture() {
        let (_store, manager) = manager(SnapshotConfig {
            frequency: 0,
            event_threshold: 5,
            time_frequency: Duration::from_secs(3600),
            ..SnapshotConfig::default()
        });
        let aggregate = AggregateRef::new("notebook", "n1");
        assert!(!manager.should_snapshot(&aggregate, 4, 1).await);
        assert!(manager.should_snapshot(&aggregate, 5, 1).await);
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_full_replay() {
        let (store, manager) = manager(SnapshotConfig::default());
        let mut bad = Snapshot::new("notebook", "n1", 4, b"not json".to_vec());
        bad.compressed = false;
        store.save_snapshot(&bad).await.unwrap();

        let mut notebook = Notebook::new("n1");
        let base_version = manager.load_into(&mut notebook).await.unwrap();
        assert_eq!(base_version, 0);
        assert_eq!(manager.statistics().await.load_failures, 1);
    }
}
