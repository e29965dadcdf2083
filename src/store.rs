//! Append-only event store over a [`BlobStore`].
//!
//! Streams are sequences of version-keyed JSON objects; the key encodes the
//! version, so create-if-absent on the key serializes writers racing for
//! the same version. Reads are gap-checked: eventually consistent listings
//! may briefly omit a just-written object, so a detected gap triggers one
//! full re-load before being surfaced as a hard error.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::event::{RecordedEvent, StreamType};
use crate::object_store::{BlobStore, BlobStoreError};
use crate::snapshot::StoredSnapshot;
use crate::storage;

/// Failures surfaced by the event store.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Another writer holds the version this append targeted.
    #[error("optimistic concurrency conflict")]
    VersionConflict,

    /// A stream listing is missing a version, and the gap survived a
    /// retry. Indicates a real read-consistency defect, never skipped.
    #[error("stream gap detected: expected version {expected}, found {actual}")]
    StreamGap { expected: u64, actual: u64 },

    /// Caller bug: `expected_version + 1` must equal the event's version.
    #[error("expected version {expected} does not precede event version {version}")]
    ExpectedVersionMismatch { expected: u64, version: u64 },

    /// An object failed to encode or decode as JSON.
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Underlying transport failure, surfaced unchanged.
    #[error(transparent)]
    Store(BlobStoreError),
}

/// Event and snapshot persistence for all streams.
///
/// Cheap to clone; the blob backend is shared behind an `Arc`.
#[derive(Clone)]
pub struct EventStore {
    blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Load a stream's events from `from_inclusive` upward.
    ///
    /// Lists every page under the stream prefix, fetches and decodes each
    /// event object, and validates that versions are contiguous starting
    /// at `from_inclusive`. A gap triggers exactly one full re-load; a
    /// persistent gap fails with [`EventStoreError::StreamGap`].
    ///
    /// # Errors
    ///
    /// [`EventStoreError::StreamGap`] on a stable continuity break;
    /// [`EventStoreError::Store`] / [`EventStoreError::Codec`] on
    /// transport or decode failures.
    pub async fn load_stream(
        &self,
        stream_type: StreamType,
        stream_id: Uuid,
        from_inclusive: u64,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        match self
            .load_stream_once(stream_type, stream_id, from_inclusive)
            .await
        {
            Err(EventStoreError::StreamGap { expected, actual }) => {
                tracing::warn!(
                    stream_type = %stream_type,
                    stream_id = %stream_id,
                    expected,
                    actual,
                    "stream listing gap, retrying load once"
                );
                self.load_stream_once(stream_type, stream_id, from_inclusive)
                    .await
            }
            other => other,
        }
    }

    async fn load_stream_once(
        &self,
        stream_type: StreamType,
        stream_id: Uuid,
        from_inclusive: u64,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let prefix = storage::stream_prefix(stream_type, stream_id);
        let keys = self.list_all(&prefix).await?;

        // Parse versions from key names; foreign objects under the prefix
        // are ignored. Padded keys already arrive sorted, but sorting by
        // the parsed version keeps the continuity check independent of
        // listing order.
        let mut versioned: Vec<(u64, String)> = keys
            .into_iter()
            .filter_map(|key| storage::parse_version(&key).map(|v| (v, key)))
            .filter(|(v, _)| *v >= from_inclusive)
            .collect();
        versioned.sort_unstable_by_key(|(v, _)| *v);

        let mut events = Vec::with_capacity(versioned.len());
        let mut expected = from_inclusive;
        for (version, key) in versioned {
            if version != expected {
                return Err(EventStoreError::StreamGap {
                    expected,
                    actual: version,
                });
            }
            let body = self.blobs.get(&key).await.map_err(EventStoreError::Store)?;
            let event: RecordedEvent = serde_json::from_slice(&body)?;
            events.push(event);
            expected += 1;
        }
        Ok(events)
    }

    /// Append one event at `expected_version + 1`.
    ///
    /// Atomic and observable only on success: the event object is created
    /// with if-absent semantics on its version-encoded key, so exactly one
    /// of any set of racing writers wins.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::VersionConflict`] if another writer already
    /// created the target version.
    pub async fn append_event(
        &self,
        event: &RecordedEvent,
        expected_version: u64,
    ) -> Result<(), EventStoreError> {
        if event.version != expected_version + 1 {
            return Err(EventStoreError::ExpectedVersionMismatch {
                expected: expected_version,
                version: event.version,
            });
        }
        let key = storage::event_key(event.stream_type, event.stream_id, event.version);
        let body = serde_json::to_vec(event)?;
        match self
            .blobs
            .put_if_absent(&key, body, "application/json", HashMap::new())
            .await
        {
            Ok(()) => Ok(()),
            Err(BlobStoreError::AlreadyExists(_)) => Err(EventStoreError::VersionConflict),
            Err(e) => Err(EventStoreError::Store(e)),
        }
    }

    /// Load the snapshot with the highest version, if any exists.
    ///
    /// A snapshot that fails to decode is treated as a cache miss (logged
    /// at warn), not an error: rehydration falls back to a full replay.
    pub async fn load_latest_snapshot(
        &self,
        stream_type: StreamType,
        stream_id: Uuid,
    ) -> Result<Option<StoredSnapshot>, EventStoreError> {
        let prefix = storage::snapshot_prefix(stream_type, stream_id);
        let keys = self.list_all(&prefix).await?;
        let Some((_, key)) = keys
            .into_iter()
            .filter_map(|key| storage::parse_version(&key).map(|v| (v, key)))
            .max_by_key(|(v, _)| *v)
        else {
            return Ok(None);
        };

        let body = self.blobs.get(&key).await.map_err(EventStoreError::Store)?;
        match serde_json::from_slice::<StoredSnapshot>(&body) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "failed to decode snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    /// Write a snapshot with if-absent semantics.
    ///
    /// The already-exists case is success: a concurrent writer taking the
    /// same snapshot produced identical content (folds are deterministic),
    /// so only one copy needs to live.
    pub async fn put_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), EventStoreError> {
        let key = storage::snapshot_key(
            snapshot.stream_type,
            snapshot.stream_id,
            snapshot.snapshot_version,
        );
        let body = serde_json::to_vec(snapshot)?;
        let metadata = HashMap::from([
            (
                "snapshotversion".to_string(),
                snapshot.snapshot_version.to_string(),
            ),
            (
                "lasteventversion".to_string(),
                snapshot.last_event_version.to_string(),
            ),
        ]);
        match self
            .blobs
            .put_if_absent(&key, body, "application/json", metadata)
            .await
        {
            Ok(()) => Ok(()),
            Err(BlobStoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(EventStoreError::Store(e)),
        }
    }

    /// Current tail version of a stream (0 when empty).
    ///
    /// Listing-only: used by the conflict-telemetry path, which needs the
    /// tail without fetching event bodies.
    pub async fn tail_version(
        &self,
        stream_type: StreamType,
        stream_id: Uuid,
    ) -> Result<u64, EventStoreError> {
        let prefix = storage::stream_prefix(stream_type, stream_id);
        let keys = self.list_all(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| storage::parse_version(key))
            .max()
            .unwrap_or(0))
    }

    /// Drain a prefix listing through its continuation tokens.
    async fn list_all(&self, prefix: &str) -> Result<Vec<String>, EventStoreError> {
        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .blobs
                .list(prefix, token)
                .await
                .map_err(EventStoreError::Store)?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(keys),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::object_store::InMemoryBlobStore;

    fn test_event(stream_id: Uuid, version: u64) -> RecordedEvent {
        RecordedEvent::record(
            StreamType::Resource,
            stream_id,
            version,
            "ResourceMetadataUpdated",
            json!({"details": format!("rev {version}")}),
            Utc::now(),
            serde_json::Value::Null,
        )
    }

    fn store_over(blobs: &Arc<InMemoryBlobStore>) -> EventStore {
        EventStore::new(blobs.clone())
    }

    #[tokio::test]
    async fn append_then_load_returns_contiguous_stream() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();

        for version in 1..=4 {
            store
                .append_event(&test_event(stream_id, version), version - 1)
                .await
                .expect("append should succeed");
        }

        let events = store
            .load_stream(StreamType::Resource, stream_id, 1)
            .await
            .expect("load should succeed");
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn load_from_offset_skips_head() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        for version in 1..=5 {
            store
                .append_event(&test_event(stream_id, version), version - 1)
                .await
                .expect("append should succeed");
        }

        let tail = store
            .load_stream(StreamType::Resource, stream_id, 4)
            .await
            .expect("load should succeed");
        let versions: Vec<u64> = tail.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[tokio::test]
    async fn load_empty_stream_returns_no_events() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let events = store
            .load_stream(StreamType::User, Uuid::now_v7(), 1)
            .await
            .expect("load should succeed");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn losing_writer_sees_version_conflict() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();

        store
            .append_event(&test_event(stream_id, 1), 0)
            .await
            .expect("winner should succeed");

        let loser = store.append_event(&test_event(stream_id, 1), 0).await;
        assert!(
            matches!(loser, Err(EventStoreError::VersionConflict)),
            "second writer at version 1 must conflict, got: {loser:?}"
        );
    }

    #[tokio::test]
    async fn append_rejects_mismatched_expected_version() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let result = store.append_event(&test_event(Uuid::now_v7(), 3), 0).await;
        assert!(matches!(
            result,
            Err(EventStoreError::ExpectedVersionMismatch {
                expected: 0,
                version: 3
            })
        ));
    }

    #[tokio::test]
    async fn load_paginates_across_listing_pages() {
        // Page size 2 forces the continuation-token loop through 3 pages.
        let blobs = Arc::new(InMemoryBlobStore::with_page_size(2));
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        for version in 1..=5 {
            store
                .append_event(&test_event(stream_id, version), version - 1)
                .await
                .expect("append should succeed");
        }

        let events = store
            .load_stream(StreamType::Resource, stream_id, 1)
            .await
            .expect("load should succeed");
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn persistent_gap_surfaces_after_one_retry() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        for version in 1..=3 {
            store
                .append_event(&test_event(stream_id, version), version - 1)
                .await
                .expect("append should succeed");
        }

        // Simulate a listing that stably omits version 2.
        blobs.remove(&storage::event_key(StreamType::Resource, stream_id, 2));

        let result = store.load_stream(StreamType::Resource, stream_id, 1).await;
        match result {
            Err(EventStoreError::StreamGap { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("expected StreamGap, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn latest_snapshot_wins_over_older_ones() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();

        for version in [2u64, 4, 6] {
            let snap = StoredSnapshot::at(
                StreamType::Resource,
                stream_id,
                version,
                json!({"at": version}),
                Utc::now(),
            );
            store
                .put_snapshot(&snap)
                .await
                .expect("put_snapshot should succeed");
        }

        let latest = store
            .load_latest_snapshot(StreamType::Resource, stream_id)
            .await
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(latest.snapshot_version, 6);
        assert_eq!(latest.state["at"], 6);
    }

    #[tokio::test]
    async fn missing_snapshot_returns_none() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let result = store
            .load_latest_snapshot(StreamType::User, Uuid::now_v7())
            .await
            .expect("load should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn duplicate_snapshot_write_is_not_an_error() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        let snap = StoredSnapshot::at(
            StreamType::Resource,
            stream_id,
            2,
            json!({}),
            Utc::now(),
        );

        store.put_snapshot(&snap).await.expect("first write");
        store
            .put_snapshot(&snap)
            .await
            .expect("second write of the same snapshot should be a no-op");
    }

    #[tokio::test]
    async fn snapshot_object_carries_version_metadata() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        let snap = StoredSnapshot::at(
            StreamType::Resource,
            stream_id,
            2,
            json!({}),
            Utc::now(),
        );
        store.put_snapshot(&snap).await.expect("put should succeed");

        let key = storage::snapshot_key(StreamType::Resource, stream_id, 2);
        let metadata = blobs.object_metadata(&key).expect("metadata should exist");
        assert_eq!(metadata.get("snapshotversion").map(String::as_str), Some("2"));
        assert_eq!(
            metadata.get("lasteventversion").map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_treated_as_cache_miss() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        blobs
            .put_if_absent(
                &storage::snapshot_key(StreamType::User, stream_id, 3),
                b"not json at all".to_vec(),
                "application/json",
                HashMap::new(),
            )
            .await
            .expect("raw put should succeed");

        let result = store
            .load_latest_snapshot(StreamType::User, stream_id)
            .await
            .expect("load should succeed (not Err)");
        assert!(result.is_none(), "corrupt snapshot must fall back to replay");
    }

    #[tokio::test]
    async fn tail_version_tracks_appends() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = store_over(&blobs);
        let stream_id = Uuid::now_v7();
        assert_eq!(
            store
                .tail_version(StreamType::Resource, stream_id)
                .await
                .expect("tail should succeed"),
            0
        );
        for version in 1..=3 {
            store
                .append_event(&test_event(stream_id, version), version - 1)
                .await
                .expect("append should succeed");
        }
        assert_eq!(
            store
                .tail_version(StreamType::Resource, stream_id)
                .await
                .expect("tail should succeed"),
            3
        );
    }
}
