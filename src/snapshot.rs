//! Snapshot record and the policy deciding when one is due.
//!
//! A snapshot is an accelerator only: it lets rehydration skip the head of
//! a stream, and correctness never depends on it. The invariant
//! `snapshot_version == last_event_version` is enforced by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::StreamType;

/// A materialized aggregate state at a specific stream version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub stream_type: StreamType,
    pub stream_id: Uuid,
    /// Version this snapshot was taken at. Always equals
    /// `last_event_version`; both are stored for out-of-band inspection.
    pub snapshot_version: u64,
    /// Version of the last event folded into `state`.
    pub last_event_version: u64,
    /// The aggregate state, opaque to the store.
    pub state: Value,
    pub created_at_utc: DateTime<Utc>,
}

impl StoredSnapshot {
    /// Build a snapshot of `state` as of `version`.
    pub fn at(
        stream_type: StreamType,
        stream_id: Uuid,
        version: u64,
        state: Value,
        created_at_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_type,
            stream_id,
            snapshot_version: version,
            last_event_version: version,
            state,
            created_at_utc,
        }
    }
}

/// Per-stream-type snapshot cadence.
///
/// A threshold of `0` disables snapshots for that stream type. Stream
/// types absent from the override map fall back to `default_every`.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    pub default_every: u64,
    pub by_stream_type: HashMap<StreamType, u64>,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            default_every: 500,
            by_stream_type: HashMap::from([(StreamType::Resource, 500), (StreamType::User, 0)]),
        }
    }
}

impl SnapshotPolicy {
    /// Effective threshold for a stream type.
    pub fn threshold(&self, stream_type: StreamType) -> u64 {
        self.by_stream_type
            .get(&stream_type)
            .copied()
            .unwrap_or(self.default_every)
    }

    /// Whether a snapshot is due after appending `version`.
    pub fn due(&self, stream_type: StreamType, version: u64) -> bool {
        let every = self.threshold(stream_type);
        every > 0 && version % every == 0
    }
}
