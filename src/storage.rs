//! Object-store key layout for event streams and snapshots.
//!
//! ```text
//! {stream_type}/{stream_id}/{version:012}.json            events
//! snapshots/{stream_type}/{stream_id}/{version:012}.json  snapshots
//! ```
//!
//! The version is zero-padded to twelve digits so lexicographic key order
//! equals numeric version order, which is what makes prefix listings come
//! back sorted and makes create-if-absent on the key a per-version lock.

use uuid::Uuid;

use crate::event::StreamType;

/// Key of the event object at `version` within a stream.
pub fn event_key(stream_type: StreamType, stream_id: Uuid, version: u64) -> String {
    format!("{stream_type}/{stream_id}/{version:012}.json")
}

/// Listing prefix covering every event of a stream.
pub fn stream_prefix(stream_type: StreamType, stream_id: Uuid) -> String {
    format!("{stream_type}/{stream_id}/")
}

/// Key of the snapshot object taken at `snapshot_version`.
pub fn snapshot_key(stream_type: StreamType, stream_id: Uuid, snapshot_version: u64) -> String {
    format!("snapshots/{stream_type}/{stream_id}/{snapshot_version:012}.json")
}

/// Listing prefix covering every snapshot of a stream.
pub fn snapshot_prefix(stream_type: StreamType, stream_id: Uuid) -> String {
    format!("snapshots/{stream_type}/{stream_id}/")
}

/// Parse the version out of an event or snapshot key.
///
/// The version is the final path segment with its `.json` suffix removed.
/// Returns `None` for keys that do not end in a well-formed version
/// segment (foreign objects under the prefix are skipped, not fatal).
pub fn parse_version(key: &str) -> Option<u64> {
    let segment = key.rsplit('/').next()?;
    let digits = segment.strip_suffix(".json")?;
    if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
