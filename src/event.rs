//! Recorded-event types and the typed-event encode/decode bridge.
//!
//! Domain event enums use adjacently tagged serde
//! (`#[serde(tag = "type", content = "payload")]`), so a serialized domain
//! event is exactly the `{type, payload}` pair stored inside a
//! [`RecordedEvent`]. The helpers here split and rejoin that pair; no I/O
//! occurs in this module.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The two aggregate families the service owns.
///
/// Serialized lowercase (`"user"` / `"resource"`), which is also the first
/// path segment of every event key in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    User,
    Resource,
}

impl StreamType {
    /// The lowercase name used in object keys and wire records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Resource => "resource",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "resource" => Ok(Self::Resource),
            other => Err(format!("unknown stream type: {other}")),
        }
    }
}

/// An immutable event as stored in the object store and published on the
/// queue.
///
/// Versions are per-stream, contiguous, and start at 1. `occurred_at_utc`
/// is wall-clock metadata only; nothing in the core depends on it for
/// correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    /// Writer-assigned UUIDv7 event ID.
    pub event_id: Uuid,
    pub stream_id: Uuid,
    pub stream_type: StreamType,
    /// One-based, contiguous position within the stream.
    pub version: u64,
    /// Event type tag (e.g. `"ReservationAddedToResource"`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// The domain payload, opaque to the store.
    pub payload: Value,
    pub occurred_at_utc: DateTime<Utc>,
    /// Infrastructure metadata (actor, correlation, audit fields).
    pub meta: Value,
}

impl RecordedEvent {
    /// Build a recorded event with a freshly generated UUIDv7 event ID.
    pub fn record(
        stream_type: StreamType,
        stream_id: Uuid,
        version: u64,
        event_type: impl Into<String>,
        payload: Value,
        occurred_at_utc: DateTime<Utc>,
        meta: Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            stream_id,
            stream_type,
            version,
            event_type: event_type.into(),
            payload,
            occurred_at_utc,
            meta,
        }
    }
}

/// Split an adjacently tagged domain event into its `(type, payload)` pair.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized.
pub fn encode_event<E: Serialize>(event: &E) -> serde_json::Result<(String, Value)> {
    // Adjacently tagged serde produces `{"type": "...", "payload": {...}}`;
    // `payload` is absent for fieldless variants.
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");
    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();
    let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Rejoin a `{type, payload}` pair into a typed domain event.
///
/// Returns `None` for unknown or malformed event types so folds and
/// projections can skip them (forward compatibility with events appended
/// by newer writers).
pub fn decode_event<E: DeserializeOwned>(event_type: &str, payload: &Value) -> Option<E> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "payload": payload })
    };
    serde_json::from_value(tagged).ok()
}
