//! Idempotency: canonical request hashing and exactly-once replies.
//!
//! Every mutating command runs under a gate keyed by the client's
//! `Idempotency-Key`. The gate remembers `(content_hash, status_code,
//! response_body)` per key: a repeat with the same content replays the
//! stored reply verbatim, a repeat with different content is rejected.
//! The content hash is SHA-256 over a canonical serialization of
//! `{path, body, actor?}` -- key order and number formatting are pinned
//! so the hash is stable across serializers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::document_store::{DocumentStore, DocumentStoreError};

/// One remembered command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    /// Lower-hex SHA-256 of the canonical request content.
    pub content_hash: String,
    pub status_code: u16,
    pub response_body: Value,
    pub created_at_utc: DateTime<Utc>,
}

/// Outcome of checking a key against its stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyDecision {
    /// First sighting: run the command, then save under this hash.
    New { content_hash: String },
    /// Same key, same content: reply with the stored response verbatim.
    Replay(IdempotencyRecord),
    /// Same key, different content: reject.
    Mismatch,
}

/// Decide how to treat a request given any previously stored record.
pub fn decide(existing: Option<IdempotencyRecord>, content: &Value) -> IdempotencyDecision {
    let content_hash = content_hash(content);
    match existing {
        None => IdempotencyDecision::New { content_hash },
        Some(record) if record.content_hash == content_hash => IdempotencyDecision::Replay(record),
        Some(_) => IdempotencyDecision::Mismatch,
    }
}

/// The request content an idempotency key binds to: route, validated
/// payload, and the authenticated subject (omitted on unauthenticated
/// routes so the same anonymous request hashes identically).
pub fn fingerprint(path: &str, body: &Value, actor: Option<Uuid>) -> Value {
    let mut content = serde_json::Map::new();
    content.insert("path".to_string(), Value::String(path.to_string()));
    content.insert("body".to_string(), body.clone());
    if let Some(actor) = actor {
        content.insert("actor".to_string(), Value::String(actor.to_string()));
    }
    Value::Object(content)
}

/// Canonical JSON: object keys sorted recursively, arrays in order,
/// scalars rendered by serde_json (which pins number formatting).
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    // Key serialization is infallible for strings.
                    let rendered_key = serde_json::to_string(key).unwrap_or_default();
                    format!("{rendered_key}:{}", canonical_json(&map[key]))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_default(),
    }
}

/// Lower-hex SHA-256 over the canonical serialization.
pub fn content_hash(content: &Value) -> String {
    let digest = Sha256::digest(canonical_json(content).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Record persistence over the idempotency table.
#[derive(Clone)]
pub struct IdempotencyStore {
    docs: Arc<dyn DocumentStore>,
    table: String,
}

impl IdempotencyStore {
    pub fn new(docs: Arc<dyn DocumentStore>, table: impl Into<String>) -> Self {
        Self {
            docs,
            table: table.into(),
        }
    }

    /// Load the record for a key, if one exists.
    ///
    /// A record that fails to decode is treated as absent (logged at
    /// warn): re-running the command is safe because the event append is
    /// version-guarded.
    pub async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>, DocumentStoreError> {
        let Some(item) = self.docs.get(&self.table, key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(item) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable idempotency record, ignoring");
                Ok(None)
            }
        }
    }

    /// Insert-if-absent.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::AlreadyExists`] when a concurrent duplicate
    /// saved first; callers treat that as success.
    pub async fn save(&self, record: &IdempotencyRecord) -> Result<(), DocumentStoreError> {
        let item = serde_json::to_value(record)
            .map_err(|e| DocumentStoreError::Transport(e.to_string()))?;
        self.docs
            .put_if_absent(&self.table, &record.idempotency_key, item)
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::document_store::InMemoryDocumentStore;

    fn record(key: &str, hash: &str) -> IdempotencyRecord {
        IdempotencyRecord {
            idempotency_key: key.to_string(),
            content_hash: hash.to_string(),
            status_code: 201,
            response_body: json!({"resourceId": "r-1"}),
            created_at_utc: Utc::now(),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": {"y": 2, "x": 1}, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": {"x": 1, "y": 2}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":[1,2],"b":{"x":1,"y":2}}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        assert_ne!(canonical_json(&json!([1, 2])), canonical_json(&json!([2, 1])));
    }

    #[test]
    fn canonical_json_escapes_strings() {
        let value = json!({"note": "line\nbreak \"quoted\""});
        assert_eq!(
            canonical_json(&value),
            r#"{"note":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn content_hash_is_order_insensitive_for_objects() {
        let a = json!({"path": "/resources", "body": {"name": "SalaA", "details": "Piso 1"}});
        let b = json!({"body": {"details": "Piso 1", "name": "SalaA"}, "path": "/resources"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_differs_on_content_change() {
        let a = json!({"path": "/resources", "body": {"name": "SalaA"}});
        let b = json!({"path": "/resources", "body": {"name": "SalaB"}});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn fingerprint_omits_absent_actor() {
        let anon = fingerprint("/auth/register", &json!({"email": "a@b.c"}), None);
        assert!(anon.get("actor").is_none());

        let actor = Uuid::now_v7();
        let authed = fingerprint("/resources", &json!({}), Some(actor));
        assert_eq!(authed["actor"], actor.to_string());
    }

    #[test]
    fn decide_new_when_no_record() {
        let content = json!({"path": "/x", "body": {}});
        match decide(None, &content) {
            IdempotencyDecision::New { content_hash: hash } => {
                assert_eq!(hash, content_hash(&content));
            }
            other => panic!("expected New, got: {other:?}"),
        }
    }

    #[test]
    fn decide_replay_on_matching_hash() {
        let content = json!({"path": "/x", "body": {"n": 1}});
        let stored = record("key-1", &content_hash(&content));
        let decision = decide(Some(stored.clone()), &content);
        assert_eq!(decision, IdempotencyDecision::Replay(stored));
    }

    #[test]
    fn decide_mismatch_on_different_content() {
        let stored = record("key-1", &content_hash(&json!({"path": "/x", "body": {"n": 1}})));
        let decision = decide(Some(stored), &json!({"path": "/x", "body": {"n": 2}}));
        assert_eq!(decision, IdempotencyDecision::Mismatch);
    }

    #[tokio::test]
    async fn store_save_then_load_roundtrips() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let store = IdempotencyStore::new(docs, "idempotency_table");
        let rec = record("key-1", "abc");

        store.save(&rec).await.expect("save should succeed");
        let loaded = store
            .load("key-1")
            .await
            .expect("load should succeed")
            .expect("record should exist");
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn duplicate_save_raises_already_exists() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let store = IdempotencyStore::new(docs, "idempotency_table");
        let rec = record("key-1", "abc");

        store.save(&rec).await.expect("first save should succeed");
        let second = store.save(&rec).await;
        assert!(matches!(
            second,
            Err(DocumentStoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn load_missing_key_returns_none() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let store = IdempotencyStore::new(docs, "idempotency_table");
        let loaded = store.load("ghost").await.expect("load should succeed");
        assert!(loaded.is_none());
    }
}
