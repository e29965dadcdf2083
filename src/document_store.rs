//! Document-store abstraction for projection tables and idempotency.
//!
//! Tables are flat key → JSON-object maps. The contract mirrors what the
//! query side and the idempotency gate need: full-item put, insert-if-
//! absent (the duplicate-submission lock), attribute-set update with
//! upsert semantics, and a filtered scan paginated by an opaque
//! base64url cursor over the store's continuation key.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

/// Failures surfaced by a document backend.
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    /// Insert-if-absent lost: the key already holds an item.
    #[error("item already exists: {table}/{key}")]
    AlreadyExists { table: String, key: String },

    /// An opaque scan cursor that did not come from this store.
    #[error("malformed scan cursor")]
    BadCursor,

    #[error("document store error: {0}")]
    Transport(String),
}

/// One page of a filtered scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub items: Vec<Value>,
    /// Opaque cursor for the next page; `None` when the scan is done.
    pub next_cursor: Option<String>,
}

/// Document-store contract consumed by the worker, the idempotency gate,
/// and the read-side helpers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, DocumentStoreError>;

    /// Full-item overwrite keyed by the aggregate id. Idempotent.
    async fn put(&self, table: &str, key: &str, item: Value) -> Result<(), DocumentStoreError>;

    /// Insert only if the key is vacant.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::AlreadyExists`] when the key holds an item.
    async fn put_if_absent(
        &self,
        table: &str,
        key: &str,
        item: Value,
    ) -> Result<(), DocumentStoreError>;

    /// Set attributes on an item, creating it if absent.
    async fn update(
        &self,
        table: &str,
        key: &str,
        attrs: Map<String, Value>,
    ) -> Result<(), DocumentStoreError>;

    /// Scan a table with top-level equality filters.
    ///
    /// `limit` bounds the page size; `cursor` continues a prior page.
    async fn scan(
        &self,
        table: &str,
        filter: &[(String, Value)],
        limit: usize,
        cursor: Option<String>,
    ) -> Result<ScanPage, DocumentStoreError>;
}

/// Encode a store continuation key as an opaque client-facing cursor.
pub fn encode_cursor(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Decode a client-facing cursor back into the store continuation key.
pub fn decode_cursor(cursor: &str) -> Result<String, DocumentStoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| DocumentStoreError::BadCursor)?;
    String::from_utf8(bytes).map_err(|_| DocumentStoreError::BadCursor)
}

/// In-memory [`DocumentStore`]. Tables are created lazily on first write.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>>, DocumentStoreError>
    {
        self.tables
            .lock()
            .map_err(|e| DocumentStoreError::Transport(e.to_string()))
    }

    /// Number of items in a table (0 for unknown tables).
    pub fn table_len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.get(table).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn matches_filter(item: &Value, filter: &[(String, Value)]) -> bool {
    filter
        .iter()
        .all(|(attr, expected)| item.get(attr) == Some(expected))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, DocumentStoreError> {
        let tables = self.locked()?;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, key: &str, item: Value) -> Result<(), DocumentStoreError> {
        let mut tables = self.locked()?;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), item);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        table: &str,
        key: &str,
        item: Value,
    ) -> Result<(), DocumentStoreError> {
        let mut tables = self.locked()?;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(key) {
            return Err(DocumentStoreError::AlreadyExists {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        rows.insert(key.to_string(), item);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        attrs: Map<String, Value>,
    ) -> Result<(), DocumentStoreError> {
        let mut tables = self.locked()?;
        let rows = tables.entry(table.to_string()).or_default();
        let item = rows
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(fields) = item {
            for (attr, value) in attrs {
                fields.insert(attr, value);
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        filter: &[(String, Value)],
        limit: usize,
        cursor: Option<String>,
    ) -> Result<ScanPage, DocumentStoreError> {
        let start = match cursor {
            Some(cursor) => Bound::Excluded(decode_cursor(&cursor)?),
            None => Bound::Unbounded,
        };
        let tables = self.locked()?;
        let Some(rows) = tables.get(table) else {
            return Ok(ScanPage {
                items: Vec::new(),
                next_cursor: None,
            });
        };

        let limit = limit.max(1);
        let mut items = Vec::new();
        let mut last_key: Option<&String> = None;
        let mut exhausted = true;
        for (key, item) in rows.range((start, Bound::Unbounded)) {
            if items.len() == limit {
                exhausted = false;
                break;
            }
            if matches_filter(item, filter) {
                items.push(item.clone());
            }
            last_key = Some(key);
        }
        let next_cursor = match (exhausted, last_key) {
            (false, Some(key)) => Some(encode_cursor(key)),
            _ => None,
        };
        Ok(ScanPage { items, next_cursor })
    }
}
