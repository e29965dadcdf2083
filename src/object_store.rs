//! Object-store abstraction the event store is built on.
//!
//! [`BlobStore`] captures the three guarantees the event store needs from a
//! blob backend: paginated prefix listing, byte get, and **create-if-absent**
//! put. Adapters for real backends must normalize their whole
//! precondition-conflict family (`PreconditionFailed`,
//! `ConditionalRequestConflict`, ...) into
//! [`BlobStoreError::AlreadyExists`]; every other transport failure passes
//! through as [`BlobStoreError::Transport`].
//!
//! [`InMemoryBlobStore`] is the reference adapter used by tests and
//! single-process runs. It paginates listings like a real backend so the
//! continuation-token loop in callers is genuinely exercised.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;

/// One page of a prefix listing.
#[derive(Debug, Clone)]
pub struct BlobPage {
    /// Keys in ascending lexicographic order.
    pub keys: Vec<String>,
    /// Opaque continuation token; `None` when the listing is exhausted.
    pub next_token: Option<String>,
}

/// Failures surfaced by a blob backend, post-normalization.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Create-if-absent lost: the key already holds an object.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// No object at the requested key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Any other transport or backend failure, surfaced unchanged.
    #[error("object store error: {0}")]
    Transport(String),
}

/// Minimal blob-store contract consumed by the event store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List keys under `prefix`, one page at a time.
    ///
    /// Pass the previous page's `next_token` to continue; keys within and
    /// across pages arrive in ascending lexicographic order.
    async fn list(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<BlobPage, BlobStoreError>;

    /// Fetch an object's bytes.
    ///
    /// # Errors
    ///
    /// [`BlobStoreError::NotFound`] if no object exists at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Write an object only if the key is currently vacant.
    ///
    /// This is the sole concurrency primitive in the system: two writers
    /// racing for the same key produce exactly one winner.
    ///
    /// # Errors
    ///
    /// [`BlobStoreError::AlreadyExists`] if the key already holds an object.
    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BlobStoreError>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    #[allow(dead_code)] // Recorded for parity with real backends; not read back.
    content_type: String,
    metadata: HashMap<String, String>,
}

/// In-memory [`BlobStore`] with paginated listings.
///
/// Keys live in a `BTreeMap`, so listings are naturally sorted. The page
/// size is configurable; tests use small pages to force multi-page
/// listings through callers' continuation loops.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    page_size: usize,
}

/// Default listing page size, mirroring common backend defaults.
const DEFAULT_PAGE_SIZE: usize = 1000;

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose listings return at most `page_size` keys.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>>, BlobStoreError> {
        self.objects
            .lock()
            .map_err(|e| BlobStoreError::Transport(e.to_string()))
    }

    /// Delete an object. Test hook for simulating listings that omit a
    /// just-written key; not part of [`BlobStore`] because the event log
    /// is append-only.
    pub fn remove(&self, key: &str) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(key);
        }
    }

    /// Read back an object's metadata map, if the object exists.
    pub fn object_metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).map(|o| o.metadata.clone()))
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<BlobPage, BlobStoreError> {
        let objects = self.locked()?;
        // Start strictly after the continuation key, or at the prefix.
        let lower = match &continuation {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut keys = Vec::with_capacity(self.page_size);
        let mut truncated = false;
        for key in objects
            .range((lower, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
        {
            if keys.len() == self.page_size {
                truncated = true;
                break;
            }
            keys.push(key.clone());
        }
        let next_token = if truncated { keys.last().cloned() } else { None };
        Ok(BlobPage { keys, next_token })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let objects = self.locked()?;
        objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BlobStoreError> {
        let mut objects = self.locked()?;
        if objects.contains_key(key) {
            return Err(BlobStoreError::AlreadyExists(key.to_string()));
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                metadata,
            },
        );
        Ok(())
    }
}
