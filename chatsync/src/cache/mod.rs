//! Durable per-peer message storage.
//!
//! A namespace (e.g. `"chatMessages"`) holds one JSON object mapping the
//! stringified peer id to that peer's ordered message array. The engine
//! writes the whole namespace through after every timeline mutation.
//!
//! Implementations:
//! - [`MemoryCache`]: process-local, for tests and ephemeral sessions
//! - [`file::FileCache`]: one `<namespace>.json` per namespace on disk

pub mod file;

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use chatsync_proto::message::Message;

/// Contents of one namespace: stringified peer id to message array.
pub type CacheSnapshot = BTreeMap<String, Vec<Message>>;

/// Errors from reading or writing the cache.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The backing storage failed.
    #[error("cache I/O failed for namespace {namespace}: {source}")]
    Io {
        /// Namespace being accessed.
        namespace: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The stored record could not be decoded.
    #[error("cache record for namespace {namespace} is corrupt: {source}")]
    Corrupt {
        /// Namespace being read.
        namespace: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// The snapshot could not be encoded.
    #[error("failed to encode cache snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    /// The namespace cannot be used as a storage key.
    #[error("invalid cache namespace: {0:?}")]
    InvalidNamespace(String),

    /// The storage backend is unavailable.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Read/write access to namespaced message snapshots.
///
/// A namespace that was never written reads as an empty snapshot.
pub trait PersistentCache: Send + Sync + 'static {
    /// Load the full snapshot of `namespace`.
    fn read(
        &self,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<CacheSnapshot, PersistenceError>> + Send;

    /// Replace the stored snapshot of `namespace`.
    fn write(
        &self,
        namespace: &str,
        snapshot: &CacheSnapshot,
    ) -> impl std::future::Future<Output = Result<(), PersistenceError>> + Send;
}

impl<T: PersistentCache> PersistentCache for std::sync::Arc<T> {
    async fn read(&self, namespace: &str) -> Result<CacheSnapshot, PersistenceError> {
        self.as_ref().read(namespace).await
    }

    async fn write(&self, namespace: &str, snapshot: &CacheSnapshot) -> Result<(), PersistenceError> {
        self.as_ref().write(namespace, snapshot).await
    }
}

/// In-memory [`PersistentCache`].
///
/// Records are kept as serialized JSON so reads go through the same decode
/// path as the file-backed cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `namespace` with a raw record, e.g. to simulate a previous session.
    pub async fn insert_raw(&self, namespace: &str, record: impl Into<String>) {
        self.records
            .lock()
            .await
            .insert(namespace.to_string(), record.into());
    }

    /// The raw stored record of `namespace`, if any.
    pub async fn raw(&self, namespace: &str) -> Option<String> {
        self.records.lock().await.get(namespace).cloned()
    }
}

impl PersistentCache for MemoryCache {
    async fn read(&self, namespace: &str) -> Result<CacheSnapshot, PersistenceError> {
        let records = self.records.lock().await;
        records.get(namespace).map_or_else(
            || Ok(CacheSnapshot::new()),
            |record| decode_record(namespace, record),
        )
    }

    async fn write(&self, namespace: &str, snapshot: &CacheSnapshot) -> Result<(), PersistenceError> {
        let record = serde_json::to_string(snapshot)?;
        self.records
            .lock()
            .await
            .insert(namespace.to_string(), record);
        Ok(())
    }
}

/// Decode a stored namespace record.
fn decode_record(namespace: &str, record: &str) -> Result<CacheSnapshot, PersistenceError> {
    serde_json::from_str(record).map_err(|source| PersistenceError::Corrupt {
        namespace: namespace.to_string(),
        source,
    })
}
