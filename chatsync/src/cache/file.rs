//! File-backed [`PersistentCache`].
//!
//! Each namespace lives in `<dir>/<namespace>.json`. Writes go to a
//! sibling temp file which is then renamed over the record, so a crash
//! mid-write leaves the previous snapshot intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{CacheSnapshot, PersistenceError, PersistentCache, decode_record};

/// Stores namespaces as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Use `dir` as the cache directory. It is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, namespace: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !namespace.starts_with('.');
        if !valid {
            return Err(PersistenceError::InvalidNamespace(namespace.to_string()));
        }
        Ok(self.dir.join(format!("{namespace}.json")))
    }
}

impl PersistentCache for FileCache {
    async fn read(&self, namespace: &str) -> Result<CacheSnapshot, PersistenceError> {
        let path = self.record_path(namespace)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(record) => decode_record(namespace, &record),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheSnapshot::new()),
            Err(source) => Err(PersistenceError::Io {
                namespace: namespace.to_string(),
                source,
            }),
        }
    }

    async fn write(&self, namespace: &str, snapshot: &CacheSnapshot) -> Result<(), PersistenceError> {
        let path = self.record_path(namespace)?;
        let record = serde_json::to_vec(snapshot)?;
        let io_err = |source| PersistenceError::Io {
            namespace: namespace.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &record).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        tracing::trace!(namespace, bytes = record.len(), "cache record written");
        Ok(())
    }
}
