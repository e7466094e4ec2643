//! Filesystem-backed history store: one JSON document per finished execution,
//! written to a temp file and renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{HistoryEntry, HistoryKey, HistoryPage, HistoryStore, StorageResult};

/// Filesystem-backed history store.
///
/// Layout: `<root>/<key>.json`, one pretty-printed [`HistoryEntry`] per file.
#[derive(Debug, Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
}

impl FsHistoryStore {
    /// Create a new `FsHistoryStore` rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(root: &Path, key: &HistoryKey) -> PathBuf {
        root.join(format!("{}.json", key.as_str()))
    }

    /// All keys currently on disk, newest first. Unparseable file names are skipped.
    fn keys_newest_first(root: &Path) -> StorageResult<Vec<HistoryKey>> {
        let mut keys = Vec::new();
        for dirent in fs::read_dir(root)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match HistoryKey::parse(stem) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping foreign file in history dir"),
            }
        }
        keys.sort_unstable_by(|a, b| b.cmp(a));
        Ok(keys)
    }

    fn read_entry(root: &Path, key: &HistoryKey) -> StorageResult<HistoryEntry> {
        let bytes = fs::read(Self::entry_path(root, key))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("history io task failed: {e}")))?
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn save(&self, entry: HistoryEntry) -> StorageResult<HistoryKey> {
        let key = HistoryKey::parse(entry.key().as_str())?;
        let mut bytes = serde_json::to_vec_pretty(&entry)?;
        bytes.push(b'\n');
        let root = self.root.clone();
        let path = Self::entry_path(&root, &key);

        blocking(move || {
            // Atomic write: temp file in the same directory, then rename.
            let mut tmp = NamedTempFile::new_in(&root)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await?;

        debug!(key = %key, "history entry saved");
        Ok(key)
    }

    async fn list(&self, offset: usize, limit: usize) -> StorageResult<HistoryPage> {
        let root = self.root.clone();
        blocking(move || {
            let keys = Self::keys_newest_first(&root)?;
            let total = keys.len();
            let entries = keys
                .iter()
                .skip(offset)
                .take(limit)
                .map(|key| Self::read_entry(&root, key))
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(HistoryPage {
                entries,
                total,
                offset,
            })
        })
        .await
    }

    async fn get(&self, execution_id: &str) -> StorageResult<HistoryEntry> {
        let root = self.root.clone();
        let suffix = format!("-{execution_id}");
        let execution_id = execution_id.to_string();
        blocking(move || {
            for key in Self::keys_newest_first(&root)? {
                if !key.as_str().ends_with(&suffix) {
                    continue;
                }
                // The suffix alone also matches ids that end with this one.
                let entry = Self::read_entry(&root, &key)?;
                if entry.execution_id == execution_id {
                    return Ok(entry);
                }
            }
            Err(StorageError::NotFound { execution_id })
        })
        .await
    }
}
