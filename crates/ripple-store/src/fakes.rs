//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryHistoryStore`, which satisfies the `HistoryStore` contract
//! without touching the filesystem and counts how often `save` was called.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// In-memory history store backed by a `BTreeMap<HistoryKey, HistoryEntry>`.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<BTreeMap<HistoryKey, HistoryEntry>>,
    saves: AtomicUsize,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls observed so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored entry, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, entry: HistoryEntry) -> StorageResult<HistoryKey> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let key = entry.key();
        self.entries.lock().unwrap().insert(key.clone(), entry);
        Ok(key)
    }

    async fn list(&self, offset: usize, limit: usize) -> StorageResult<HistoryPage> {
        let entries = self.entries.lock().unwrap();
        Ok(HistoryPage {
            entries: entries
                .values()
                .rev()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
            total: entries.len(),
            offset,
        })
    }

    async fn get(&self, execution_id: &str) -> StorageResult<HistoryEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .find(|e| e.execution_id == execution_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                execution_id: execution_id.to_string(),
            })
    }
}
