//! Storage trait definitions for Ripple
//!
//! `HistoryStore` persists one JSON document per finished cascade execution
//! and exposes them as a read-only, newest-first paginated list.
//!
//! The trait is async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// HistoryKey
// ---------------------------------------------------------------------------

/// Sortable key of a history entry: `<started_at>-<execution_id>`.
///
/// The timestamp is rendered as `%Y%m%dT%H%M%S%3fZ` so that lexicographic
/// order equals chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistoryKey(String);

impl HistoryKey {
    /// Build the key for an execution that started at `started_at`.
    pub fn new(started_at: DateTime<Utc>, execution_id: &str) -> Self {
        HistoryKey(format!(
            "{}-{}",
            started_at.format("%Y%m%dT%H%M%S%3fZ"),
            execution_id
        ))
    }

    /// Validate a key read back from a backend (e.g. a file stem).
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey {
                key: raw.to_string(),
            });
        }
        Ok(HistoryKey(raw.to_string()))
    }

    /// Return the full key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// HistoryEntry
// ---------------------------------------------------------------------------

/// A finished execution as persisted in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Execution id (timestamp + random suffix).
    pub execution_id: String,
    /// Repo id the cascade started from.
    pub source_id: String,
    /// Terminal status label (`completed`, `aborted`).
    pub status: String,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached its terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Full execution document, including the mutated plan.
    pub document: serde_json::Value,
}

impl HistoryEntry {
    /// Key under which this entry is stored.
    pub fn key(&self) -> HistoryKey {
        HistoryKey::new(self.started_at, &self.execution_id)
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Entries in this page.
    pub entries: Vec<HistoryEntry>,
    /// Total number of entries in the store.
    pub total: usize,
    /// Offset this page starts at.
    pub offset: usize,
}

impl HistoryPage {
    /// Whether entries exist beyond this page.
    pub fn has_more(&self) -> bool {
        self.offset + self.entries.len() < self.total
    }
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

/// Persistence for finished cascade executions.
///
/// Guarantees:
/// - `save(entry)` returns `entry.key()`; saving the same execution twice
///   overwrites the previous document.
/// - `list` returns entries ordered by key, newest first.
/// - `get(id)` returns `StorageError::NotFound` for unknown ids.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a finished execution.
    async fn save(&self, entry: HistoryEntry) -> StorageResult<HistoryKey>;

    /// List entries newest first, skipping `offset` and returning at most `limit`.
    async fn list(&self, offset: usize, limit: usize) -> StorageResult<HistoryPage>;

    /// Fetch the entry for a single execution.
    async fn get(&self, execution_id: &str) -> StorageResult<HistoryEntry>;
}
