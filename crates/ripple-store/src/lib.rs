//! Ripple-Store: execution history persistence for Ripple
//!
//! This crate provides the persistence layer for finished cascade
//! executions. Each execution is stored as one JSON document keyed by its
//! start timestamp and id, and read back as a newest-first paginated list.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable, atomic writes and a backend-agnostic trait.
//!
//! ## Key Components
//!
//! - `HistoryStore`: async persistence trait
//! - `FsHistoryStore`: one file per execution under a root directory
//! - `fakes::MemoryHistoryStore`: in-memory implementation for tests

mod error;
pub mod fakes;
mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::FsHistoryStore;
pub use storage_traits::{HistoryEntry, HistoryKey, HistoryPage, HistoryStore, StorageResult};
