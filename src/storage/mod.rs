//! Ordered key-value byte storage consumed by the log store
//!
//! ## Structure
//! - `memory.rs` - `BTreeMap` backed adapter for tests and simulations
//! - `sqlite.rs` - SQLite backed adapter used by the node binary

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Ordered byte store. Keys compare lexicographically.
pub trait Storage: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn del(&self, key: &[u8]) -> StorageResult<()>;

    /// Entries with `gt < key < lt` in ascending key order, at most `limit` of them.
    fn scan_range(
        &self,
        gt: Option<&[u8]>,
        lt: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<KeyValue>>;

    fn close(&self) -> StorageResult<()>;
}
