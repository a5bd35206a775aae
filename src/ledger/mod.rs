//! Hash-chained append-only log and the replicated state it feeds
//!
//! ## Structure
//! - `entry.rs` - `LogEntry` hashing/signing and gossip `PendingEntry`
//! - `store.rs` - `LogStore` persisted through the storage adapter
//! - `state.rs` - `ReplicatedState`, the `Applier` trait and `KvApplier`

pub mod entry;
pub mod state;
pub mod store;

pub use entry::{LogEntry, PendingEntry, GENESIS_HASH};
pub use state::{Applier, ApplyError, KvApplier, ReplicatedState};
pub use store::{AppendOutcome, ChainReport, LogStore};

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("hash chain broken at index {index}")]
    ChainBreak { index: u64 },

    #[error("invalid signature on entry {index}")]
    InvalidSignature { index: u64 },

    #[error("entry {index} conflicts with the committed chain")]
    CommittedConflict { index: u64 },

    #[error("invalid entry index {0}")]
    InvalidIndex(u64),
}

pub type LogResult<T> = Result<T, LogError>;
