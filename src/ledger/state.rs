//! Replicated key-value state and the appliers that mutate it

use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

const STATE_PREFIX: &[u8] = b"s:";
const STATE_PREFIX_END: &[u8] = b"s;";

#[derive(Error, Debug)]
pub enum ApplyError {
    /// Deterministic rejection; every node skips the command alike.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// State mutated only by an `Applier` folding committed entries.
#[derive(Clone)]
pub struct ReplicatedState {
    storage: Arc<dyn Storage>,
}

fn state_key(key: &str) -> Vec<u8> {
    let mut out = STATE_PREFIX.to_vec();
    out.extend_from_slice(key.as_bytes());
    out
}

impl ReplicatedState {
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, ApplyError> {
        match self.storage.get(&state_key(key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &Value) -> Result<(), ApplyError> {
        self.storage.put(&state_key(key), &serde_json::to_vec(value)?)?;
        Ok(())
    }

    pub fn del(&self, key: &str) -> Result<(), ApplyError> {
        self.storage.del(&state_key(key))?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(String, Value)>, ApplyError> {
        let rows = self
            .storage
            .scan_range(Some(STATE_PREFIX), Some(STATE_PREFIX_END), None)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let key = String::from_utf8_lossy(&key[STATE_PREFIX.len()..]).into_owned();
            out.push((key, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }
}

/// Deterministic fold of one committed command into the state.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, command: &Value, state: &ReplicatedState) -> Result<(), ApplyError>;
}

/// Applies `{"op":"put","key":k,"value":v}` and `{"op":"del","key":k}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KvApplier;

#[async_trait]
impl Applier for KvApplier {
    async fn apply(&self, command: &Value, state: &ReplicatedState) -> Result<(), ApplyError> {
        let key = command
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ApplyError::InvalidCommand("missing key".to_string()))?;

        match command.get("op").and_then(Value::as_str) {
            Some("put") => {
                let value = command.get("value").cloned().unwrap_or(Value::Null);
                state.put(key, &value)
            }
            Some("del") => state.del(key),
            Some(other) => Err(ApplyError::InvalidCommand(format!("unknown op {}", other))),
            None => Err(ApplyError::InvalidCommand("missing op".to_string())),
        }
    }
}
