use super::entry::{LogEntry, PendingEntry, GENESIS_HASH};
use super::state::{Applier, ApplyError, ReplicatedState};
use super::{LogError, LogResult};
use crate::crypto::NodeIdentity;
use crate::storage::Storage;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ENTRY_PREFIX: &[u8] = b"e:";
const ENTRY_PREFIX_END: &[u8] = b"e;";
const PENDING_PREFIX: &[u8] = b"p:";
const PENDING_PREFIX_END: &[u8] = b"p;";
const COMMAND_PREFIX: &[u8] = b"c:";
const META_LAST_INDEX: &[u8] = b"m:last_index";
const META_COMMIT_INDEX: &[u8] = b"m:commit_index";
const META_APPLIED_INDEX: &[u8] = b"m:applied_index";

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn prefixed(prefix: &[u8], id: &str) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(u64),
    /// Already stored with the same hash.
    Duplicate(u64),
    /// Entry does not extend the local chain; resend after `last_index`.
    Gap { last_index: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub checked: u64,
    pub first_break: Option<u64>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Append-only hash chain, pending gossip entries and replicated state.
pub struct LogStore {
    storage: Arc<dyn Storage>,
    state: ReplicatedState,
    write_lock: Mutex<()>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl LogStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        LogStore {
            state: ReplicatedState::new(storage.clone()),
            storage,
            write_lock: Mutex::new(()),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &ReplicatedState {
        &self.state
    }

    fn read_meta(&self, key: &[u8]) -> LogResult<u64> {
        Ok(match self.storage.get(key)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        })
    }

    fn write_meta(&self, key: &[u8], value: u64) -> LogResult<()> {
        self.storage.put(key, &value.to_be_bytes())?;
        Ok(())
    }

    pub fn last_index(&self) -> LogResult<u64> {
        self.read_meta(META_LAST_INDEX)
    }

    pub fn commit_index(&self) -> LogResult<u64> {
        self.read_meta(META_COMMIT_INDEX)
    }

    pub fn applied_index(&self) -> LogResult<u64> {
        self.read_meta(META_APPLIED_INDEX)
    }

    pub fn get_entry(&self, index: u64) -> LogResult<Option<LogEntry>> {
        if index == 0 {
            return Ok(None);
        }
        match self.storage.get(&entry_key(index))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_last_entry(&self) -> LogResult<Option<LogEntry>> {
        let last = self.last_index()?;
        self.get_entry(last)
    }

    fn hash_at(&self, index: u64) -> LogResult<String> {
        if index == 0 {
            return Ok(GENESIS_HASH.to_string());
        }
        self.get_entry(index)?
            .map(|e| e.hash)
            .ok_or(LogError::ChainBreak { index })
    }

    fn write_entry(&self, entry: &LogEntry) -> LogResult<()> {
        self.storage
            .put(&entry_key(entry.index), &serde_json::to_vec(entry)?)?;
        self.storage.put(
            &prefixed(COMMAND_PREFIX, &entry.command_id),
            &entry.index.to_be_bytes(),
        )?;
        self.storage.del(&prefixed(PENDING_PREFIX, &entry.command_id))?;
        self.write_meta(META_LAST_INDEX, entry.index)
    }

    /// Originate a new entry on top of the local chain.
    pub fn append(
        &self,
        term: u64,
        payload: Value,
        command_id: String,
        identity: &NodeIdentity,
        created_at: u64,
    ) -> LogResult<LogEntry> {
        let _guard = self.write_lock.lock();
        let last = self.last_index()?;
        let previous_hash = self.hash_at(last)?;
        let entry = LogEntry::new(
            &previous_hash,
            last + 1,
            term,
            created_at,
            command_id,
            payload,
            identity,
        );
        self.write_entry(&entry)?;
        debug!(index = entry.index, term, "Log: entry appended");
        Ok(entry)
    }

    /// Accept an entry produced elsewhere if it extends the local chain.
    ///
    /// A divergent suffix above the commit index is truncated so the incoming
    /// chain can replace it; divergence at or below it is an error.
    pub fn append_replicated(&self, entry: LogEntry) -> LogResult<AppendOutcome> {
        if entry.index == 0 {
            return Err(LogError::InvalidIndex(0));
        }
        if !entry.verify_signature() {
            return Err(LogError::InvalidSignature { index: entry.index });
        }

        let _guard = self.write_lock.lock();
        let mut last = self.last_index()?;
        let commit = self.commit_index()?;

        if entry.index <= last {
            if let Some(existing) = self.get_entry(entry.index)? {
                if existing.hash == entry.hash {
                    return Ok(AppendOutcome::Duplicate(entry.index));
                }
            }
            if entry.index <= commit {
                return Err(LogError::CommittedConflict { index: entry.index });
            }
            self.truncate_locked(entry.index)?;
            last = entry.index - 1;
        }

        if entry.index > last + 1 {
            return Ok(AppendOutcome::Gap { last_index: last });
        }

        let previous_hash = self.hash_at(last)?;
        if !entry.links_to(&previous_hash) {
            // Our entry at `last` is not the one the sender built on
            if last == 0 {
                return Err(LogError::ChainBreak { index: entry.index });
            }
            if last <= commit {
                return Err(LogError::CommittedConflict { index: last });
            }
            self.truncate_locked(last)?;
            return Ok(AppendOutcome::Gap { last_index: last - 1 });
        }

        self.write_entry(&entry)?;
        Ok(AppendOutcome::Appended(entry.index))
    }

    /// Remove every entry at or above `from_index`.
    pub fn truncate_from(&self, from_index: u64) -> LogResult<()> {
        let _guard = self.write_lock.lock();
        if from_index <= self.commit_index()? {
            return Err(LogError::CommittedConflict { index: from_index });
        }
        self.truncate_locked(from_index)
    }

    fn truncate_locked(&self, from_index: u64) -> LogResult<()> {
        let last = self.last_index()?;
        for index in (from_index.max(1)..=last).rev() {
            if let Some(entry) = self.get_entry(index)? {
                self.storage
                    .del(&prefixed(COMMAND_PREFIX, &entry.command_id))?;
            }
            self.storage.del(&entry_key(index))?;
        }
        if from_index <= last {
            warn!(from_index, last, "Log: truncated uncommitted suffix");
            self.write_meta(META_LAST_INDEX, from_index.saturating_sub(1))?;
        }
        Ok(())
    }

    /// Up to `limit` entries with index strictly greater than `index`.
    pub fn entries_after(&self, index: u64, limit: usize) -> LogResult<Vec<LogEntry>> {
        let rows = self.storage.scan_range(
            Some(&entry_key(index)),
            Some(ENTRY_PREFIX_END),
            Some(limit),
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Recompute hashes from `from_index` to the tip and report the first break.
    pub fn verify_chain(&self, from_index: u64) -> LogResult<ChainReport> {
        let from_index = from_index.max(1);
        let last = self.last_index()?;
        let mut previous_hash = match self.hash_at(from_index - 1) {
            Ok(hash) => hash,
            Err(LogError::ChainBreak { index }) => {
                return Ok(ChainReport {
                    checked: 0,
                    first_break: Some(index),
                })
            }
            Err(e) => return Err(e),
        };

        let mut checked = 0;
        let mut expected = from_index;
        while expected <= last {
            let batch = self.entries_after(expected - 1, 256)?;
            if batch.is_empty() {
                return Ok(ChainReport {
                    checked,
                    first_break: Some(expected),
                });
            }
            for entry in batch {
                if entry.index != expected
                    || !entry.links_to(&previous_hash)
                    || !entry.verify_signature()
                {
                    return Ok(ChainReport {
                        checked,
                        first_break: Some(expected),
                    });
                }
                previous_hash = entry.hash;
                checked += 1;
                expected += 1;
                if expected > last {
                    break;
                }
            }
        }

        Ok(ChainReport {
            checked,
            first_break: None,
        })
    }

    /// Raise the commit index (never lowers it, never past the tip).
    pub fn set_commit_index(&self, index: u64) -> LogResult<u64> {
        let _guard = self.write_lock.lock();
        let target = index.min(self.last_index()?);
        let current = self.commit_index()?;
        if target > current {
            self.write_meta(META_COMMIT_INDEX, target)?;
            return Ok(target);
        }
        Ok(current)
    }

    /// Fold committed entries up to `up_to` into the replicated state.
    ///
    /// Entries already applied are skipped, so repeating a call is a no-op.
    /// Stops with `ChainBreak` at the first entry that does not link to its
    /// predecessor; nothing past the break is applied.
    pub async fn apply_committed(&self, up_to: u64, applier: &dyn Applier) -> LogResult<u64> {
        let _apply = self.apply_lock.lock().await;

        let target = self.set_commit_index(up_to)?;
        let mut applied = self.applied_index()?;
        if applied >= target {
            return Ok(applied);
        }

        let mut previous_hash = self.hash_at(applied)?;
        while applied < target {
            let index = applied + 1;
            let entry = self
                .get_entry(index)?
                .ok_or(LogError::ChainBreak { index })?;
            if !entry.links_to(&previous_hash) {
                error!(index, "Log: chain break, refusing to apply");
                return Err(LogError::ChainBreak { index });
            }

            match applier.apply(&entry.payload, &self.state).await {
                Ok(()) => {}
                Err(ApplyError::InvalidCommand(reason)) => {
                    warn!(index, %reason, "Log: command rejected by applier");
                }
                Err(e) => return Err(e.into()),
            }

            self.write_meta(META_APPLIED_INDEX, index)?;
            previous_hash = entry.hash;
            applied = index;
        }

        info!(applied, "Log: committed entries applied");
        Ok(applied)
    }

    pub fn put_pending(&self, pending: &PendingEntry) -> LogResult<bool> {
        if self.is_appended(&pending.command_id)? {
            return Ok(false);
        }
        let key = prefixed(PENDING_PREFIX, &pending.command_id);
        if self.storage.get(&key)?.is_some() {
            return Ok(false);
        }
        self.storage.put(&key, &serde_json::to_vec(pending)?)?;
        Ok(true)
    }

    /// Pending entries ordered by origin then gossip version.
    pub fn pending_entries(&self) -> LogResult<Vec<PendingEntry>> {
        let rows = self
            .storage
            .scan_range(Some(PENDING_PREFIX), Some(PENDING_PREFIX_END), None)?;
        let mut out: Vec<PendingEntry> = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            out.push(serde_json::from_slice(&value)?);
        }
        out.sort_by(|a, b| (a.origin, a.version).cmp(&(b.origin, b.version)));
        Ok(out)
    }

    pub fn remove_pending(&self, command_id: &str) -> LogResult<()> {
        self.storage.del(&prefixed(PENDING_PREFIX, command_id))?;
        Ok(())
    }

    pub fn is_appended(&self, command_id: &str) -> LogResult<bool> {
        Ok(self
            .storage
            .get(&prefixed(COMMAND_PREFIX, command_id))?
            .is_some())
    }

    pub fn close(&self) -> LogResult<()> {
        self.storage.close()?;
        Ok(())
    }
}
