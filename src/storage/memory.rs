use super::{KeyValue, Storage, StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

pub struct MemoryStorage {
    inner: RwLock<Option<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Some(BTreeMap::new())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let guard = self.inner.read();
        let map = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(StorageError::Closed)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(StorageError::Closed)?;
        map.remove(key);
        Ok(())
    }

    fn scan_range(
        &self,
        gt: Option<&[u8]>,
        lt: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<KeyValue>> {
        let guard = self.inner.read();
        let map = guard.as_ref().ok_or(StorageError::Closed)?;

        let lower = gt.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_vec()));
        let upper = lt.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_vec()));
        if let (Bound::Excluded(lo), Bound::Excluded(hi)) = (&lower, &upper) {
            if lo >= hi {
                return Ok(Vec::new());
            }
        }

        Ok(map
            .range((lower, upper))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.inner.write();
        if guard.take().is_none() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}
