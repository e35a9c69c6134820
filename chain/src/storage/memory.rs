//! In-memory store used in tests and as the bottom of throwaway stacks.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Batch, Store, StoreError, StoreResult};

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.read().get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.write().remove(key);
        Ok(())
    }

    fn seek(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8])) -> StoreResult<()> {
        // BTreeMap ranges are already in ascending key order.
        let guard = self.read();
        for (k, v) in guard.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            f(k, v);
        }
        Ok(())
    }

    fn put_batch(&self, batch: Batch) -> StoreResult<()> {
        let mut guard = self.write();
        for (k, v) in batch.puts() {
            guard.insert(k.clone(), v.clone());
        }
        for k in batch.deletes() {
            guard.remove(k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.get(b"absent").unwrap_err().is_not_found());
    }

    #[test]
    fn seek_is_prefix_bounded_and_ordered() {
        let store = MemoryStore::new();
        store.put(b"a/2", b"2").unwrap();
        store.put(b"a/1", b"1").unwrap();
        store.put(b"b/1", b"x").unwrap();
        let mut seen = Vec::new();
        store
            .seek(b"a/", &mut |k, _| seen.push(k.to_vec()))
            .unwrap();
        assert_eq!(seen, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    #[test]
    fn batch_is_applied_in_full() {
        let store = MemoryStore::new();
        store.put(b"gone", b"1").unwrap();
        let mut batch = Batch::new();
        batch.put(b"new", b"2");
        batch.delete(b"gone");
        store.put_batch(batch).unwrap();
        assert_eq!(store.get(b"new").unwrap(), b"2");
        assert!(store.get(b"gone").unwrap_err().is_not_found());
    }
}
