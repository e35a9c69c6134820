//! Log-structured backend.

use std::path::Path;

use anyhow::{Context, Result};

use super::{Batch, Store, StoreError, StoreResult};

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).context("failed to open database")?;
        Ok(SledStore { db })
    }
}

impl Store for SledStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        match self.db.get(key).map_err(StoreError::backend)? {
            Some(v) => Ok(v.to_vec()),
            None => Err(StoreError::NotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(StoreError::backend)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(StoreError::backend)
    }

    fn seek(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8])) -> StoreResult<()> {
        // scan_prefix iterates in ascending key order.
        for entry in self.db.scan_prefix(prefix) {
            let (k, v) = entry.map_err(StoreError::backend)?;
            f(&k, &v);
        }
        Ok(())
    }

    fn put_batch(&self, batch: Batch) -> StoreResult<()> {
        let mut sled_batch = sled::Batch::default();
        for (k, v) in batch.puts() {
            sled_batch.insert(k.as_slice(), v.as_slice());
        }
        for k in batch.deletes() {
            sled_batch.remove(k.as_slice());
        }
        self.db.apply_batch(sled_batch).map_err(StoreError::backend)
    }
}
