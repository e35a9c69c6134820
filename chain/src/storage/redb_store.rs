//! Single-file B-tree backend.

use std::path::Path;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

use super::{Batch, Store, StoreError, StoreResult};

const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Opens (or creates) the database file and makes sure the data table
    /// exists so later reads cannot fail on a missing table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = if path.as_ref().exists() {
            Database::open(path).context("failed to open database")?
        } else {
            Database::create(path).context("failed to create database")?
        };
        let init = db.begin_write().context("failed to begin write")?;
        init.open_table(DATA).context("failed to open data table")?;
        init.commit().context("failed to commit table init")?;
        Ok(RedbStore { db })
    }
}

impl Store for RedbStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = txn.open_table(DATA).map_err(StoreError::backend)?;
        match table.get(key).map_err(StoreError::backend)? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StoreError::NotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = txn.open_table(DATA).map_err(StoreError::backend)?;
            table.insert(key, value).map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = txn.open_table(DATA).map_err(StoreError::backend)?;
            table.remove(key).map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)
    }

    fn seek(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8])) -> StoreResult<()> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = txn.open_table(DATA).map_err(StoreError::backend)?;
        for entry in table.range(prefix..).map_err(StoreError::backend)? {
            let (k, v) = entry.map_err(StoreError::backend)?;
            if !k.value().starts_with(prefix) {
                break;
            }
            f(k.value(), v.value());
        }
        Ok(())
    }

    fn put_batch(&self, batch: Batch) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = txn.open_table(DATA).map_err(StoreError::backend)?;
            for (k, v) in batch.puts() {
                table
                    .insert(k.as_slice(), v.as_slice())
                    .map_err(StoreError::backend)?;
            }
            for k in batch.deletes() {
                table.remove(k.as_slice()).map_err(StoreError::backend)?;
            }
        }
        txn.commit().map_err(StoreError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_delete() {
        let dir = tempdir().expect("temp dir");
        let store = RedbStore::open(dir.path().join("test.redb")).expect("open");
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), b"v");
        store.delete(b"k").unwrap();
        assert!(store.get(b"k").unwrap_err().is_not_found());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).expect("open");
            store.put(b"persisted", b"yes").unwrap();
        }
        let store = RedbStore::open(&path).expect("reopen");
        assert_eq!(store.get(b"persisted").unwrap(), b"yes");
    }
}
