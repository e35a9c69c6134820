//! Backing key/value stores.
//!
//! Every backend satisfies the same contract: byte keys with lexicographic
//! prefix iteration, an atomic batch write, and a distinct `NotFound`
//! sentinel for missing keys. [`MemCachedStore`] layers an in-memory
//! overlay on top of any backend and is the unit of transactional scoping
//! for the DAO.

pub mod memcached;
pub mod memory;
pub mod redb_store;
pub mod sled_store;

pub use memcached::{KeyValue, MemCachedStore};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use sled_store::SledStore;

use thiserror::Error;

/// Unified store error so callers do not depend on backend-specific enums.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing key. A sentinel, not a failure; consumers pattern-match it.
    #[error("key not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        StoreError::Backend(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Accumulated mutations applied atomically by [`Store::put_batch`].
#[derive(Debug, Default)]
pub struct Batch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
    deletes: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.puts.push((key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.deletes.push(key.to_vec());
    }

    pub fn puts(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.puts
    }

    pub fn deletes(&self) -> &[Vec<u8>] {
        &self.deletes
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// The backing store contract.
///
/// `seek` must deliver all keys with the given prefix in ascending
/// lexicographic order; the callback must not mutate the store. Deleting a
/// missing key is not an error.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    fn seek(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8])) -> StoreResult<()>;

    /// Applies the whole batch atomically.
    fn put_batch(&self, batch: Batch) -> StoreResult<()>;
}
