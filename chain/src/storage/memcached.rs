//! Write-through overlay store, the transactional scratchpad of the DAO.
//!
//! The overlay is a single flat map from key to `Option<value>`; `None` is
//! a delete tombstone. Wrapping one `MemCachedStore` in another creates a
//! nested transactional scope: `persist` commits exactly one layer into its
//! parent, dropping the wrapper aborts it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::thread;

use crossbeam_channel::{bounded, Receiver, select};

use super::{Batch, Store, StoreError, StoreResult};

/// One streamed pair from [`MemCachedStore::seek_async`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub struct MemCachedStore {
    layer: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    parent: Arc<dyn Store>,
}

impl MemCachedStore {
    pub fn new(parent: Arc<dyn Store>) -> Self {
        MemCachedStore {
            layer: RwLock::new(BTreeMap::new()),
            parent,
        }
    }

    /// Atomically flushes the overlay into the parent and empties it,
    /// returning the number of pairs written.
    pub fn persist(&self) -> StoreResult<usize> {
        let mut layer = self.layer.write().unwrap_or_else(|e| e.into_inner());
        let count = layer.len();
        let mut batch = Batch::new();
        for (key, value) in layer.iter() {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.parent.put_batch(batch)?;
        layer.clear();
        Ok(count)
    }

    /// Streams all prefixed pairs over a channel from a worker thread.
    /// Closing (or dropping) the cancellation channel stops the stream and
    /// closes the output.
    pub fn seek_async(&self, prefix: &[u8], cancel: Receiver<()>) -> Receiver<KeyValue> {
        // The snapshot is taken synchronously so the caller can keep
        // mutating the store while the stream drains.
        let mut snapshot = Vec::new();
        let _ = self.seek(prefix, &mut |k, v| {
            snapshot.push(KeyValue {
                key: k.to_vec(),
                value: v.to_vec(),
            })
        });
        let (tx, rx) = bounded(16);
        thread::spawn(move || {
            for kv in snapshot {
                match cancel.try_recv() {
                    Err(crossbeam_channel::TryRecvError::Empty) => {}
                    _ => return,
                }
                select! {
                    send(tx, kv) -> res => {
                        if res.is_err() {
                            return;
                        }
                    }
                    recv(cancel) -> _ => return,
                }
            }
        });
        rx
    }
}

impl Store for MemCachedStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        {
            let layer = self.layer.read().unwrap_or_else(|e| e.into_inner());
            match layer.get(key) {
                Some(Some(v)) => return Ok(v.clone()),
                Some(None) => return Err(StoreError::NotFound),
                None => {}
            }
        }
        self.parent.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.layer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.layer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn seek(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8])) -> StoreResult<()> {
        // Merge the sorted overlay with the parent stream, overlay entries
        // shadowing parent ones and tombstones suppressing them.
        let overlay: Vec<(Vec<u8>, Option<Vec<u8>>)> = {
            let layer = self.layer.read().unwrap_or_else(|e| e.into_inner());
            layer
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut idx = 0usize;
        self.parent.seek(prefix, &mut |k, v| {
            while idx < overlay.len() && overlay[idx].0.as_slice() < k {
                let (ok, ov) = &overlay[idx];
                if let Some(ov) = ov {
                    f(ok, ov);
                }
                idx += 1;
            }
            if idx < overlay.len() && overlay[idx].0.as_slice() == k {
                if let Some(ov) = &overlay[idx].1 {
                    f(k, ov);
                }
                idx += 1;
                return;
            }
            f(k, v);
        })?;
        while idx < overlay.len() {
            let (ok, ov) = &overlay[idx];
            if let Some(ov) = ov {
                f(ok, ov);
            }
            idx += 1;
        }
        Ok(())
    }

    fn put_batch(&self, batch: Batch) -> StoreResult<()> {
        let mut layer = self.layer.write().unwrap_or_else(|e| e.into_inner());
        for (k, v) in batch.puts() {
            layer.insert(k.clone(), Some(v.clone()));
        }
        for k in batch.deletes() {
            layer.insert(k.clone(), None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crossbeam_channel::unbounded;

    fn stacked() -> (Arc<MemoryStore>, MemCachedStore) {
        let bottom = Arc::new(MemoryStore::new());
        let cached = MemCachedStore::new(bottom.clone());
        (bottom, cached)
    }

    #[test]
    fn reads_fall_through_and_tombstones_shadow() {
        let (bottom, cached) = stacked();
        bottom.put(b"k", b"old").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), b"old");
        cached.put(b"k", b"new").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), b"new");
        cached.delete(b"k").unwrap();
        assert!(cached.get(b"k").unwrap_err().is_not_found());
        // The parent stays untouched until persist.
        assert_eq!(bottom.get(b"k").unwrap(), b"old");
    }

    #[test]
    fn persist_flushes_one_layer_and_counts_pairs() {
        let (bottom, cached) = stacked();
        bottom.put(b"dead", b"x").unwrap();
        cached.put(b"a", b"1").unwrap();
        cached.delete(b"dead").unwrap();
        assert_eq!(cached.persist().unwrap(), 2);
        assert_eq!(bottom.get(b"a").unwrap(), b"1");
        assert!(bottom.get(b"dead").unwrap_err().is_not_found());
        // Nothing left to flush.
        assert_eq!(cached.persist().unwrap(), 0);
    }

    #[test]
    fn seek_merges_overlay_and_parent_in_order() {
        let (bottom, cached) = stacked();
        bottom.put(b"p/b", b"parent-b").unwrap();
        bottom.put(b"p/d", b"parent-d").unwrap();
        cached.put(b"p/a", b"layer-a").unwrap();
        cached.put(b"p/b", b"layer-b").unwrap();
        cached.delete(b"p/d").unwrap();
        cached.put(b"p/e", b"layer-e").unwrap();

        let mut seen = Vec::new();
        cached
            .seek(b"p/", &mut |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"p/a".to_vec(), b"layer-a".to_vec()),
                (b"p/b".to_vec(), b"layer-b".to_vec()),
                (b"p/e".to_vec(), b"layer-e".to_vec()),
            ]
        );
    }

    #[test]
    fn seek_async_stops_on_cancel() {
        let (_, cached) = stacked();
        for i in 0..100u8 {
            cached.put(&[b'x', i], &[i]).unwrap();
        }
        let (cancel_tx, cancel_rx) = unbounded();
        let rx = cached.seek_async(b"x", cancel_rx);
        let first = rx.recv().unwrap();
        assert_eq!(first.key, vec![b'x', 0]);
        drop(cancel_tx);
        // The stream must terminate (not necessarily immediately on the
        // next item, the worker may already be blocked in send).
        let mut drained = 0;
        while rx.recv().is_ok() {
            drained += 1;
            assert!(drained < 100);
        }
    }
}
