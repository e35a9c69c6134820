//! Inclusion proofs and pre-order traversal.

use std::sync::Arc;

use crate::storage::{MemCachedStore, MemoryStore, Store};
use crate::util::hash::{hash256, Hash256};

use super::node::{split_path, to_nibbles, Node};
use super::trie::{make_storage_key, MptError, Trie};

impl Trie {
    /// Serialized form of every node on the descent path to `key`, in
    /// order. Hash nodes encountered on the way are resolved from the store
    /// and stay expanded afterwards.
    pub fn get_proof(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>, MptError> {
        let path = to_nibbles(key);
        let mut proof = Vec::new();
        let root = self.take_root();
        let (root, result) = self.collect_proof(root, &path, &mut proof);
        self.set_root(root);
        result.map(|_| proof)
    }

    fn collect_proof(
        &mut self,
        curr: Node,
        path: &[u8],
        proof: &mut Vec<Vec<u8>>,
    ) -> (Node, Result<(), MptError>) {
        match curr {
            Node::Leaf(_) => {
                if path.is_empty() {
                    proof.push(curr.to_bytes());
                    (curr, Ok(()))
                } else {
                    (curr, Err(MptError::NotFound))
                }
            }
            Node::Branch(b) => {
                let curr = Node::Branch(b);
                proof.push(curr.to_bytes());
                let Node::Branch(mut b) = curr else {
                    unreachable!()
                };
                let (i, rest) = split_path(path);
                let child = std::mem::replace(&mut b.children[i], Node::empty());
                let (child, result) = self.collect_proof(child, rest, proof);
                b.children[i] = child;
                (Node::Branch(b), result)
            }
            Node::Extension(e) => {
                if !path.starts_with(&e.key) {
                    return (Node::Extension(e), Err(MptError::NotFound));
                }
                let curr = Node::Extension(e);
                proof.push(curr.to_bytes());
                let Node::Extension(mut e) = curr else {
                    unreachable!()
                };
                let next = std::mem::replace(&mut e.next, Node::empty());
                let (next, result) = self.collect_proof(next, &path[e.key.len()..], proof);
                e.next = next;
                (Node::Extension(e), result)
            }
            Node::Hash(h) => match h.hash {
                None => (curr, Err(MptError::NotFound)),
                Some(hash) => match self.get_from_store(&hash) {
                    Ok(resolved) => self.collect_proof(resolved, path, proof),
                    Err(e) => (curr, Err(e)),
                },
            },
        }
    }

    /// Pre-order walk. `process(node, bytes)` returning true halts the walk
    /// without an error; subtrees expanded up to the halt point stay
    /// resolved in place. With `ignore_storage_error`, references to nodes
    /// missing from the store are skipped instead of failing.
    pub fn traverse(
        &mut self,
        process: &mut dyn FnMut(&Node, &[u8]) -> bool,
        ignore_storage_error: bool,
    ) -> Result<(), MptError> {
        let root = self.take_root();
        let (root, result) = self.traverse_inner(root, process, ignore_storage_error);
        self.set_root(root);
        result.map(|_stopped| ())
    }

    fn traverse_inner(
        &mut self,
        curr: Node,
        process: &mut dyn FnMut(&Node, &[u8]) -> bool,
        ignore_storage_error: bool,
    ) -> (Node, Result<bool, MptError>) {
        if let Node::Hash(h) = &curr {
            return match h.hash {
                // Empty nodes do not affect the traversal.
                None => (curr, Ok(false)),
                Some(hash) => match self.get_from_store(&hash) {
                    Ok(resolved) => self.traverse_inner(resolved, process, ignore_storage_error),
                    Err(e) if ignore_storage_error && e.is_missing_node() => (curr, Ok(false)),
                    Err(e) => (curr, Err(e)),
                },
            };
        }

        let bytes = curr.to_bytes();
        if process(&curr, &bytes) {
            return (curr, Ok(true));
        }
        match curr {
            Node::Leaf(_) => (curr, Ok(false)),
            Node::Branch(mut b) => {
                for i in 0..b.children.len() {
                    let child = std::mem::replace(&mut b.children[i], Node::empty());
                    let (child, result) = self.traverse_inner(child, process, ignore_storage_error);
                    b.children[i] = child;
                    match result {
                        Ok(false) => {}
                        other => return (Node::Branch(b), other),
                    }
                }
                (Node::Branch(b), Ok(false))
            }
            Node::Extension(mut e) => {
                let next = std::mem::replace(&mut e.next, Node::empty());
                let (next, result) = self.traverse_inner(next, process, ignore_storage_error);
                e.next = next;
                (Node::Extension(e), result)
            }
            Node::Hash(_) => unreachable!("hash nodes are handled above"),
        }
    }
}

/// Verifies that `proof` ties `key` to a trie with root `root`, returning
/// the stored value on success. The proof elements are loaded into a
/// throwaway trie addressed by their own double-SHA256, then the usual
/// descent is replayed; any unresolvable reference or mismatched byte makes
/// the descent fail.
pub fn verify_proof(root: Hash256, key: &[u8], proof: &[Vec<u8>]) -> Option<Vec<u8>> {
    let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let store = Arc::new(MemCachedStore::new(backend));
    for element in proof {
        let h = hash256(element);
        store.put(&make_storage_key(&h), element).ok()?;
    }
    let mut trie = Trie::new(Some(root), false, store);
    trie.get(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_trie() -> Trie {
        let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let store = Arc::new(MemCachedStore::new(backend));
        Trie::new(None, false, store)
    }

    #[test]
    fn proof_verifies_and_returns_value() {
        let mut trie = new_trie();
        trie.put(b"\xab\xcd", b"hi").unwrap();
        trie.put(b"\xab\xce", b"other").unwrap();
        let root = trie.root_hash();
        let proof = trie.get_proof(b"\xab\xcd").unwrap();
        assert_eq!(verify_proof(root, b"\xab\xcd", &proof), Some(b"hi".to_vec()));
    }

    #[test]
    fn proof_for_missing_key_fails() {
        let mut trie = new_trie();
        trie.put(b"\xab", b"x").unwrap();
        assert!(matches!(
            trie.get_proof(b"\xcd"),
            Err(MptError::NotFound)
        ));
    }

    #[test]
    fn corrupting_any_proof_byte_breaks_verification() {
        let mut trie = new_trie();
        trie.put(b"\xab\xcd", b"hi").unwrap();
        trie.put(b"\x12\x34", b"yo").unwrap();
        let root = trie.root_hash();
        let proof = trie.get_proof(b"\xab\xcd").unwrap();
        assert!(verify_proof(root, b"\xab\xcd", &proof).is_some());

        for i in 0..proof.len() {
            for pos in 0..proof[i].len() {
                let mut bad = proof.clone();
                bad[i][pos] ^= 0x01;
                assert_eq!(
                    verify_proof(root, b"\xab\xcd", &bad),
                    None,
                    "corrupt element {i} byte {pos} still verified"
                );
            }
        }
    }

    #[test]
    fn proof_works_after_flush_via_store() {
        let mut trie = new_trie();
        trie.put(b"\xab\xcd", b"hi").unwrap();
        let root = trie.root_hash();
        trie.flush().unwrap();
        // Descend from a cold hash-only root so the proof path resolves
        // through the store.
        let mut cold = Trie::new(Some(root), false, trie.store().clone());
        let proof = cold.get_proof(b"\xab\xcd").unwrap();
        assert_eq!(verify_proof(root, b"\xab\xcd", &proof), Some(b"hi".to_vec()));
    }

    #[test]
    fn traverse_visits_all_and_can_halt() {
        let mut trie = new_trie();
        trie.put(b"\x01", b"a").unwrap();
        trie.put(b"\x02", b"b").unwrap();
        trie.put(b"\x03", b"c").unwrap();

        let mut visited = 0usize;
        trie.traverse(&mut |_, _| {
            visited += 1;
            false
        }, false)
            .unwrap();
        // One branch, three extensions, three leaves under it.
        assert!(visited >= 4);

        let mut seen = 0usize;
        trie.traverse(&mut |_, _| {
            seen += 1;
            seen == 2
        }, false)
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn traverse_ignores_missing_nodes_when_asked() {
        let mut trie = new_trie();
        trie.put(b"\x01", b"a").unwrap();
        trie.put(b"\x02", b"b").unwrap();
        let root = trie.root_hash();
        // Nothing was flushed, so a cold trie can resolve no node at all.
        let mut cold = Trie::new(Some(root), false, trie.store().clone());
        assert!(cold.traverse(&mut |_, _| false, false).is_err());
        cold.traverse(&mut |_, _| false, true).unwrap();
    }
}
