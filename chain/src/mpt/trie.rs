//! The trie proper: radix descent, canonical restructuring and the
//! content-addressed node store underneath it.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use thiserror::Error;

use crate::storage::{MemCachedStore, Store, StoreError};
use crate::util::codec::CodecError;
use crate::util::hash::Hash256;

use super::node::{
    lcp, split_path, to_nibbles, BranchNode, ExtensionNode, HashNode, Node, LAST_CHILD,
    MAX_PATH_LENGTH, MAX_VALUE_LENGTH,
};

/// Store prefix for trie nodes, distinct from every DAO prefix.
const NODE_PREFIX: u8 = 0x03;

pub(crate) fn make_storage_key(hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Hash256::SIZE);
    key.push(NODE_PREFIX);
    key.extend_from_slice(hash.as_bytes());
    key
}

#[derive(Debug, Error)]
pub enum MptError {
    /// The key (or a proof path) is absent. Distinct from storage failures.
    #[error("item not found")]
    NotFound,
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt node: {0}")]
    Corrupt(String),
    #[error("key exceeds the maximum path length")]
    KeyTooLarge,
    #[error("value exceeds the maximum length")]
    ValueTooLarge,
}

impl From<CodecError> for MptError {
    fn from(err: CodecError) -> Self {
        MptError::Corrupt(err.to_string())
    }
}

impl MptError {
    /// True when a referenced node is missing from the backing store.
    pub fn is_missing_node(&self) -> bool {
        matches!(self, MptError::Store(StoreError::NotFound))
    }
}

#[derive(Default)]
struct RefChange {
    bytes: Option<Vec<u8>>,
    delta: i32,
}

/// Merkle-Patricia trie over a layered store.
///
/// Not safe for concurrent callers; even reads resolve hash nodes in place.
/// Higher layers serialize access.
pub struct Trie {
    root: Node,
    store: Arc<MemCachedStore>,
    ref_count_enabled: bool,
    ref_changes: HashMap<Hash256, RefChange>,
}

impl Trie {
    /// `root` of `None` (or all-zero) starts an empty trie. With
    /// `enable_ref_count`, stored nodes carry a 32-bit reference count and
    /// are deleted when it drops to zero; otherwise nodes are never deleted.
    pub fn new(root: Option<Hash256>, enable_ref_count: bool, store: Arc<MemCachedStore>) -> Self {
        let root = match root {
            Some(h) if !h.is_zero() => Node::new_hash(h),
            _ => Node::empty(),
        };
        Trie {
            root,
            store,
            ref_count_enabled: enable_ref_count,
            ref_changes: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemCachedStore> {
        &self.store
    }

    pub fn root_hash(&self) -> Hash256 {
        self.root.hash()
    }

    pub(crate) fn take_root(&mut self) -> Node {
        mem::replace(&mut self.root, Node::empty())
    }

    pub(crate) fn set_root(&mut self, root: Node) {
        self.root = root;
    }

    // -- reference bookkeeping.

    fn add_ref(&mut self, node: &Node) {
        if node.is_empty() || matches!(node, Node::Hash(_)) {
            return;
        }
        let bytes = node.to_bytes();
        let entry = self
            .ref_changes
            .entry(node.hash())
            .or_insert_with(RefChange::default);
        entry.delta += 1;
        entry.bytes = Some(bytes);
    }

    fn remove_ref(&mut self, hash: Hash256) {
        if hash.is_zero() {
            return;
        }
        self.ref_changes
            .entry(hash)
            .or_insert_with(RefChange::default)
            .delta -= 1;
    }

    pub(crate) fn get_from_store(&self, hash: &Hash256) -> Result<Node, MptError> {
        let data = self.store.get(&make_storage_key(hash))?;
        let data = if self.ref_count_enabled {
            if data.len() < 5 {
                return Err(MptError::Corrupt("refcounted node too short".into()));
            }
            &data[..data.len() - 4]
        } else {
            &data[..]
        };
        Ok(Node::from_bytes(data)?)
    }

    /// Writes accumulated node changes into the store. With reference
    /// counting the stored value is `bytes || u32-LE(count)` and entries
    /// reaching zero are deleted; without it nodes are only ever added.
    pub fn flush(&mut self) -> Result<(), MptError> {
        let changes: Vec<(Hash256, RefChange)> = self.ref_changes.drain().collect();
        for (hash, change) in changes {
            if change.delta == 0 {
                continue;
            }
            let key = make_storage_key(&hash);
            if !self.ref_count_enabled {
                if change.delta > 0 {
                    if let Some(bytes) = change.bytes {
                        self.store.put(&key, &bytes)?;
                    }
                }
                continue;
            }
            let (stored_bytes, stored_count) = match self.store.get(&key) {
                Ok(mut data) => {
                    if data.len() < 5 {
                        return Err(MptError::Corrupt("refcounted node too short".into()));
                    }
                    let at = data.len() - 4;
                    let count =
                        i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
                    data.truncate(at);
                    (Some(data), count)
                }
                Err(StoreError::NotFound) => (None, 0),
                Err(e) => return Err(e.into()),
            };
            let new_count = stored_count + change.delta;
            if new_count <= 0 {
                if stored_bytes.is_some() {
                    self.store.delete(&key)?;
                }
                continue;
            }
            let bytes = change
                .bytes
                .or(stored_bytes)
                .ok_or_else(|| MptError::Corrupt("reference to an unknown node".into()))?;
            let mut value = bytes;
            value.extend_from_slice(&new_count.to_le_bytes());
            self.store.put(&key, &value)?;
        }
        Ok(())
    }

    // -- lookup.

    /// Standard radix descent. Resolved hash nodes are expanded in place.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, MptError> {
        let path = to_nibbles(key);
        let root = self.take_root();
        let (root, result) = self.get_with_path(root, &path);
        self.root = root;
        result
    }

    pub(crate) fn get_with_path(
        &mut self,
        curr: Node,
        path: &[u8],
    ) -> (Node, Result<Vec<u8>, MptError>) {
        match curr {
            Node::Leaf(ref l) => {
                if path.is_empty() {
                    let value = l.value.clone();
                    (curr, Ok(value))
                } else {
                    (curr, Err(MptError::NotFound))
                }
            }
            Node::Branch(mut b) => {
                let (i, rest) = split_path(path);
                let child = mem::replace(&mut b.children[i], Node::empty());
                let (child, result) = self.get_with_path(child, rest);
                b.children[i] = child;
                (Node::Branch(b), result)
            }
            Node::Extension(mut e) => {
                if path.starts_with(&e.key) {
                    let next = mem::replace(&mut e.next, Node::empty());
                    let (next, result) = self.get_with_path(next, &path[e.key.len()..]);
                    e.next = next;
                    (Node::Extension(e), result)
                } else {
                    (Node::Extension(e), Err(MptError::NotFound))
                }
            }
            Node::Hash(h) => match h.hash {
                None => (curr, Err(MptError::NotFound)),
                Some(hash) => match self.get_from_store(&hash) {
                    Ok(resolved) => self.get_with_path(resolved, path),
                    Err(e) => (curr, Err(e)),
                },
            },
        }
    }

    // -- insertion.

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), MptError> {
        let path = to_nibbles(key);
        if path.len() > MAX_PATH_LENGTH {
            return Err(MptError::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(MptError::ValueTooLarge);
        }
        if value.is_empty() {
            return match self.delete(key) {
                Err(MptError::NotFound) => Ok(()),
                other => other,
            };
        }
        let leaf = Node::new_leaf(value.to_vec());
        let root = self.take_root();
        match self.put_into(root, &path, leaf) {
            Ok(root) => {
                self.root = root;
                Ok(())
            }
            Err((root, e)) => {
                self.root = root;
                Err(e)
            }
        }
    }

    fn new_sub_trie(&mut self, path: &[u8], val: Node, add_leaf_ref: bool) -> Node {
        if add_leaf_ref {
            self.add_ref(&val);
        }
        if path.is_empty() {
            val
        } else {
            let ext = Node::new_extension(path.to_vec(), val);
            self.add_ref(&ext);
            ext
        }
    }

    fn put_into(&mut self, curr: Node, path: &[u8], val: Node) -> Result<Node, (Node, MptError)> {
        match curr {
            Node::Leaf(l) => Ok(self.put_into_leaf(l, path, val)),
            Node::Branch(b) => self.put_into_branch(b, path, val),
            Node::Extension(e) => self.put_into_extension(e, path, val),
            Node::Hash(h) => match h.hash {
                None => Ok(self.new_sub_trie(path, val, true)),
                Some(hash) => match self.get_from_store(&hash) {
                    Ok(resolved) => self.put_into(resolved, path, val),
                    Err(e) => Err((Node::Hash(h), e)),
                },
            },
        }
    }

    fn put_into_leaf(&mut self, curr: super::node::LeafNode, path: &[u8], val: Node) -> Node {
        if path.is_empty() {
            self.remove_ref(Node::Leaf(curr).hash());
            self.add_ref(&val);
            return val;
        }
        // The old leaf keeps its reference, it just moves into the value
        // slot of a fresh branch.
        let mut b = BranchNode {
            children: std::array::from_fn(|_| Node::empty()),
        };
        b.children[path[0] as usize] = self.new_sub_trie(&path[1..], val, true);
        b.children[LAST_CHILD] = Node::Leaf(curr);
        let node = Node::Branch(Box::new(b));
        self.add_ref(&node);
        node
    }

    fn put_into_branch(
        &mut self,
        b: Box<BranchNode>,
        path: &[u8],
        val: Node,
    ) -> Result<Node, (Node, MptError)> {
        let curr = Node::Branch(b);
        let old_hash = curr.hash();
        let Node::Branch(mut b) = curr else {
            unreachable!()
        };
        self.remove_ref(old_hash);
        let (i, rest) = split_path(path);
        let child = mem::replace(&mut b.children[i], Node::empty());
        match self.put_into(child, rest, val) {
            Ok(r) => {
                b.children[i] = r;
                let node = Node::Branch(b);
                self.add_ref(&node);
                Ok(node)
            }
            Err((child, e)) => {
                b.children[i] = child;
                let node = Node::Branch(b);
                self.add_ref(&node);
                Err((node, e))
            }
        }
    }

    fn put_into_extension(
        &mut self,
        e: Box<ExtensionNode>,
        path: &[u8],
        val: Node,
    ) -> Result<Node, (Node, MptError)> {
        let curr = Node::Extension(e);
        let old_hash = curr.hash();
        let Node::Extension(mut e) = curr else {
            unreachable!()
        };
        self.remove_ref(old_hash);
        if path.starts_with(&e.key) {
            let next = mem::replace(&mut e.next, Node::empty());
            return match self.put_into(next, &path[e.key.len()..], val) {
                Ok(r) => {
                    e.next = r;
                    let node = Node::Extension(e);
                    self.add_ref(&node);
                    Ok(node)
                }
                Err((next, err)) => {
                    e.next = next;
                    let node = Node::Extension(e);
                    self.add_ref(&node);
                    Err((node, err))
                }
            };
        }

        // Paths diverge inside the extension key: split it around a branch.
        let pref = lcp(&e.key, path).to_vec();
        let key_tail = e.key[pref.len()..].to_vec();
        let path_tail = &path[pref.len()..];
        let next = e.next;

        let existing = if key_tail.len() == 1 {
            next
        } else {
            let sub = Node::new_extension(key_tail[1..].to_vec(), next);
            self.add_ref(&sub);
            sub
        };
        let mut b = BranchNode {
            children: std::array::from_fn(|_| Node::empty()),
        };
        b.children[key_tail[0] as usize] = existing;
        let (i, path_rest) = split_path(path_tail);
        b.children[i] = self.new_sub_trie(path_rest, val, true);
        let branch = Node::Branch(Box::new(b));
        self.add_ref(&branch);
        if pref.is_empty() {
            Ok(branch)
        } else {
            let ext = Node::new_extension(pref, branch);
            self.add_ref(&ext);
            Ok(ext)
        }
    }

    // -- deletion.

    pub fn delete(&mut self, key: &[u8]) -> Result<(), MptError> {
        let path = to_nibbles(key);
        let root = self.take_root();
        match self.delete_from(root, &path) {
            Ok(root) => {
                self.root = root;
                Ok(())
            }
            Err((root, e)) => {
                self.root = root;
                Err(e)
            }
        }
    }

    fn delete_from(&mut self, curr: Node, path: &[u8]) -> Result<Node, (Node, MptError)> {
        match curr {
            Node::Leaf(_) => {
                if path.is_empty() {
                    self.remove_ref(curr.hash());
                    Ok(Node::empty())
                } else {
                    Err((curr, MptError::NotFound))
                }
            }
            Node::Branch(b) => self.delete_from_branch(b, path),
            Node::Extension(e) => self.delete_from_extension(e, path),
            Node::Hash(h) => match h.hash {
                None => Err((Node::Hash(h), MptError::NotFound)),
                Some(hash) => match self.get_from_store(&hash) {
                    Ok(resolved) => self.delete_from(resolved, path),
                    Err(e) => Err((Node::Hash(h), e)),
                },
            },
        }
    }

    fn delete_from_extension(
        &mut self,
        mut e: Box<ExtensionNode>,
        path: &[u8],
    ) -> Result<Node, (Node, MptError)> {
        if !path.starts_with(&e.key) {
            return Err((Node::Extension(e), MptError::NotFound));
        }
        let curr = Node::Extension(e);
        let old_hash = curr.hash();
        let Node::Extension(mut e) = curr else {
            unreachable!()
        };
        let next = mem::replace(&mut e.next, Node::empty());
        match self.delete_from(next, &path[e.key.len()..]) {
            Err((next, err)) => {
                e.next = next;
                Err((Node::Extension(e), err))
            }
            Ok(r) => {
                self.remove_ref(old_hash);
                match r {
                    Node::Extension(nxt) => {
                        // Two chained extensions merge into one.
                        let merged = Node::Extension(nxt);
                        self.remove_ref(merged.hash());
                        let Node::Extension(nxt) = merged else {
                            unreachable!()
                        };
                        e.key.extend_from_slice(&nxt.key);
                        e.next = nxt.next;
                    }
                    Node::Hash(HashNode { hash: None }) => {
                        return Ok(Node::empty());
                    }
                    other => e.next = other,
                }
                let node = Node::Extension(e);
                self.add_ref(&node);
                Ok(node)
            }
        }
    }

    fn delete_from_branch(
        &mut self,
        b: Box<BranchNode>,
        path: &[u8],
    ) -> Result<Node, (Node, MptError)> {
        let curr = Node::Branch(b);
        let old_hash = curr.hash();
        let Node::Branch(mut b) = curr else {
            unreachable!()
        };
        let (i, rest) = split_path(path);
        let child = mem::replace(&mut b.children[i], Node::empty());
        match self.delete_from(child, rest) {
            Err((child, e)) => {
                b.children[i] = child;
                Err((Node::Branch(b), e))
            }
            Ok(r) => {
                self.remove_ref(old_hash);
                b.children[i] = r;

                let mut count = 0usize;
                let mut index = 0usize;
                for (j, c) in b.children.iter().enumerate() {
                    if !c.is_empty() {
                        index = j;
                        count += 1;
                    }
                }
                // A branch holds at least two children, so one always
                // survives the deletion.
                if count > 1 {
                    let node = Node::Branch(b);
                    self.add_ref(&node);
                    return Ok(node);
                }

                let c = mem::replace(&mut b.children[index], Node::empty());
                if index == LAST_CHILD {
                    // Only the value child is left; it replaces the branch.
                    return Ok(c);
                }
                let c = if let Node::Hash(HashNode { hash: Some(h) }) = &c {
                    match self.get_from_store(h) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            b.children[index] = c;
                            let node = Node::Branch(b);
                            self.add_ref(&node);
                            return Err((node, e));
                        }
                    }
                } else {
                    c
                };
                match c {
                    Node::Extension(e2) => {
                        let old_ext = Node::Extension(e2);
                        self.remove_ref(old_ext.hash());
                        let Node::Extension(mut e2) = old_ext else {
                            unreachable!()
                        };
                        let mut key = Vec::with_capacity(1 + e2.key.len());
                        key.push(index as u8);
                        key.extend_from_slice(&e2.key);
                        e2.key = key;
                        let node = Node::Extension(e2);
                        self.add_ref(&node);
                        Ok(node)
                    }
                    other => {
                        let node = Node::new_extension(vec![index as u8], other);
                        self.add_ref(&node);
                        Ok(node)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn new_trie(ref_count: bool) -> Trie {
        let store = Arc::new(MemCachedStore::new(Arc::new(MemoryStore::new())));
        Trie::new(None, ref_count, store)
    }

    #[test]
    fn empty_root_is_zero() {
        let trie = new_trie(false);
        assert_eq!(trie.root_hash(), Hash256::zero());
    }

    #[test]
    fn get_put_delete_round_trip() {
        let mut trie = new_trie(false);
        trie.put(b"\xab\xcd", b"hi").unwrap();
        trie.put(b"\xab\xce", b"there").unwrap();
        assert_eq!(trie.get(b"\xab\xcd").unwrap(), b"hi");
        assert_eq!(trie.get(b"\xab\xce").unwrap(), b"there");
        trie.delete(b"\xab\xcd").unwrap();
        assert!(matches!(trie.get(b"\xab\xcd"), Err(MptError::NotFound)));
        assert_eq!(trie.get(b"\xab\xce").unwrap(), b"there");
    }

    #[test]
    fn prefix_key_lands_in_value_slot() {
        let mut trie = new_trie(false);
        trie.put(b"\xab", b"short").unwrap();
        trie.put(b"\xab\xcd", b"long").unwrap();
        assert_eq!(trie.get(b"\xab").unwrap(), b"short");
        assert_eq!(trie.get(b"\xab\xcd").unwrap(), b"long");
        trie.delete(b"\xab\xcd").unwrap();
        assert_eq!(trie.get(b"\xab").unwrap(), b"short");
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let mut a = new_trie(false);
        a.put(b"\x01\x02", b"v1").unwrap();
        a.put(b"\x01\x03", b"v2").unwrap();
        a.put(b"\xff", b"v3").unwrap();

        let mut b = new_trie(false);
        b.put(b"\xff", b"v3").unwrap();
        b.put(b"\x01\x03", b"v2").unwrap();
        b.put(b"\x01\x02", b"v1").unwrap();

        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn overwrite_changes_then_restores_root() {
        let mut trie = new_trie(false);
        trie.put(b"k", b"one").unwrap();
        let r1 = trie.root_hash();
        trie.put(b"k", b"two").unwrap();
        assert_ne!(trie.root_hash(), r1);
        trie.put(b"k", b"one").unwrap();
        assert_eq!(trie.root_hash(), r1);
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let mut trie = new_trie(false);
        trie.put(b"\x10", b"x").unwrap();
        assert!(matches!(trie.delete(b"\x20"), Err(MptError::NotFound)));
        assert_eq!(trie.get(b"\x10").unwrap(), b"x");
    }

    #[test]
    fn flush_then_reload_from_root() {
        let mut trie = new_trie(false);
        trie.put(b"\xab\xcd", b"hi").unwrap();
        trie.put(b"\x01", b"lo").unwrap();
        let root = trie.root_hash();
        trie.flush().unwrap();

        let mut reloaded = Trie::new(Some(root), false, trie.store().clone());
        assert_eq!(reloaded.get(b"\xab\xcd").unwrap(), b"hi");
        assert_eq!(reloaded.get(b"\x01").unwrap(), b"lo");
        assert_eq!(reloaded.root_hash(), root);
    }

    #[test]
    fn refcounted_nodes_are_deleted_at_zero() {
        let mut trie = new_trie(true);
        trie.put(b"\xab", b"v").unwrap();
        let root = trie.root_hash();
        trie.flush().unwrap();
        assert!(trie.store().get(&make_storage_key(&root)).is_ok());

        trie.delete(b"\xab").unwrap();
        trie.flush().unwrap();
        assert!(trie
            .store()
            .get(&make_storage_key(&root))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn shared_nodes_survive_one_deletion() {
        // Two key sets producing an identical subtree: the shared leaf must
        // survive while it is still referenced.
        let mut trie = new_trie(true);
        trie.put(b"\x11", b"same").unwrap();
        trie.put(b"\x22", b"same").unwrap();
        trie.flush().unwrap();
        let leaf_hash = Node::new_leaf(b"same".to_vec()).hash();
        let key = make_storage_key(&leaf_hash);
        let stored = trie.store().get(&key).unwrap();
        let count = i32::from_le_bytes(stored[stored.len() - 4..].try_into().unwrap());
        assert_eq!(count, 2);

        trie.delete(b"\x11").unwrap();
        trie.flush().unwrap();
        assert!(trie.store().get(&key).is_ok());
        trie.delete(b"\x22").unwrap();
        trie.flush().unwrap();
        assert!(trie.store().get(&key).unwrap_err().is_not_found());
    }

    #[test]
    fn missing_node_is_distinct_from_missing_key() {
        let store = Arc::new(MemCachedStore::new(Arc::new(MemoryStore::new())));
        let mut trie = Trie::new(Some(Hash256::new([7u8; 32])), false, store);
        let err = trie.get(b"\x01").unwrap_err();
        assert!(err.is_missing_node());
    }
}
