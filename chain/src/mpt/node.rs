//! Trie node variants and their canonical serialization.
//!
//! The serialized forms are wire-visible (they appear in proofs), so the
//! encoding must stay byte-exact: a type byte followed by var-length
//! fields, with children embedded as hash references.

use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::hash::{hash256, Hash256};

pub const TYPE_BRANCH: u8 = 0x00;
pub const TYPE_EXTENSION: u8 = 0x01;
pub const TYPE_HASH: u8 = 0x02;
pub const TYPE_LEAF: u8 = 0x03;

/// Children per branch: one per nibble plus the value slot.
pub const CHILD_COUNT: usize = 17;
/// Index of the value child, reached when the path is exhausted.
pub const LAST_CHILD: usize = 16;

/// Nibble paths are bounded by twice the maximum key length.
pub const MAX_PATH_LENGTH: usize = (64 + 4) * 2;
pub const MAX_VALUE_LENGTH: usize = 65535;

/// Unresolved reference to a stored node; `None` is the empty node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashNode {
    pub hash: Option<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchNode {
    pub children: [Node; CHILD_COUNT],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionNode {
    /// Compressed nibble path, one nibble per byte.
    pub key: Vec<u8>,
    pub next: Node,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafNode {
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Branch(Box<BranchNode>),
    Extension(Box<ExtensionNode>),
    Leaf(LeafNode),
    Hash(HashNode),
}

impl Node {
    pub fn empty() -> Node {
        Node::Hash(HashNode { hash: None })
    }

    pub fn new_branch() -> Node {
        Node::Branch(Box::new(BranchNode {
            children: std::array::from_fn(|_| Node::empty()),
        }))
    }

    pub fn new_extension(key: Vec<u8>, next: Node) -> Node {
        Node::Extension(Box::new(ExtensionNode { key, next }))
    }

    pub fn new_leaf(value: Vec<u8>) -> Node {
        Node::Leaf(LeafNode { value })
    }

    pub fn new_hash(hash: Hash256) -> Node {
        Node::Hash(HashNode { hash: Some(hash) })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Hash(HashNode { hash: None }))
    }

    /// Double-SHA256 of the canonical serialization; zero for the empty
    /// node, the stored hash for an unresolved reference.
    pub fn hash(&self) -> Hash256 {
        match self {
            Node::Hash(HashNode { hash: Some(h) }) => *h,
            Node::Hash(HashNode { hash: None }) => Hash256::zero(),
            _ => hash256(&self.to_bytes()),
        }
    }

    /// Canonical serialization. Resolved children are referenced by hash,
    /// so the encoding of a node is independent of how much of its subtree
    /// is currently in memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    fn encode(&self, w: &mut Writer) {
        match self {
            Node::Branch(b) => {
                w.write_u8(TYPE_BRANCH);
                for child in &b.children {
                    encode_as_child(child, w);
                }
            }
            Node::Extension(e) => {
                w.write_u8(TYPE_EXTENSION);
                w.write_var_bytes(&e.key);
                encode_as_child(&e.next, w);
            }
            Node::Leaf(l) => {
                w.write_u8(TYPE_LEAF);
                w.write_var_bytes(&l.value);
            }
            Node::Hash(h) => {
                w.write_u8(TYPE_HASH);
                match h.hash {
                    Some(hash) => w.write_var_bytes(hash.as_bytes()),
                    None => w.write_var_bytes(&[]),
                }
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Node, CodecError> {
        let mut r = Reader::new(data);
        let node = Self::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok(node)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Node, CodecError> {
        match r.read_u8()? {
            TYPE_BRANCH => {
                let mut children = Vec::with_capacity(CHILD_COUNT);
                for _ in 0..CHILD_COUNT {
                    children.push(decode_child(r)?);
                }
                let children: [Node; CHILD_COUNT] = children
                    .try_into()
                    .map_err(|_| CodecError::InvalidValue("branch arity".into()))?;
                Ok(Node::Branch(Box::new(BranchNode { children })))
            }
            TYPE_EXTENSION => {
                let key = r.read_var_bytes_max(MAX_PATH_LENGTH as u64)?;
                if key.is_empty() {
                    return Err(CodecError::InvalidValue("empty extension key".into()));
                }
                let next = decode_child(r)?;
                Ok(Node::new_extension(key, next))
            }
            TYPE_LEAF => {
                let value = r.read_var_bytes_max(MAX_VALUE_LENGTH as u64)?;
                Ok(Node::new_leaf(value))
            }
            TYPE_HASH => decode_hash_body(r),
            t => Err(CodecError::InvalidValue(format!(
                "unknown node type {t:#04x}"
            ))),
        }
    }
}

fn encode_as_child(node: &Node, w: &mut Writer) {
    w.write_u8(TYPE_HASH);
    if node.is_empty() {
        w.write_var_bytes(&[]);
    } else {
        w.write_var_bytes(node.hash().as_bytes());
    }
}

fn decode_child(r: &mut Reader<'_>) -> Result<Node, CodecError> {
    match r.read_u8()? {
        TYPE_HASH => decode_hash_body(r),
        t => Err(CodecError::InvalidValue(format!(
            "child must be a hash reference, got type {t:#04x}"
        ))),
    }
}

fn decode_hash_body(r: &mut Reader<'_>) -> Result<Node, CodecError> {
    let bytes = r.read_var_bytes_max(Hash256::SIZE as u64)?;
    if bytes.is_empty() {
        return Ok(Node::empty());
    }
    Ok(Node::new_hash(Hash256::from_slice(&bytes)?))
}

/// Expands a byte key into its nibble path, high nibble first.
pub fn to_nibbles(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() * 2);
    for b in path {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
    out
}

/// Longest common prefix of two nibble paths.
pub fn lcp<'a>(a: &'a [u8], b: &[u8]) -> &'a [u8] {
    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    &a[..i]
}

/// Splits the first nibble off the path; an exhausted path selects the
/// value child.
pub fn split_path(path: &[u8]) -> (usize, &[u8]) {
    if path.is_empty() {
        (LAST_CHILD, path)
    } else {
        (path[0] as usize, &path[1..])
    }
}
