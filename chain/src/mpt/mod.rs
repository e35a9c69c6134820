//! Merkle-Patricia trie over the layered key/value store.
//!
//! Nodes are content-addressed by the double-SHA256 of their canonical
//! serialization; the all-zero hash is the empty trie. Hash nodes are a
//! laziness mechanism deferring store loads until a descent reaches them.

pub mod node;
pub mod proof;
pub mod trie;

pub use node::{BranchNode, ExtensionNode, HashNode, LeafNode, Node};
pub use proof::verify_proof;
pub use trie::{MptError, Trie};
