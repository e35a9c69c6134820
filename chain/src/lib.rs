//! Core state machinery for a full node.
//!
//! The crate is organised bottom-up: [`storage`] provides the backing
//! key/value stores and the write-through cache layer, [`dao`] the typed
//! data access built on top of them, [`mpt`] the Merkle-Patricia state trie
//! and [`mempool`] the prioritized unconfirmed-transaction pool. Primitive
//! value types live in [`util`] and [`state`].

pub mod config;
pub mod dao;
pub mod mempool;
pub mod metrics;
pub mod mpt;
pub mod state;
pub mod storage;
pub mod util;

pub use util::fixed8::Fixed8;
pub use util::hash::{Hash160, Hash256};
