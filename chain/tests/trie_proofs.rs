//! Trie round-trips, proof scenarios and root determinism.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use chain::mpt::{verify_proof, MptError, Trie};
use chain::storage::{MemCachedStore, MemoryStore, Store};
use chain::Hash256;

fn new_trie() -> Trie {
    let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let store = Arc::new(MemCachedStore::new(backend));
    Trie::new(None, false, store)
}

#[test]
fn proof_round_trip_for_single_entry() {
    let mut trie = new_trie();
    trie.put(&[0xab, 0xcd], b"hi").unwrap();
    let root = trie.root_hash();
    let proof = trie.get_proof(&[0xab, 0xcd]).unwrap();
    assert_eq!(
        verify_proof(root, &[0xab, 0xcd], &proof),
        Some(b"hi".to_vec())
    );
}

#[test]
fn corrupted_proof_element_fails_verification() {
    let mut trie = new_trie();
    trie.put(&[0xab, 0xcd], b"hi").unwrap();
    trie.put(&[0xab, 0x11], b"sibling").unwrap();
    trie.put(&[0x0f], b"other").unwrap();
    let root = trie.root_hash();
    let proof = trie.get_proof(&[0xab, 0xcd]).unwrap();
    assert!(proof.len() >= 2);

    for i in 0..proof.len() {
        for pos in 0..proof[i].len() {
            let mut corrupt = proof.clone();
            corrupt[i][pos] ^= 0x40;
            assert_eq!(
                verify_proof(root, &[0xab, 0xcd], &corrupt),
                None,
                "flipping byte {pos} of element {i} must invalidate the proof"
            );
        }
    }
}

#[test]
fn proof_against_wrong_root_fails() {
    let mut trie = new_trie();
    trie.put(&[0x01], b"x").unwrap();
    let proof = trie.get_proof(&[0x01]).unwrap();
    assert_eq!(verify_proof(Hash256::new([9u8; 32]), &[0x01], &proof), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn get_returns_last_put_and_delete_clears(
        entries in proptest::collection::btree_map(
            proptest::collection::vec(any::<u8>(), 1..6),
            proptest::collection::vec(any::<u8>(), 1..24),
            1..24,
        )
    ) {
        let mut trie = new_trie();
        for (k, v) in &entries {
            trie.put(k, v).unwrap();
        }
        for (k, v) in &entries {
            prop_assert_eq!(trie.get(k).unwrap(), v.clone());
        }
        for k in entries.keys() {
            trie.delete(k).unwrap();
            prop_assert!(matches!(trie.get(k), Err(MptError::NotFound)));
        }
        prop_assert_eq!(trie.root_hash(), Hash256::zero());
    }

    #[test]
    fn root_is_independent_of_insertion_order(
        entries in proptest::collection::btree_map(
            proptest::collection::vec(any::<u8>(), 1..5),
            proptest::collection::vec(any::<u8>(), 1..16),
            1..16,
        ),
        seed in any::<u64>(),
    ) {
        let ordered: Vec<(Vec<u8>, Vec<u8>)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut shuffled = ordered.clone();
        // Cheap deterministic shuffle.
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            shuffled.swap(i, (state as usize) % (i + 1));
        }

        let mut a = new_trie();
        for (k, v) in &ordered {
            a.put(k, v).unwrap();
        }
        let mut b = new_trie();
        for (k, v) in &shuffled {
            b.put(k, v).unwrap();
        }
        prop_assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn every_present_key_is_provable(
        entries in proptest::collection::btree_map(
            proptest::collection::vec(any::<u8>(), 1..4),
            proptest::collection::vec(any::<u8>(), 1..12),
            1..12,
        )
    ) {
        let mut trie = new_trie();
        for (k, v) in &entries {
            trie.put(k, v).unwrap();
        }
        let root = trie.root_hash();
        for (k, v) in &entries {
            let proof = trie.get_proof(k).unwrap();
            prop_assert_eq!(verify_proof(root, k, &proof), Some(v.clone()));
        }
    }
}

#[test]
fn deletions_converge_to_the_smaller_trie() {
    // Building {a,b} then deleting b must byte-match building {a} alone.
    let pairs: BTreeMap<Vec<u8>, Vec<u8>> = [
        (vec![0x12, 0x34], b"one".to_vec()),
        (vec![0x12, 0x35], b"two".to_vec()),
        (vec![0xfe], b"three".to_vec()),
    ]
    .into_iter()
    .collect();

    let mut full = new_trie();
    for (k, v) in &pairs {
        full.put(k, v).unwrap();
    }
    full.delete(&[0x12, 0x35]).unwrap();
    full.delete(&[0xfe]).unwrap();

    let mut small = new_trie();
    small.put(&[0x12, 0x34], b"one").unwrap();

    assert_eq!(full.root_hash(), small.root_hash());
}
