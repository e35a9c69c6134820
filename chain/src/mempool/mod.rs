//! Bounded, prioritized, conflict-aware pool of unconfirmed transactions.
//!
//! A single read-write lock guards the pool; every multi-step mutation
//! holds it start-to-finish so the map, the sorted list and the input
//! multiset never diverge.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use thiserror::Error;

use crate::metrics;
use crate::state::transaction::{Input, Transaction};
use crate::util::fixed8::Fixed8;
use crate::util::hash::{Hash160, Hash256};

/// Fee- and balance-policy collaborator consulted on admission.
pub trait FeePolicy {
    /// Classifies a network fee as low priority.
    fn is_low_priority(&self, net_fee: Fixed8) -> bool;

    /// Current spendable balance of the sender, snapshotted on first
    /// sighting and cached for the life of its pool entry.
    fn balance_of(&self, sender: &Hash160) -> Fixed8;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    /// The transaction reuses a pooled input or overdraws its sender.
    #[error("conflicts with the memory pool")]
    Conflict,
    #[error("already in the memory pool")]
    Duplicate,
    /// The pool is full and every pooled item outranks the candidate.
    #[error("out of memory")]
    OutOfMemory,
}

/// One pooled transaction plus admission metadata.
pub struct PoolItem {
    pub tx: Arc<Transaction>,
    pub timestamp: SystemTime,
    pub low_priority: bool,
}

impl PoolItem {
    fn new(tx: Arc<Transaction>, policy: &dyn FeePolicy) -> Self {
        let low_priority = policy.is_low_priority(tx.net_fee());
        PoolItem {
            tx,
            timestamp: SystemTime::now(),
            low_priority,
        }
    }

    /// The capacity-fight total order: normal beats low priority, then
    /// fee-per-byte, then absolute network fee, then the smaller hash wins.
    pub fn cmp_priority(&self, other: &PoolItem) -> Ordering {
        match (self.low_priority, other.low_priority) {
            (false, true) => return Ordering::Greater,
            (true, false) => return Ordering::Less,
            _ => {}
        }
        self.tx
            .fee_per_byte()
            .cmp(&other.tx.fee_per_byte())
            .then_with(|| self.tx.net_fee().cmp(&other.tx.net_fee()))
            .then_with(|| other.tx.hash().cmp(&self.tx.hash()))
    }
}

#[derive(Clone, Copy, Default)]
struct SenderFee {
    balance: Fixed8,
    fee_sum: Fixed8,
}

#[derive(Default)]
struct PoolState {
    verified: HashMap<Hash256, Arc<PoolItem>>,
    /// Same items as `verified`, descending priority; the last entry is
    /// the eviction candidate.
    sorted: Vec<Arc<PoolItem>>,
    /// Inputs of all pooled transactions as one ascending sequence.
    inputs: Vec<Input>,
    fees: HashMap<Hash160, SenderFee>,
}

impl PoolState {
    fn contains_input(&self, input: &Input) -> bool {
        self.inputs.binary_search(input).is_ok()
    }

    fn push_input(&mut self, input: Input) {
        let at = self.inputs.partition_point(|e| *e < input);
        self.inputs.insert(at, input);
    }

    fn drop_input(&mut self, input: &Input) {
        if let Ok(at) = self.inputs.binary_search(input) {
            self.inputs.remove(at);
        }
    }

    /// Balance check against the cached (or freshly fetched) snapshot.
    /// The snapshot is only stored when `update` is set, keeping the
    /// read-only `verify` path free of side effects.
    fn check_balance(&mut self, tx: &Transaction, policy: &dyn FeePolicy, update: bool) -> bool {
        let cached = self.fees.get(&tx.sender()).copied();
        let fee = match cached {
            Some(fee) => fee,
            None => {
                let fee = SenderFee {
                    balance: policy.balance_of(&tx.sender()),
                    fee_sum: Fixed8::ZERO,
                };
                if update {
                    self.fees.insert(tx.sender(), fee);
                }
                fee
            }
        };
        let Some(needed) = fee
            .fee_sum
            .checked_add(tx.sys_fee())
            .and_then(|s| s.checked_add(tx.net_fee()))
        else {
            // An overflowing fee sum can never be covered.
            return false;
        };
        fee.balance >= needed
    }

    fn check_conflicts(&mut self, tx: &Transaction, policy: &dyn FeePolicy, update: bool) -> bool {
        if tx.inputs().iter().any(|i| self.contains_input(i)) {
            return false;
        }
        self.check_balance(tx, policy, update)
    }

    fn add_sender_fee(&mut self, tx: &Transaction) {
        let fee = self.fees.entry(tx.sender()).or_default();
        fee.fee_sum = fee
            .fee_sum
            .saturating_add(tx.sys_fee())
            .saturating_add(tx.net_fee());
    }

    fn subtract_sender_fee(&mut self, tx: &Transaction) {
        if let Some(fee) = self.fees.get_mut(&tx.sender()) {
            fee.fee_sum = fee
                .fee_sum
                .saturating_sub(tx.sys_fee())
                .saturating_sub(tx.net_fee());
        }
    }

    /// Unlinks one item from the map, the inputs sequence and the sender
    /// accumulator. The sorted list is handled by the caller, which knows
    /// the index.
    fn unlink(&mut self, item: &PoolItem) {
        self.verified.remove(&item.tx.hash());
        for input in item.tx.inputs() {
            self.drop_input(input);
        }
        self.subtract_sender_fee(&item.tx);
    }
}

/// The memory pool.
pub struct Pool {
    state: RwLock<PoolState>,
    capacity: usize,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Pool {
            state: RwLock::new(PoolState::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Tries to admit a transaction, evicting the lowest-priority item when
    /// the pool is full and the candidate outranks it.
    pub fn add(&self, tx: Arc<Transaction>, policy: &dyn FeePolicy) -> Result<(), MempoolError> {
        let item = Arc::new(PoolItem::new(tx.clone(), policy));
        let mut state = self.write();

        if !state.check_conflicts(&tx, policy, true) {
            return Err(MempoolError::Conflict);
        }
        if state.verified.contains_key(&tx.hash()) {
            return Err(MempoolError::Duplicate);
        }

        // First index whose item the candidate strictly outranks; most
        // transactions share a priority so appending near the tail is the
        // common case.
        let at = state
            .sorted
            .partition_point(|existing| item.cmp_priority(existing) != Ordering::Greater);

        if state.sorted.len() == self.capacity {
            if at == state.sorted.len() {
                return Err(MempoolError::OutOfMemory);
            }
            if let Some(unlucky) = state.sorted.pop() {
                state.unlink(&unlucky);
                metrics::record_eviction();
            }
        }
        state.sorted.insert(at, item.clone());
        state.verified.insert(tx.hash(), item);
        state.add_sender_fee(&tx);
        for input in tx.inputs() {
            state.push_input(input.clone());
        }

        metrics::update_mempool_size(state.sorted.len());
        Ok(())
    }

    /// Removes the transaction if present; absent hashes are a no-op.
    pub fn remove(&self, hash: &Hash256) {
        let mut state = self.write();
        if let Some(item) = state.verified.remove(hash) {
            if let Some(at) = state
                .sorted
                .iter()
                .position(|e| e.tx.hash() == item.tx.hash())
            {
                state.sorted.remove(at);
            }
            for input in item.tx.inputs() {
                state.drop_input(input);
            }
            state.subtract_sender_fee(&item.tx);
        }
        metrics::update_mempool_size(state.sorted.len());
    }

    /// Keeps only items passing `predicate` and a fresh balance check,
    /// preserving the existing priority order. Called after a new block is
    /// accepted to purge confirmed and newly-unpayable transactions.
    pub fn remove_stale(
        &self,
        mut predicate: impl FnMut(&Transaction) -> bool,
        policy: &dyn FeePolicy,
    ) {
        let mut state = self.write();
        state.fees.clear();
        let old = std::mem::take(&mut state.sorted);
        let mut inputs = Vec::new();
        // Iterating in list order keeps the result sorted without a
        // re-sort; only the inputs sequence is rebuilt.
        for item in old {
            let keep = predicate(&item.tx)
                && state.check_balance(&item.tx, policy, true)
                && {
                    state.add_sender_fee(&item.tx);
                    true
                };
            if keep {
                inputs.extend(item.tx.inputs().iter().cloned());
                state.sorted.push(item);
            } else {
                state.verified.remove(&item.tx.hash());
            }
        }
        inputs.sort();
        state.inputs = inputs;
        metrics::update_mempool_size(state.sorted.len());
    }

    /// True iff `add` would pass the conflict and balance checks. Does not
    /// mutate; no balance snapshot is stored on this path.
    pub fn verify(&self, tx: &Transaction, policy: &dyn FeePolicy) -> bool {
        let mut state = self.write();
        state.check_conflicts(tx, policy, false)
    }

    pub fn count(&self) -> usize {
        self.read().sorted.len()
    }

    pub fn contains_key(&self, hash: &Hash256) -> bool {
        self.read().verified.contains_key(hash)
    }

    pub fn try_get_value(&self, hash: &Hash256) -> Option<Arc<Transaction>> {
        self.read().verified.get(hash).map(|item| item.tx.clone())
    }

    /// Snapshot of the pooled transactions in descending priority order.
    pub fn get_verified_transactions(&self) -> Vec<Arc<Transaction>> {
        self.read()
            .sorted
            .iter()
            .map(|item| item.tx.clone())
            .collect()
    }
}
