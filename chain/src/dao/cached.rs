//! Object-granularity cache above the simple DAO.
//!
//! Accounts, contracts, token balances and transfer logs are the objects a
//! block application touches over and over; caching them decoded avoids
//! re-parsing the same records for every transaction in a block.

use std::collections::HashMap;
use std::sync::Arc;

use slog::Logger;

use crate::state::account::{Account, Contract};
use crate::state::tokens::{Nep17Transfer, TokenBalances, TransferLog, NEP17_TRANSFER_BATCH_SIZE};
use crate::storage::{MemCachedStore, Store, StoreResult};
use crate::util::hash::Hash160;

use super::{DaoError, KeyPrefix, Simple};

pub struct Cached {
    dao: Simple,
    logger: Logger,
    accounts: HashMap<Hash160, Account>,
    contracts: HashMap<Hash160, Option<Contract>>,
    balances: HashMap<Hash160, TokenBalances>,
    transfers: HashMap<Hash160, HashMap<u32, TransferLog>>,
    /// Set by a balance migration: the cache reflects pre-migration state
    /// and must not be flushed or reused afterwards.
    balances_stale: bool,
}

impl Cached {
    /// Wraps a fresh transactional layer around `dao`.
    pub fn new(dao: &Simple, logger: Logger) -> Self {
        Cached {
            dao: dao.get_wrapped(),
            logger,
            accounts: HashMap::new(),
            contracts: HashMap::new(),
            balances: HashMap::new(),
            transfers: HashMap::new(),
            balances_stale: false,
        }
    }

    pub fn dao(&self) -> &Simple {
        &self.dao
    }

    pub fn get_account(&mut self, hash: &Hash160) -> Result<Account, DaoError> {
        if let Some(acc) = self.accounts.get(hash) {
            return Ok(acc.clone());
        }
        self.dao.get_account(hash)
    }

    pub fn get_account_or_new(&mut self, hash: &Hash160) -> Result<Account, DaoError> {
        match self.get_account(hash) {
            Ok(acc) => Ok(acc),
            Err(e) if e.is_not_found() => Ok(Account::new(*hash)),
            Err(e) => Err(e),
        }
    }

    pub fn put_account(&mut self, account: Account) {
        self.accounts.insert(account.script_hash, account);
    }

    pub fn get_contract(&mut self, hash: &Hash160) -> Result<Contract, DaoError> {
        if let Some(entry) = self.contracts.get(hash) {
            return entry
                .clone()
                .ok_or(DaoError::Store(crate::storage::StoreError::NotFound));
        }
        let contract = self.dao.get_contract(hash)?;
        self.contracts.insert(*hash, Some(contract.clone()));
        Ok(contract)
    }

    pub fn put_contract(&mut self, contract: Contract) -> Result<(), DaoError> {
        self.contracts.insert(contract.hash, Some(contract.clone()));
        self.dao.put_contract(&contract)
    }

    pub fn delete_contract(&mut self, hash: &Hash160) -> Result<(), DaoError> {
        self.contracts.insert(*hash, None);
        self.dao.delete_contract(hash)
    }

    pub fn get_token_balances(&mut self, acc: &Hash160) -> Result<TokenBalances, DaoError> {
        if let Some(bs) = self.balances.get(acc) {
            return Ok(bs.clone());
        }
        self.dao.get_token_balances(acc)
    }

    pub fn put_token_balances(&mut self, acc: Hash160, bs: TokenBalances) {
        self.balances.insert(acc, bs);
    }

    pub fn get_transfer_log(&mut self, acc: &Hash160, index: u32) -> Result<TransferLog, DaoError> {
        if let Some(log) = self.transfers.get(acc).and_then(|ts| ts.get(&index)) {
            return Ok(log.clone());
        }
        self.dao.get_transfer_log(acc, index)
    }

    pub fn put_transfer_log(&mut self, acc: Hash160, index: u32, log: TransferLog) {
        self.transfers.entry(acc).or_default().insert(index, log);
    }

    /// Appends a transfer through the cache; true when the batch overflowed.
    pub fn append_nep17_transfer(
        &mut self,
        acc: Hash160,
        index: u32,
        transfer: &Nep17Transfer,
    ) -> Result<bool, DaoError> {
        let mut log = self.get_transfer_log(&acc, index)?;
        log.append(transfer);
        let full = log.size() >= NEP17_TRANSFER_BATCH_SIZE;
        self.put_transfer_log(acc, index, log);
        Ok(full)
    }

    /// Renames the asset `from` to `to` in every stored balance record.
    ///
    /// Cached balances are flushed first, then all records are rewritten by
    /// streaming the backing store through a scratch layer (the store being
    /// iterated must not be mutated mid-seek). The balance cache reflects
    /// pre-migration state afterwards and is dropped on the next persist.
    pub fn migrate_balances(&mut self, from: &Hash160, to: &Hash160) -> Result<(), DaoError> {
        for (acc, bs) in &self.balances {
            self.dao.put_token_balances(acc, bs)?;
        }
        self.balances_stale = true;

        let store = self.dao.store.clone();
        let parent: Arc<dyn Store> = store.clone();
        let scratch = MemCachedStore::new(parent);
        let mut migrated = 0usize;
        let mut rewrite_err: Option<DaoError> = None;
        store.seek(&KeyPrefix::Nep17TransferInfo.key(), &mut |k, v| {
            if rewrite_err.is_some() {
                return;
            }
            let mut bs = match TokenBalances::from_bytes(v) {
                Ok(bs) => bs,
                Err(e) => {
                    rewrite_err = Some(e.into());
                    return;
                }
            };
            let Some(tracker) = bs.trackers.remove(from) else {
                return;
            };
            bs.trackers.insert(*to, tracker);
            match scratch.put(k, &bs.to_bytes()) {
                Ok(()) => migrated += 1,
                Err(e) => rewrite_err = Some(e.into()),
            }
        })?;
        if let Some(e) = rewrite_err {
            return Err(e);
        }
        scratch.persist()?;
        slog::info!(self.logger, "migrated token balances";
            "from" => %from, "to" => %to, "accounts" => migrated);
        Ok(())
    }

    /// Serializes the cached objects into the underlying DAO, then flushes
    /// its layer. Returns the number of pairs written by the flush.
    pub fn persist(&mut self) -> StoreResult<usize> {
        for account in self.accounts.values() {
            self.dao.put_account(account).map_err(flatten_dao_err)?;
        }
        if self.balances_stale {
            self.balances.clear();
            self.balances_stale = false;
        } else {
            for (acc, bs) in &self.balances {
                self.dao
                    .put_token_balances(acc, bs)
                    .map_err(flatten_dao_err)?;
            }
        }
        for (acc, logs) in &self.transfers {
            for (index, log) in logs {
                self.dao
                    .put_transfer_log(acc, *index, log)
                    .map_err(flatten_dao_err)?;
            }
        }
        let flushed = self.dao.persist()?;
        slog::debug!(self.logger, "persisted object caches"; "pairs" => flushed);
        Ok(flushed)
    }
}

fn flatten_dao_err(err: DaoError) -> crate::storage::StoreError {
    match err {
        DaoError::Store(e) => e,
        other => crate::storage::StoreError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::Version;
    use crate::storage::MemoryStore;
    use crate::util::fixed8::Fixed8;

    fn new_simple() -> Simple {
        Simple::new(Arc::new(MemoryStore::new()), Version::default())
    }

    fn quiet_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn account_writes_stay_cached_until_persist() {
        let dao = new_simple();
        let mut cached = Cached::new(&dao, quiet_logger());
        let acc = Account::new(Hash160::new([1u8; 20]));
        cached.put_account(acc.clone());
        // Not visible below before persist.
        assert!(dao.get_account(&acc.script_hash).is_err());
        cached.persist().unwrap();
        dao.persist().unwrap();
        assert_eq!(dao.get_account(&acc.script_hash).unwrap(), acc);
    }

    #[test]
    fn contract_cache_remembers_deletions() {
        let dao = new_simple();
        let contract = Contract {
            hash: Hash160::new([2u8; 20]),
            script: vec![1],
            name: "c".into(),
        };
        dao.put_contract(&contract).unwrap();
        let mut cached = Cached::new(&dao, quiet_logger());
        assert_eq!(cached.get_contract(&contract.hash).unwrap(), contract);
        cached.delete_contract(&contract.hash).unwrap();
        assert!(cached.get_contract(&contract.hash).is_err());
    }

    #[test]
    fn migration_rewrites_asset_and_marks_cache_stale() {
        let dao = new_simple();
        let from = Hash160::new([0xaa; 20]);
        let to = Hash160::new([0xbb; 20]);
        let acc = Hash160::new([1u8; 20]);
        let mut bs = TokenBalances::new();
        bs.trackers.insert(
            from,
            crate::state::tokens::TokenBalance {
                balance: Fixed8::from_raw(42),
                last_updated_block: 5,
            },
        );
        dao.put_token_balances(&acc, &bs).unwrap();

        let mut cached = Cached::new(&dao, quiet_logger());
        cached.migrate_balances(&from, &to).unwrap();
        cached.persist().unwrap();

        let migrated = dao.get_token_balances(&acc).unwrap();
        assert!(migrated.trackers.contains_key(&to));
        assert!(!migrated.trackers.contains_key(&from));
        assert_eq!(migrated.trackers[&to].balance, Fixed8::from_raw(42));
    }
}
