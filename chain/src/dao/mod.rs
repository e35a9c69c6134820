//! Typed data access over the layered stores.
//!
//! Every entity is keyed under a compile-time-known single-byte prefix,
//! optionally followed by a fixed-length id. [`Simple`] is the memcached
//! wrapper around a backing store; [`cached::Cached`] adds per-entity
//! object caches on top of it for the hot paths of block processing.

pub mod cached;

use std::sync::Arc;

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::state::block::{Block, TrimmedBlock};
use crate::state::tokens::{Nep17Transfer, TokenBalances, TransferLog, NEP17_TRANSFER_BATCH_SIZE};
use crate::state::transaction::{Transaction, DUMMY_VERSION};
use crate::storage::{Batch, KeyValue, MemCachedStore, Store, StoreError, StoreResult};
use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::hash::{Hash160, Hash256};

pub use cached::Cached;

/// Header hashes are persisted in batches of exactly this many entries.
pub const HEADER_HASH_BATCH: usize = 2000;

/// Single-byte key prefixes. The exact values are implementation-defined
/// but must never change within an existing database.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPrefix {
    DataBlock = 0x01,
    DataTransaction = 0x02,
    Account = 0x40,
    Notification = 0x4d,
    Contract = 0x48,
    ContractId = 0x50,
    Storage = 0x70,
    Nep17TransferInfo = 0x72,
    Nep17Transfers = 0x73,
    IxHeaderHashList = 0x80,
    SysCurrentBlock = 0xc0,
    SysCurrentHeader = 0xc1,
    SysStateSyncPoint = 0xc2,
    SysStateSyncCurrentBlockHeight = 0xc3,
    SysVersion = 0xf0,
}

impl KeyPrefix {
    pub fn key(self) -> Vec<u8> {
        vec![self as u8]
    }
}

fn append_prefix(prefix: KeyPrefix, data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + data.len());
    key.push(prefix as u8);
    key.extend_from_slice(data);
    key
}

const STATE_ROOT_IN_HEADER_BIT: u8 = 1 << 0;
const P2P_SIG_EXTENSIONS_BIT: u8 = 1 << 1;
const KEEP_ONLY_LATEST_STATE_BIT: u8 = 1 << 2;

/// Database version record: an ASCII label, the storage prefix in use and
/// three feature flags. Missing or malformed version is fatal at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub value: String,
    pub storage_prefix: u8,
    pub state_root_in_header: bool,
    pub p2p_sig_extensions: bool,
    pub keep_only_latest_state: bool,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            value: String::new(),
            storage_prefix: KeyPrefix::Storage as u8,
            state_root_in_header: false,
            p2p_sig_extensions: false,
            keep_only_latest_state: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("missing version")]
    Missing,
    #[error("version is invalid")]
    Malformed,
}

impl Version {
    /// Label, NUL separator, prefix byte, feature bitmask.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut mask = 0u8;
        if self.state_root_in_header {
            mask |= STATE_ROOT_IN_HEADER_BIT;
        }
        if self.p2p_sig_extensions {
            mask |= P2P_SIG_EXTENSIONS_BIT;
        }
        if self.keep_only_latest_state {
            mask |= KEEP_ONLY_LATEST_STATE_BIT;
        }
        let mut out = self.value.as_bytes().to_vec();
        out.push(0);
        out.push(self.storage_prefix);
        out.push(mask);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, VersionError> {
        if data.is_empty() {
            return Err(VersionError::Missing);
        }
        let sep = data.iter().position(|b| *b == 0);
        let Some(i) = sep else {
            // Legacy label-only record.
            let value = String::from_utf8(data.to_vec()).map_err(|_| VersionError::Malformed)?;
            return Ok(Version {
                value,
                ..Version::default()
            });
        };
        if data.len() != i + 3 {
            return Err(VersionError::Malformed);
        }
        let value = String::from_utf8(data[..i].to_vec()).map_err(|_| VersionError::Malformed)?;
        let mask = data[i + 2];
        Ok(Version {
            value,
            storage_prefix: data[i + 1],
            state_root_in_header: mask & STATE_ROOT_IN_HEADER_BIT != 0,
            p2p_sig_extensions: mask & P2P_SIG_EXTENSIONS_BIT != 0,
            keep_only_latest_state: mask & KEEP_ONLY_LATEST_STATE_BIT != 0,
        })
    }
}

/// Errors from the typed DAO operations.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("header hash batch must hold exactly {HEADER_HASH_BATCH} hashes, got {0}")]
    BadHeaderBatch(usize),
}

impl DaoError {
    /// True when the underlying cause is the missing-key sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DaoError::Store(StoreError::NotFound))
    }
}

/// Outcome of [`Simple::has_transaction`] when the hash is occupied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HasTransactionError {
    #[error("transaction already exists")]
    AlreadyExists,
    #[error("transaction has conflicts")]
    HasConflicts,
}

/// Memcached wrapper around a backing store; the simple DAO implementation.
pub struct Simple {
    pub version: Version,
    pub store: Arc<MemCachedStore>,
}

impl Simple {
    pub fn new(backend: Arc<dyn Store>, version: Version) -> Self {
        Simple {
            version,
            store: Arc::new(MemCachedStore::new(backend)),
        }
    }

    /// New DAO whose store wraps the current one: the transactional-scope
    /// mechanism. Persist the wrapper to commit, drop it to abort.
    pub fn get_wrapped(&self) -> Simple {
        let parent: Arc<dyn Store> = self.store.clone();
        Simple {
            version: self.version.clone(),
            store: Arc::new(MemCachedStore::new(parent)),
        }
    }

    /// Flushes one layer into the parent store, returning the pair count.
    pub fn persist(&self) -> StoreResult<usize> {
        self.store.persist()
    }

    // -- version and system pointers.

    pub fn get_version(&self) -> Result<Version, DaoError> {
        match self.store.get(&KeyPrefix::SysVersion.key()) {
            Ok(data) => Ok(Version::from_bytes(&data)?),
            Err(StoreError::NotFound) => Err(VersionError::Missing.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_version(&mut self, v: Version) -> Result<(), DaoError> {
        self.store.put(&KeyPrefix::SysVersion.key(), &v.to_bytes())?;
        self.version = v;
        Ok(())
    }

    /// `hash.BE || u32-LE(index)` under the current-block key.
    pub fn store_as_current_block(&self, block: &Block) -> Result<(), DaoError> {
        let mut w = Writer::new();
        w.write_hash256(&block.hash(self.version.state_root_in_header));
        w.write_u32_le(block.header.index);
        self.store
            .put(&KeyPrefix::SysCurrentBlock.key(), &w.into_bytes())?;
        Ok(())
    }

    pub fn get_current_block_height(&self) -> Result<u32, DaoError> {
        let data = self.store.get(&KeyPrefix::SysCurrentBlock.key())?;
        let mut r = Reader::new(&data);
        let _hash = r.read_hash256()?;
        Ok(r.read_u32_le()?)
    }

    pub fn put_current_header(&self, hash: &Hash256, index: u32) -> Result<(), DaoError> {
        let mut w = Writer::new();
        w.write_hash256(hash);
        w.write_u32_le(index);
        self.store
            .put(&KeyPrefix::SysCurrentHeader.key(), &w.into_bytes())?;
        Ok(())
    }

    pub fn get_current_header_height(&self) -> Result<(u32, Hash256), DaoError> {
        let data = self.store.get(&KeyPrefix::SysCurrentHeader.key())?;
        let mut r = Reader::new(&data);
        let hash = r.read_hash256()?;
        let index = r.read_u32_le()?;
        Ok((index, hash))
    }

    pub fn put_state_sync_point(&self, point: u32) -> Result<(), DaoError> {
        self.store
            .put(&KeyPrefix::SysStateSyncPoint.key(), &point.to_le_bytes())?;
        Ok(())
    }

    pub fn get_state_sync_point(&self) -> Result<u32, DaoError> {
        let data = self.store.get(&KeyPrefix::SysStateSyncPoint.key())?;
        let mut r = Reader::new(&data);
        Ok(r.read_u32_le()?)
    }

    pub fn put_state_sync_current_block_height(&self, height: u32) -> Result<(), DaoError> {
        self.store.put(
            &KeyPrefix::SysStateSyncCurrentBlockHeight.key(),
            &height.to_le_bytes(),
        )?;
        Ok(())
    }

    pub fn get_state_sync_current_block_height(&self) -> Result<u32, DaoError> {
        let data = self
            .store
            .get(&KeyPrefix::SysStateSyncCurrentBlockHeight.key())?;
        let mut r = Reader::new(&data);
        Ok(r.read_u32_le()?)
    }

    // -- header hash lists.

    pub fn put_header_hashes(&self, start: u32, hashes: &[Hash256]) -> Result<(), DaoError> {
        if hashes.len() != HEADER_HASH_BATCH {
            return Err(DaoError::BadHeaderBatch(hashes.len()));
        }
        let mut key = KeyPrefix::IxHeaderHashList.key();
        key.extend_from_slice(&start.to_le_bytes());
        let mut w = Writer::new();
        w.write_var_uint(hashes.len() as u64);
        for h in hashes {
            w.write_hash256(h);
        }
        self.store.put(&key, &w.into_bytes())?;
        Ok(())
    }

    /// All stored header hashes in height order.
    pub fn get_header_hashes(&self) -> Result<Vec<Hash256>, DaoError> {
        let mut batches: Vec<(u32, Vec<Hash256>)> = Vec::new();
        let mut decode_err = None;
        self.store
            .seek(&KeyPrefix::IxHeaderHashList.key(), &mut |k, v| {
                if decode_err.is_some() || k.len() != 5 {
                    return;
                }
                let start = u32::from_le_bytes([k[1], k[2], k[3], k[4]]);
                let mut r = Reader::new(v);
                match read_hash_batch(&mut r) {
                    Ok(hashes) => batches.push((start, hashes)),
                    Err(e) => decode_err = Some(e),
                }
            })?;
        if let Some(e) = decode_err {
            return Err(e.into());
        }
        batches.sort_by_key(|(start, _)| *start);
        let mut out = Vec::new();
        for (start, hashes) in batches {
            out.truncate(start as usize);
            out.extend(hashes);
        }
        Ok(out)
    }

    // -- blocks.

    /// Stores the trimmed form of the block under its hash.
    pub fn store_as_block(&self, block: &Block) -> Result<(), DaoError> {
        let srih = self.version.state_root_in_header;
        let key = append_prefix(KeyPrefix::DataBlock, block.hash(srih).as_bytes());
        self.store.put(&key, &block.trim(srih))?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<TrimmedBlock, DaoError> {
        let key = append_prefix(KeyPrefix::DataBlock, hash.as_bytes());
        let data = self.store.get(&key)?;
        Ok(TrimmedBlock::from_bytes(
            &data,
            self.version.state_root_in_header,
        )?)
    }

    /// Removes a block: the record is reduced to a header-only stub and the
    /// transactions, their conflict placeholders and notifications are
    /// dropped in one atomic batch.
    pub fn delete_block(&self, hash: &Hash256) -> Result<(), DaoError> {
        let srih = self.version.state_root_in_header;
        let block_key = append_prefix(KeyPrefix::DataBlock, hash.as_bytes());
        let trimmed = TrimmedBlock::from_bytes(&self.store.get(&block_key)?, srih)?;

        let mut batch = Batch::new();
        let stub = TrimmedBlock {
            header: trimmed.header.clone(),
            tx_hashes: Vec::new(),
        };
        batch.put(&block_key, &stub.to_bytes(srih));

        for tx_hash in &trimmed.tx_hashes {
            let tx_key = append_prefix(KeyPrefix::DataTransaction, tx_hash.as_bytes());
            if self.version.p2p_sig_extensions {
                if let Ok((tx, _)) = self.get_transaction(tx_hash) {
                    for conflict in tx.conflicts() {
                        batch.delete(&append_prefix(
                            KeyPrefix::DataTransaction,
                            conflict.as_bytes(),
                        ));
                    }
                }
            }
            batch.delete(&tx_key);
            batch.delete(&append_prefix(KeyPrefix::Notification, tx_hash.as_bytes()));
        }
        batch.delete(&append_prefix(KeyPrefix::Notification, hash.as_bytes()));
        self.store.put_batch(batch)?;
        Ok(())
    }

    // -- transactions.

    /// Stores the transaction as `u32-LE(index) || wire bytes`, plus a dummy
    /// placeholder under every hash it conflicts with when the signature
    /// extensions are enabled.
    pub fn store_as_transaction(&self, tx: &Transaction, index: u32) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::DataTransaction, tx.hash().as_bytes());
        let mut w = Writer::new();
        w.write_u32_le(index);
        tx.encode(&mut w);
        self.store.put(&key, &w.into_bytes())?;

        if self.version.p2p_sig_extensions {
            let mut placeholder = Vec::with_capacity(5);
            placeholder.extend_from_slice(&index.to_le_bytes());
            placeholder.push(DUMMY_VERSION);
            for conflict in tx.conflicts() {
                let key = append_prefix(KeyPrefix::DataTransaction, conflict.as_bytes());
                self.store.put(&key, &placeholder)?;
            }
        }
        Ok(())
    }

    /// Returns the transaction and the height it was accepted at. Dummy
    /// placeholder records report `NotFound`.
    pub fn get_transaction(&self, hash: &Hash256) -> Result<(Transaction, u32), DaoError> {
        let key = append_prefix(KeyPrefix::DataTransaction, hash.as_bytes());
        let data = self.store.get(&key)?;
        if data.len() < 5 {
            return Err(CodecError::UnexpectedEof.into());
        }
        if data[4] == DUMMY_VERSION {
            return Err(StoreError::NotFound.into());
        }
        let mut r = Reader::new(&data);
        let height = r.read_u32_le()?;
        let tx = Transaction::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok((tx, height))
    }

    /// Ok when the hash is free; otherwise reports whether a real
    /// transaction or only a conflict placeholder occupies it.
    pub fn has_transaction(&self, hash: &Hash256) -> Result<(), HasTransactionError> {
        let key = append_prefix(KeyPrefix::DataTransaction, hash.as_bytes());
        let Ok(data) = self.store.get(&key) else {
            return Ok(());
        };
        if data.len() < 5 {
            return Ok(());
        }
        if data[4] == DUMMY_VERSION {
            return Err(HasTransactionError::HasConflicts);
        }
        Err(HasTransactionError::AlreadyExists)
    }

    // -- contract id mapping.

    fn contract_id_key(id: i32) -> Vec<u8> {
        let mut key = KeyPrefix::ContractId.key();
        key.extend_from_slice(&(id as u32).to_le_bytes());
        key
    }

    pub fn put_contract_script_hash(&self, id: i32, hash: &Hash160) -> Result<(), DaoError> {
        self.store.put(&Self::contract_id_key(id), hash.as_bytes())?;
        Ok(())
    }

    pub fn get_contract_script_hash(&self, id: i32) -> Result<Hash160, DaoError> {
        let data = self.store.get(&Self::contract_id_key(id))?;
        let mut r = Reader::new(&data);
        let hash = r.read_hash160()?;
        r.ensure_exhausted()?;
        Ok(hash)
    }

    pub fn delete_contract_id(&self, id: i32) -> Result<(), DaoError> {
        self.store.delete(&Self::contract_id_key(id))?;
        Ok(())
    }

    // -- storage items.

    fn storage_item_key(&self, contract_id: i32, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + key.len());
        out.push(self.version.storage_prefix);
        out.extend_from_slice(&(contract_id as u32).to_le_bytes());
        out.extend_from_slice(key);
        out
    }

    pub fn get_storage_item(&self, contract_id: i32, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(&self.storage_item_key(contract_id, key)).ok()
    }

    pub fn put_storage_item(
        &self,
        contract_id: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DaoError> {
        self.store
            .put(&self.storage_item_key(contract_id, key), value)?;
        Ok(())
    }

    pub fn delete_storage_item(&self, contract_id: i32, key: &[u8]) -> Result<(), DaoError> {
        self.store
            .delete(&self.storage_item_key(contract_id, key))?;
        Ok(())
    }

    /// Runs `f` for every storage item of the contract under `prefix`, with
    /// the lookup prefix already stripped from the keys.
    pub fn seek_storage(
        &self,
        contract_id: i32,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), DaoError> {
        let lookup = self.storage_item_key(contract_id, prefix);
        let skip = lookup.len();
        self.store.seek(&lookup, &mut |k, v| f(&k[skip..], v))?;
        Ok(())
    }

    pub fn get_storage_items(&self, contract_id: i32) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DaoError> {
        self.get_storage_items_with_prefix(contract_id, &[])
    }

    pub fn get_storage_items_with_prefix(
        &self,
        contract_id: i32,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DaoError> {
        let mut items = Vec::new();
        self.seek_storage(contract_id, prefix, &mut |k, v| {
            items.push((k.to_vec(), v.to_vec()));
        })?;
        Ok(items)
    }

    /// Streaming variant of [`Self::seek_storage`] with a cancellation
    /// token; closing the token stops the stream.
    pub fn seek_storage_async(
        &self,
        contract_id: i32,
        prefix: &[u8],
        cancel: Receiver<()>,
    ) -> Receiver<KeyValue> {
        let lookup = self.storage_item_key(contract_id, prefix);
        self.store.seek_async(&lookup, cancel)
    }

    // -- NEP-17 balances and transfer logs.

    pub fn get_token_balances(&self, acc: &Hash160) -> Result<TokenBalances, DaoError> {
        let key = append_prefix(KeyPrefix::Nep17TransferInfo, acc.as_bytes());
        match self.store.get(&key) {
            Ok(data) => Ok(TokenBalances::from_bytes(&data)?),
            Err(StoreError::NotFound) => Ok(TokenBalances::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_token_balances(&self, acc: &Hash160, bs: &TokenBalances) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::Nep17TransferInfo, acc.as_bytes());
        self.store.put(&key, &bs.to_bytes())?;
        Ok(())
    }

    fn transfer_log_key(acc: &Hash160, index: u32) -> Vec<u8> {
        let mut key = KeyPrefix::Nep17Transfers.key();
        key.extend_from_slice(acc.as_bytes());
        key.extend_from_slice(&index.to_le_bytes());
        key
    }

    pub fn get_transfer_log(&self, acc: &Hash160, index: u32) -> Result<TransferLog, DaoError> {
        match self.store.get(&Self::transfer_log_key(acc, index)) {
            Ok(raw) => Ok(TransferLog::from_raw(raw)),
            Err(StoreError::NotFound) => Ok(TransferLog::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_transfer_log(
        &self,
        acc: &Hash160,
        index: u32,
        log: &TransferLog,
    ) -> Result<(), DaoError> {
        self.store
            .put(&Self::transfer_log_key(acc, index), &log.raw)?;
        Ok(())
    }

    /// Appends one transfer to the account log at `index`. Returns true when
    /// the batch is full and the caller must move to the next index.
    pub fn append_nep17_transfer(
        &self,
        acc: &Hash160,
        index: u32,
        is_new: bool,
        transfer: &Nep17Transfer,
    ) -> Result<bool, DaoError> {
        let mut log = if is_new {
            TransferLog::new()
        } else {
            self.get_transfer_log(acc, index)?
        };
        log.append(transfer);
        self.put_transfer_log(acc, index, &log)?;
        Ok(log.size() >= NEP17_TRANSFER_BATCH_SIZE)
    }

    // -- notifications (execution results).

    /// Appends an opaque execution result to the container's record.
    pub fn append_execution_result(
        &self,
        container: &Hash256,
        result: &[u8],
    ) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::Notification, container.as_bytes());
        let mut value = match self.store.get(&key) {
            Ok(existing) => existing,
            Err(StoreError::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut w = Writer::new();
        w.write_var_bytes(result);
        value.extend_from_slice(&w.into_bytes());
        self.store.put(&key, &value)?;
        Ok(())
    }

    pub fn get_execution_results(&self, container: &Hash256) -> Result<Vec<Vec<u8>>, DaoError> {
        let key = append_prefix(KeyPrefix::Notification, container.as_bytes());
        let data = self.store.get(&key)?;
        let mut r = Reader::new(&data);
        let mut out = Vec::new();
        while !r.is_exhausted() {
            out.push(r.read_var_bytes()?);
        }
        Ok(out)
    }

    // -- accounts and contracts (used by the cached DAO).

    pub fn get_account(&self, hash: &Hash160) -> Result<crate::state::Account, DaoError> {
        let key = append_prefix(KeyPrefix::Account, hash.as_bytes());
        Ok(crate::state::Account::from_bytes(&self.store.get(&key)?)?)
    }

    pub fn put_account(&self, account: &crate::state::Account) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::Account, account.script_hash.as_bytes());
        self.store.put(&key, &account.to_bytes())?;
        Ok(())
    }

    pub fn get_contract(&self, hash: &Hash160) -> Result<crate::state::Contract, DaoError> {
        let key = append_prefix(KeyPrefix::Contract, hash.as_bytes());
        Ok(crate::state::Contract::from_bytes(&self.store.get(&key)?)?)
    }

    pub fn put_contract(&self, contract: &crate::state::Contract) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::Contract, contract.hash.as_bytes());
        self.store.put(&key, &contract.to_bytes())?;
        Ok(())
    }

    pub fn delete_contract(&self, hash: &Hash160) -> Result<(), DaoError> {
        let key = append_prefix(KeyPrefix::Contract, hash.as_bytes());
        self.store.delete(&key)?;
        Ok(())
    }
}

fn read_hash_batch(r: &mut Reader<'_>) -> Result<Vec<Hash256>, CodecError> {
    let count = r.read_var_uint()?;
    let mut hashes = Vec::with_capacity(count.min(HEADER_HASH_BATCH as u64) as usize);
    for _ in 0..count {
        hashes.push(r.read_hash256()?);
    }
    Ok(hashes)
}
