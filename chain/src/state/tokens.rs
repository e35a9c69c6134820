//! NEP-17 balance trackers and the append-only transfer logs.

use std::collections::BTreeMap;

use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::fixed8::Fixed8;
use crate::util::hash::{Hash160, Hash256};

/// Transfers per log batch; reaching it signals the caller to move to the
/// next log index.
pub const NEP17_TRANSFER_BATCH_SIZE: usize = 128;

/// Per-asset balance tracker for one account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenBalance {
    pub balance: Fixed8,
    pub last_updated_block: u32,
}

/// All token balances of one account plus the position of its transfer log.
/// Trackers are kept in a sorted map so the encoding is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenBalances {
    pub trackers: BTreeMap<Hash160, TokenBalance>,
    pub next_transfer_batch: u32,
}

impl TokenBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u32_le(self.next_transfer_batch);
        w.write_var_uint(self.trackers.len() as u64);
        for (asset, tracker) in &self.trackers {
            w.write_hash160(asset);
            w.write_i64_le(tracker.balance.raw());
            w.write_u32_le(tracker.last_updated_block);
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let next_transfer_batch = r.read_u32_le()?;
        let count = r.read_var_uint()?;
        let mut trackers = BTreeMap::new();
        for _ in 0..count {
            let asset = r.read_hash160()?;
            let balance = Fixed8::from_raw(r.read_i64_le()?);
            let last_updated_block = r.read_u32_le()?;
            trackers.insert(
                asset,
                TokenBalance {
                    balance,
                    last_updated_block,
                },
            );
        }
        Ok(TokenBalances {
            trackers,
            next_transfer_batch,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let bs = Self::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok(bs)
    }
}

/// A single NEP-17 transfer event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nep17Transfer {
    pub asset: Hash160,
    pub from: Hash160,
    pub to: Hash160,
    pub amount: Fixed8,
    pub block: u32,
    pub timestamp: u64,
    pub tx: Hash256,
}

impl Nep17Transfer {
    /// Fixed encoded size, which is what makes log batches countable.
    pub const SIZE: usize = 20 + 20 + 20 + 8 + 4 + 8 + 32;

    pub fn encode(&self, w: &mut Writer) {
        w.write_hash160(&self.asset);
        w.write_hash160(&self.from);
        w.write_hash160(&self.to);
        w.write_i64_le(self.amount.raw());
        w.write_u32_le(self.block);
        w.write_u64_le(self.timestamp);
        w.write_hash256(&self.tx);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Nep17Transfer {
            asset: r.read_hash160()?,
            from: r.read_hash160()?,
            to: r.read_hash160()?,
            amount: Fixed8::from_raw(r.read_i64_le()?),
            block: r.read_u32_le()?,
            timestamp: r.read_u64_le()?,
            tx: r.read_hash256()?,
        })
    }
}

/// Opaque append-only transfer log, a concatenation of fixed-size entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferLog {
    pub raw: Vec<u8>,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: Vec<u8>) -> Self {
        TransferLog { raw }
    }

    pub fn append(&mut self, transfer: &Nep17Transfer) {
        let mut w = Writer::new();
        transfer.encode(&mut w);
        self.raw.extend_from_slice(&w.into_bytes());
    }

    /// Number of entries in the log.
    pub fn size(&self) -> usize {
        self.raw.len() / Nep17Transfer::SIZE
    }

    pub fn entries(&self) -> Result<Vec<Nep17Transfer>, CodecError> {
        let mut r = Reader::new(&self.raw);
        let mut out = Vec::with_capacity(self.size());
        while !r.is_exhausted() {
            out.push(Nep17Transfer::decode(&mut r)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(n: u8) -> Nep17Transfer {
        Nep17Transfer {
            asset: Hash160::new([n; 20]),
            from: Hash160::new([1u8; 20]),
            to: Hash160::new([2u8; 20]),
            amount: Fixed8::from_raw(n as i64),
            block: 7,
            timestamp: 1_600_000_000,
            tx: Hash256::new([n; 32]),
        }
    }

    #[test]
    fn balances_round_trip() {
        let mut bs = TokenBalances::new();
        bs.next_transfer_batch = 3;
        bs.trackers.insert(
            Hash160::new([4u8; 20]),
            TokenBalance {
                balance: Fixed8::from_raw(100),
                last_updated_block: 12,
            },
        );
        assert_eq!(TokenBalances::from_bytes(&bs.to_bytes()).unwrap(), bs);
    }

    #[test]
    fn log_counts_fixed_size_entries() {
        let mut log = TransferLog::new();
        log.append(&transfer(1));
        log.append(&transfer(2));
        assert_eq!(log.size(), 2);
        let entries = log.entries().unwrap();
        assert_eq!(entries[1].amount, Fixed8::from_raw(2));
    }
}
