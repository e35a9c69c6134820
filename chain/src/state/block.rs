//! Block headers, full blocks and the trimmed persisted form.

use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::hash::{hash256, Hash256};

use super::transaction::Transaction;

/// Block header. The state root is only part of the encoding when the
/// database version enables state-root-in-header, so every codec entry point
/// takes that flag explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    pub index: u32,
    pub state_root: Option<Hash256>,
}

impl Header {
    pub fn encode(&self, w: &mut Writer, state_root_in_header: bool) {
        w.write_u32_le(self.version);
        w.write_hash256(&self.prev_hash);
        w.write_hash256(&self.merkle_root);
        w.write_u64_le(self.timestamp);
        w.write_u32_le(self.index);
        if state_root_in_header {
            w.write_hash256(&self.state_root.unwrap_or(Hash256::zero()));
        }
    }

    pub fn decode(r: &mut Reader<'_>, state_root_in_header: bool) -> Result<Self, CodecError> {
        Ok(Header {
            version: r.read_u32_le()?,
            prev_hash: r.read_hash256()?,
            merkle_root: r.read_hash256()?,
            timestamp: r.read_u64_le()?,
            index: r.read_u32_le()?,
            state_root: if state_root_in_header {
                Some(r.read_hash256()?)
            } else {
                None
            },
        })
    }

    pub fn hash(&self, state_root_in_header: bool) -> Hash256 {
        let mut w = Writer::new();
        self.encode(&mut w, state_root_in_header);
        hash256(&w.into_bytes())
    }
}

/// Full block with transaction bodies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self, state_root_in_header: bool) -> Hash256 {
        self.header.hash(state_root_in_header)
    }

    /// Replaces transaction bodies with their hashes, the form persisted
    /// under the block prefix.
    pub fn trim(&self, state_root_in_header: bool) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.encode(&mut w, state_root_in_header);
        w.write_var_uint(self.transactions.len() as u64);
        for tx in &self.transactions {
            w.write_hash256(&tx.hash());
        }
        w.into_bytes()
    }
}

/// Header plus transaction hashes, read back from a trimmed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrimmedBlock {
    pub header: Header,
    pub tx_hashes: Vec<Hash256>,
}

impl TrimmedBlock {
    pub fn from_bytes(data: &[u8], state_root_in_header: bool) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let header = Header::decode(&mut r, state_root_in_header)?;
        let count = r.read_var_uint()?;
        let mut tx_hashes = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            tx_hashes.push(r.read_hash256()?);
        }
        r.ensure_exhausted()?;
        Ok(TrimmedBlock { header, tx_hashes })
    }

    pub fn to_bytes(&self, state_root_in_header: bool) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.encode(&mut w, state_root_in_header);
        w.write_var_uint(self.tx_hashes.len() as u64);
        for h in &self.tx_hashes {
            w.write_hash256(h);
        }
        w.into_bytes()
    }

    pub fn hash(&self, state_root_in_header: bool) -> Hash256 {
        self.header.hash(state_root_in_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::fixed8::Fixed8;
    use crate::util::hash::Hash160;

    fn sample_block() -> Block {
        let tx = Transaction::new(
            0,
            Hash160::new([1u8; 20]),
            Fixed8::ZERO,
            Fixed8::from_raw(5),
            vec![],
            vec![],
            vec![1, 2, 3],
        );
        Block {
            header: Header {
                version: 0,
                prev_hash: Hash256::new([9u8; 32]),
                merkle_root: Hash256::new([8u8; 32]),
                timestamp: 1_600_000_000,
                index: 42,
                state_root: None,
            },
            transactions: vec![tx],
        }
    }

    #[test]
    fn trim_round_trip() {
        let block = sample_block();
        let trimmed = TrimmedBlock::from_bytes(&block.trim(false), false).unwrap();
        assert_eq!(trimmed.header, block.header);
        assert_eq!(trimmed.tx_hashes, vec![block.transactions[0].hash()]);
        assert_eq!(trimmed.hash(false), block.hash(false));
    }

    #[test]
    fn state_root_flag_changes_encoding() {
        let mut block = sample_block();
        block.header.state_root = Some(Hash256::new([3u8; 32]));
        let with_root = block.trim(true);
        let without_root = block.trim(false);
        assert_eq!(with_root.len(), without_root.len() + 32);
        let decoded = TrimmedBlock::from_bytes(&with_root, true).unwrap();
        assert_eq!(decoded.header.state_root, Some(Hash256::new([3u8; 32])));
    }
}
