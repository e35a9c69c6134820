//! Transactions and their wire encoding.

use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::fixed8::Fixed8;
use crate::util::hash::{hash256, Hash160, Hash256};

/// Version byte reserved for conflict-placeholder records; a real
/// transaction never carries it.
pub const DUMMY_VERSION: u8 = 0xff;

const ATTR_CONFLICTS: u8 = 0x01;
const ATTR_REMARK: u8 = 0xf0;

/// Reference to a previous output. The derived ordering (hash bytes, then
/// index) makes every input uniquely orderable, which the mempool relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Input {
    pub prev_hash: Hash256,
    pub prev_index: u16,
}

impl Input {
    pub fn encode(&self, w: &mut Writer) {
        w.write_hash256(&self.prev_hash);
        w.write_u16_le(self.prev_index);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Input {
            prev_hash: r.read_hash256()?,
            prev_index: r.read_u16_le()?,
        })
    }
}

/// Typed transaction attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    /// Names another transaction this one renders invalid.
    Conflicts(Hash256),
    /// Opaque user data.
    Remark(Vec<u8>),
}

impl Attribute {
    pub fn encode(&self, w: &mut Writer) {
        match self {
            Attribute::Conflicts(h) => {
                w.write_u8(ATTR_CONFLICTS);
                w.write_hash256(h);
            }
            Attribute::Remark(data) => {
                w.write_u8(ATTR_REMARK);
                w.write_var_bytes(data);
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match r.read_u8()? {
            ATTR_CONFLICTS => Ok(Attribute::Conflicts(r.read_hash256()?)),
            ATTR_REMARK => Ok(Attribute::Remark(r.read_var_bytes()?)),
            t => Err(CodecError::InvalidValue(format!(
                "unknown attribute type {t:#04x}"
            ))),
        }
    }
}

/// An immutable transaction. The hash and serialized size are computed at
/// construction and never change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    version: u8,
    sender: Hash160,
    sys_fee: Fixed8,
    net_fee: Fixed8,
    inputs: Vec<Input>,
    attributes: Vec<Attribute>,
    script: Vec<u8>,

    hash: Hash256,
    size: usize,
}

impl Transaction {
    pub fn new(
        version: u8,
        sender: Hash160,
        sys_fee: Fixed8,
        net_fee: Fixed8,
        inputs: Vec<Input>,
        attributes: Vec<Attribute>,
        script: Vec<u8>,
    ) -> Self {
        let mut tx = Transaction {
            version,
            sender,
            sys_fee,
            net_fee,
            inputs,
            attributes,
            script,
            hash: Hash256::zero(),
            size: 0,
        };
        let wire = tx.to_bytes();
        tx.hash = hash256(&wire);
        tx.size = wire.len();
        tx
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn sender(&self) -> Hash160 {
        self.sender
    }

    pub fn sys_fee(&self) -> Fixed8 {
        self.sys_fee
    }

    pub fn net_fee(&self) -> Fixed8 {
        self.net_fee
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn script(&self) -> &[u8] {
        &self.script
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Serialized length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Network fee divided by the serialized length, in raw units.
    pub fn fee_per_byte(&self) -> Fixed8 {
        self.net_fee.div_usize(self.size)
    }

    /// Hashes named by the conflicts attributes.
    pub fn conflicts(&self) -> impl Iterator<Item = &Hash256> {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::Conflicts(h) => Some(h),
            _ => None,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(self.version);
        w.write_hash160(&self.sender);
        w.write_i64_le(self.sys_fee.raw());
        w.write_i64_le(self.net_fee.raw());
        w.write_var_uint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(w);
        }
        w.write_var_uint(self.attributes.len() as u64);
        for attr in &self.attributes {
            attr.encode(w);
        }
        w.write_var_bytes(&self.script);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_u8()?;
        if version == DUMMY_VERSION {
            return Err(CodecError::InvalidValue(
                "dummy version on a real transaction".into(),
            ));
        }
        let sender = r.read_hash160()?;
        let sys_fee = Fixed8::from_raw(r.read_i64_le()?);
        let net_fee = Fixed8::from_raw(r.read_i64_le()?);
        let input_count = r.read_var_uint()?;
        let mut inputs = Vec::with_capacity(input_count.min(64) as usize);
        for _ in 0..input_count {
            inputs.push(Input::decode(r)?);
        }
        let attr_count = r.read_var_uint()?;
        let mut attributes = Vec::with_capacity(attr_count.min(16) as usize);
        for _ in 0..attr_count {
            attributes.push(Attribute::decode(r)?);
        }
        let script = r.read_var_bytes()?;
        Ok(Transaction::new(
            version, sender, sys_fee, net_fee, inputs, attributes, script,
        ))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let tx = Self::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::new(
            0,
            Hash160::new([7u8; 20]),
            Fixed8::from_raw(10),
            Fixed8::from_raw(20),
            vec![Input {
                prev_hash: Hash256::new([1u8; 32]),
                prev_index: 3,
            }],
            vec![
                Attribute::Conflicts(Hash256::new([2u8; 32])),
                Attribute::Remark(b"note".to_vec()),
            ],
            vec![0xde, 0xad],
        )
    }

    #[test]
    fn wire_round_trip_preserves_hash() {
        let tx = sample_tx();
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.size(), tx.to_bytes().len());
    }

    #[test]
    fn conflicts_iterator_filters_attributes() {
        let tx = sample_tx();
        let conflicts: Vec<_> = tx.conflicts().collect();
        assert_eq!(conflicts, vec![&Hash256::new([2u8; 32])]);
    }

    #[test]
    fn dummy_version_is_rejected() {
        let tx = sample_tx();
        let mut bytes = tx.to_bytes();
        bytes[0] = DUMMY_VERSION;
        assert!(Transaction::from_bytes(&bytes).is_err());
    }

    #[test]
    fn input_ordering_is_hash_then_index() {
        let a = Input {
            prev_hash: Hash256::new([1u8; 32]),
            prev_index: 9,
        };
        let b = Input {
            prev_hash: Hash256::new([2u8; 32]),
            prev_index: 0,
        };
        assert!(a < b);
        let c = Input {
            prev_hash: Hash256::new([1u8; 32]),
            prev_index: 10,
        };
        assert!(a < c);
    }
}
