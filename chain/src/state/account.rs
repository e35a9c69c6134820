//! Account and contract state objects cached by the DAO.

use crate::util::codec::{CodecError, Reader, Writer};
use crate::util::hash::Hash160;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub script_hash: Hash160,
    pub version: u8,
    pub is_frozen: bool,
}

impl Account {
    pub fn new(script_hash: Hash160) -> Self {
        Account {
            script_hash,
            version: 0,
            is_frozen: false,
        }
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u8(self.version);
        w.write_hash160(&self.script_hash);
        w.write_u8(self.is_frozen as u8);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Account {
            version: r.read_u8()?,
            script_hash: r.read_hash160()?,
            is_frozen: r.read_u8()? != 0,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let acc = Self::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok(acc)
    }
}

/// Deployed contract record; the script stays opaque to this layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contract {
    pub hash: Hash160,
    pub script: Vec<u8>,
    pub name: String,
}

impl Contract {
    pub fn encode(&self, w: &mut Writer) {
        w.write_hash160(&self.hash);
        w.write_var_bytes(&self.script);
        w.write_var_string(&self.name);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Contract {
            hash: r.read_hash160()?,
            script: r.read_var_bytes()?,
            name: r.read_var_string()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let c = Self::decode(&mut r)?;
        r.ensure_exhausted()?;
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_round_trip() {
        let acc = Account {
            script_hash: Hash160::new([5u8; 20]),
            version: 1,
            is_frozen: true,
        };
        assert_eq!(Account::from_bytes(&acc.to_bytes()).unwrap(), acc);
    }

    #[test]
    fn contract_round_trip() {
        let c = Contract {
            hash: Hash160::new([6u8; 20]),
            script: vec![1, 2, 3],
            name: "token".into(),
        };
        assert_eq!(Contract::from_bytes(&c.to_bytes()).unwrap(), c);
    }
}
