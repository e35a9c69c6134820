//! Fixed-width content identifiers.
//!
//! Both hash types are stored and transmitted big-endian (the wire form)
//! and *displayed* in the reversed, little-endian hex form, so the two must
//! never be mixed up when reading logs against raw database keys.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of [`Hash256`] in bytes.
pub const HASH256_SIZE: usize = 32;
/// Size of [`Hash160`] in bytes.
pub const HASH160_SIZE: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum HashError {
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// 256-bit identifier with total ordering by byte value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256([u8; HASH256_SIZE]);

/// 160-bit identifier, typically a script hash or account id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash160([u8; HASH160_SIZE]);

macro_rules! impl_hash {
    ($name:ident, $size:expr) => {
        impl $name {
            pub const SIZE: usize = $size;

            pub const fn new(data: [u8; $size]) -> Self {
                Self(data)
            }

            pub const fn zero() -> Self {
                Self([0u8; $size])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Big-endian wire form.
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            pub fn to_array(self) -> [u8; $size] {
                self.0
            }

            pub fn from_slice(data: &[u8]) -> Result<Self, HashError> {
                if data.len() != $size {
                    return Err(HashError::InvalidLength {
                        expected: $size,
                        got: data.len(),
                    });
                }
                let mut out = [0u8; $size];
                out.copy_from_slice(data);
                Ok(Self(out))
            }

            /// Parses the reversed (display) hex form.
            pub fn from_hex_le(s: &str) -> Result<Self, HashError> {
                let mut data = hex::decode(s)?;
                data.reverse();
                Self::from_slice(&data)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut rev = self.0;
                rev.reverse();
                write!(f, "{}", hex::encode(rev))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(data: [u8; $size]) -> Self {
                Self(data)
            }
        }
    };
}

impl_hash!(Hash256, HASH256_SIZE);
impl_hash!(Hash160, HASH160_SIZE);

/// Double SHA-256, the node-wide content hash.
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH256_SIZE];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// First four bytes of [`hash256`], used as a message checksum.
pub fn checksum4(data: &[u8]) -> [u8; 4] {
    let h = hash256(data);
    let mut out = [0u8; 4];
    out.copy_from_slice(&h.0[..4]);
    out
}
