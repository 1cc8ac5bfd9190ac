//! Key and value encodings.
//!
//! A table never looks inside its keys and values, it only needs to hash keys,
//! compare them, and turn both into bytes for the data log and back.

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(thiserror::Error, Debug)]
/// Errors encoding or decoding keys and values.
pub enum CodecError {
    /// A fixed-size encoding got the wrong number of bytes.
    #[error("Expected {expected} bytes, found {found}")]
    Length { expected: usize, found: usize },

    #[error("Invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[cfg(feature = "bencode")]
    #[error("Bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

/// Converts a key or value to and from the bytes stored in the data log.
pub trait Encoding: Sized {
    /// Append the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decode a value previously written by [Encoding::encode].
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// A type usable as a table key.
///
/// `table_hash` must be stable across processes, since bucket placement is persisted.
/// [std::hash::Hash] is deliberately not used for that reason.
pub trait TableKey: Encoding + PartialEq {
    fn table_hash(&self) -> i32;
}

/// Castagnoli CRC-32 of `bytes`, reinterpreted as a signed hash.
pub fn hash_bytes(bytes: &[u8]) -> i32 {
    CASTAGNOLI.checksum(bytes) as i32
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CodecError> {
    bytes.try_into().map_err(|_| CodecError::Length {
        expected: N,
        found: bytes.len(),
    })
}

macro_rules! int_encoding {
    ($($int:ty),*) => {
        $(
            impl Encoding for $int {
                fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
                    buf.extend_from_slice(&self.to_le_bytes());
                    Ok(())
                }

                fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    Ok(<$int>::from_le_bytes(fixed(bytes)?))
                }
            }
        )*
    };
}

int_encoding!(i32, u32, i64, u64);

impl TableKey for i32 {
    fn table_hash(&self) -> i32 {
        *self
    }
}

impl TableKey for u32 {
    fn table_hash(&self) -> i32 {
        *self as i32
    }
}

impl TableKey for i64 {
    fn table_hash(&self) -> i32 {
        (*self ^ (*self >> 32)) as i32
    }
}

impl TableKey for u64 {
    fn table_hash(&self) -> i32 {
        (*self ^ (*self >> 32)) as i32
    }
}

impl Encoding for String {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl TableKey for String {
    fn table_hash(&self) -> i32 {
        hash_bytes(self.as_bytes())
    }
}

impl Encoding for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl TableKey for Vec<u8> {
    fn table_hash(&self) -> i32 {
        hash_bytes(self)
    }
}

impl Encoding for Bytes {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl TableKey for Bytes {
    fn table_hash(&self) -> i32 {
        hash_bytes(self)
    }
}

impl<const N: usize> Encoding for [u8; N] {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        fixed(bytes)
    }
}

impl<const N: usize> TableKey for [u8; N] {
    fn table_hash(&self) -> i32 {
        hash_bytes(self)
    }
}

#[cfg(feature = "bencode")]
pub use bencode::Bencode;

#[cfg(feature = "bencode")]
mod bencode {
    use serde::{de::DeserializeOwned, Serialize};

    use super::{hash_bytes, CodecError, Encoding, TableKey};

    /// Stores any `serde` type as its bencoded form.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Bencode<T>(pub T);

    impl<T: Serialize + DeserializeOwned> Encoding for Bencode<T> {
        fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
            buf.extend(serde_bencode::to_bytes(&self.0)?);
            Ok(())
        }

        fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
            Ok(Bencode(serde_bencode::from_bytes(bytes)?))
        }
    }

    impl<T: Serialize + DeserializeOwned + PartialEq> TableKey for Bencode<T> {
        fn table_hash(&self) -> i32 {
            // An unencodable key fails later in `encode`, its bucket doesn't matter.
            serde_bencode::to_bytes(&self.0)
                .map(|bytes| hash_bytes(&bytes))
                .unwrap_or_default()
        }
    }
}
