//! Compact voter bitmap over a committee.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("index {0} out of range for committee of size {1}")]
    IndexOutOfRange(usize, usize),
    #[error("invalid bit character {0:?}")]
    InvalidCharacter(char),
}

/// Bitmap over the committee (size n) indicating which signers contributed to
/// an aggregate.
///
/// The canonical wire form is the string encoding, index 0 first: a committee
/// of four with signers {0, 2, 3} renders as `"1011"`.
#[derive(Clone, PartialEq, Eq)]
pub struct SignerBitfield {
    bits: Vec<u8>,
    len: usize,
}

impl SignerBitfield {
    /// Create an empty bitfield for a committee of `n`.
    pub fn new(n: usize) -> Self {
        Self {
            bits: vec![0u8; n.div_ceil(8)],
            len: n,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.len {
            return Err(BitfieldError::IndexOutOfRange(index, self.len));
        }
        self.bits[index / 8] |= 1 << (index % 8);
        Ok(())
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of set bits in ascending order.
    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.get(*i))
    }

    /// Canonical string encoding, index 0 first.
    pub fn encode(&self) -> String {
        (0..self.len)
            .map(|i| if self.get(i) { '1' } else { '0' })
            .collect()
    }

    pub fn decode(s: &str) -> Result<Self, BitfieldError> {
        let mut out = Self::new(s.len());
        for (i, c) in s.chars().enumerate() {
            match c {
                '1' => out.set(i)?,
                '0' => {}
                other => return Err(BitfieldError::InvalidCharacter(other)),
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for SignerBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerBitfield({})", self.encode())
    }
}

impl fmt::Display for SignerBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for SignerBitfield {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for SignerBitfield {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SignerBitfield::decode(&s).map_err(serde::de::Error::custom)
    }
}
