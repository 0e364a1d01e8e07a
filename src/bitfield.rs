//! Piece bitfield
//!
//! Fixed-length bit vector over the torrent's pieces with a cached count of
//! set bits and strict wire parsing: the serialized form is MSB-first per
//! byte and padding bits past the piece count must be zero.

use bitvec::prelude::*;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Fixed-length bit vector with an O(1) population count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
    ones: usize,
}

impl Bitfield {
    /// Create a zeroed bitfield of `len` bits.
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; len],
            ones: 0,
        }
    }

    /// Create a bitfield with every bit set.
    pub fn full(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 1; len],
            ones: len,
        }
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when the bitfield has zero bits.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.ones
    }

    /// True when every bit is set.
    pub fn is_complete(&self) -> bool {
        self.ones == self.bits.len()
    }

    /// Test bit `index`. Out-of-range reads return false.
    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Set bit `index`. Out-of-range writes are ignored.
    pub fn set(&mut self, index: usize) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            if !*bit {
                bit.set(true);
                self.ones += 1;
            }
        }
    }

    /// Clear bit `index`.
    pub fn clear(&mut self, index: usize) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            if *bit {
                bit.set(false);
                self.ones -= 1;
            }
        }
    }

    /// Set every bit.
    pub fn set_all(&mut self) {
        self.bits.fill(true);
        self.ones = self.bits.len();
    }

    /// Iterate indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Iterate indices of clear bits.
    pub fn zeros(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_zeros()
    }

    /// Wire encoding: `ceil(len/8)` bytes, MSB-first, padding bits zero.
    pub fn serialize(&self) -> Vec<u8> {
        self.bits.as_raw_slice().to_vec()
    }

    /// Parse a wire bitfield of exactly `len` bits.
    ///
    /// Fails when the byte length is not `ceil(len/8)` or any padding bit
    /// beyond `len` is set.
    pub fn parse(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(EngineError::protocol(
                ProtocolErrorKind::Violation,
                format!(
                    "bitfield length mismatch: got {} bytes, want {} for {} pieces",
                    bytes.len(),
                    expected,
                    len
                ),
            ));
        }

        let mut bits: BitVec<u8, Msb0> = BitVec::from_slice(bytes);
        for i in len..bits.len() {
            if bits[i] {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::Violation,
                    "bitfield has non-zero padding bits",
                ));
            }
        }
        bits.truncate(len);

        let ones = bits.count_ones();
        Ok(Self { bits, ones })
    }
}
