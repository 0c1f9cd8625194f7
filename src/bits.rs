//! Arbitrary-width bit sequences.  Every value shifted through the scan chain is built
//! up as a `BitBuffer` before being handed to the cable, so the wire encoding is exact
//! regardless of the platform integer width.  Bit 0 is the first bit transmitted on TDI
//! and the first bit captured from TDO.
use bitvec::prelude::*;

/// A sequence of bits of arbitrary length.
///
/// The printed form (`bit_str`) is the conventional binary rendering of the value,
/// most-significant bit first, so the last-transmitted bit is leftmost.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitBuffer {
    bits: BitVec<u8, Lsb0>,
}

impl BitBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer of `len` zero bits
    pub fn zeros(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// Create a buffer of `len` one bits
    pub fn ones(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(true, len),
        }
    }

    /// Create a buffer of `len` random bits
    pub fn random(len: usize) -> Self {
        let mut bits = BitVec::with_capacity(len);
        for _ in 0..len {
            bits.push(fastrand::bool());
        }
        Self { bits }
    }

    /// Create a buffer of `len` bits from the low bits of `value`.  Bits of `value`
    /// beyond `len` are discarded.
    pub fn from_val(value: u64, len: usize) -> Self {
        let mut bits = BitVec::with_capacity(len);
        for i in 0..len {
            bits.push(i < 64 && (value >> i) & 1 == 1);
        }
        Self { bits }
    }

    /// Create a buffer from a string of `0` and `1` characters, most-significant
    /// (last-transmitted) bit first, the same order as `bit_str` prints.
    pub fn from_bit_str(s: &str) -> Self {
        let mut bits = BitVec::with_capacity(s.len());
        for c in s.chars().rev() {
            bits.push(c == '1');
        }
        Self { bits }
    }

    /// Create a buffer of `len` bits from little-endian packed bytes: byte 0 holds
    /// bits 0 through 7.  Missing bytes read as zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = BitVec::with_capacity(len);
        for i in 0..len {
            let byte = bytes.get(i / 8).copied().unwrap_or(0);
            bits.push((byte >> (i % 8)) & 1 == 1);
        }
        Self { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Prepend `other` as the first-transmitted bits.  The printed form of the result
    /// is `self.bit_str() + other.bit_str()`.
    pub fn head(&mut self, other: &BitBuffer) -> &mut Self {
        let mut bits = other.bits.clone();
        bits.extend_from_bitslice(&self.bits);
        self.bits = bits;
        self
    }

    /// Append `other` as the last-transmitted bits.  The printed form of the result
    /// is `other.bit_str() + self.bit_str()`.
    pub fn tail(&mut self, other: &BitBuffer) -> &mut Self {
        self.bits.extend_from_bitslice(&other.bits);
        self
    }

    /// Remove the `n` first-transmitted bits.  Shrinks to empty past the length.
    pub fn drop_head(&mut self, n: usize) -> &mut Self {
        self.bits.drain(..n.min(self.bits.len()));
        self
    }

    /// Remove the `n` last-transmitted bits.  Shrinks to empty past the length.
    pub fn drop_tail(&mut self, n: usize) -> &mut Self {
        let len = self.bits.len().saturating_sub(n);
        self.bits.truncate(len);
        self
    }

    /// Split into fields of the given widths, popped from the first-transmitted end,
    /// so the most-significant width comes last.  Fields past the end of the buffer
    /// come back short or empty.
    pub fn split(&self, widths: &[usize]) -> Vec<BitBuffer> {
        let mut fields = Vec::with_capacity(widths.len());
        let mut offset = 0;
        for &width in widths {
            let end = (offset + width).min(self.bits.len());
            let start = offset.min(self.bits.len());
            fields.push(Self {
                bits: self.bits[start..end].to_bitvec(),
            });
            offset += width;
        }
        fields
    }

    /// Pack into little-endian bytes, byte 0 = bits 0..7.  A final partial byte is
    /// zero-padded.
    pub fn get_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    /// The value of the low (first-transmitted) 64 bits
    pub fn to_u64(&self) -> u64 {
        let mut val = 0;
        for (i, bit) in self.bits.iter().enumerate().take(64) {
            if *bit {
                val |= 1 << i;
            }
        }
        val
    }

    /// The number of one bits in the buffer
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    /// The index of the first-transmitted one bit, if any
    pub fn first_one(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn bit(&self, i: usize) -> bool {
        self.bits.get(i).map(|b| *b).unwrap_or(false)
    }

    /// Render as a binary string, most-significant (last-transmitted) bit first
    pub fn bit_str(&self) -> String {
        self.bits
            .iter()
            .rev()
            .map(|b| if *b { '1' } else { '0' })
            .collect()
    }
}

impl core::fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BitBuffer[{}]({})", self.len(), self.bit_str())
    }
}
