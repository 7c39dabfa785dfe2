use bitvec::order::Msb0;
use bitvec::vec::BitVec;

use crate::error::{Error, Result};

type Bits = BitVec<u8, Msb0>;

/// A finite bitmap over `[0, len)` with two concrete representations: a
/// `Complete` set (every bit implicitly set, no backing storage) and a
/// `Partial` set (an explicit bitvec plus a running popcount). `set_bit`
/// promotes `Partial` to `Complete` the moment it fills; `clear_bit`
/// demotes `Complete` back to `Partial`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FiniteBitSet {
    Complete { len: u32 },
    Partial { len: u32, bits: Bits, set_count: u32 },
}

impl FiniteBitSet {
    pub fn empty(len: u32) -> Self {
        if len == 0 {
            FiniteBitSet::Complete { len: 0 }
        } else {
            FiniteBitSet::Partial {
                len,
                bits: Bits::repeat(false, len as usize),
                set_count: 0,
            }
        }
    }

    pub fn complete(len: u32) -> Self {
        FiniteBitSet::Complete { len }
    }

    pub fn len(&self) -> u32 {
        match self {
            FiniteBitSet::Complete { len } => *len,
            FiniteBitSet::Partial { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, FiniteBitSet::Complete { .. })
    }

    pub fn set_count(&self) -> u32 {
        match self {
            FiniteBitSet::Complete { len } => *len,
            FiniteBitSet::Partial { set_count, .. } => *set_count,
        }
    }

    pub fn is_set(&self, index: u32) -> bool {
        match self {
            FiniteBitSet::Complete { len } => index < *len,
            FiniteBitSet::Partial { len, bits, .. } => index < *len && bits[index as usize],
        }
    }

    /// Sets a bit, returning whether it was newly set. A no-op (returns
    /// `false`) if `index` is out of range or already set.
    pub fn set_bit(&mut self, index: u32) -> bool {
        match self {
            FiniteBitSet::Complete { .. } => false,
            FiniteBitSet::Partial {
                len,
                bits,
                set_count,
            } => {
                if index >= *len {
                    return false;
                }
                if bits[index as usize] {
                    return false;
                }
                bits.set(index as usize, true);
                *set_count += 1;
                if *set_count == *len {
                    let len = *len;
                    *self = FiniteBitSet::Complete { len };
                }
                true
            }
        }
    }

    /// Clears a bit, returning whether it was previously set.
    pub fn clear_bit(&mut self, index: u32) -> bool {
        match self {
            FiniteBitSet::Complete { len } => {
                if index >= *len {
                    return false;
                }
                let len = *len;
                let mut bits = Bits::repeat(true, len as usize);
                bits.set(index as usize, false);
                *self = FiniteBitSet::Partial {
                    len,
                    bits,
                    set_count: len - 1,
                };
                true
            }
            FiniteBitSet::Partial {
                bits, set_count, ..
            } => {
                if !bits[index as usize] {
                    return false;
                }
                bits.set(index as usize, false);
                *set_count -= 1;
                true
            }
        }
    }

    /// Smallest set index `>= from`, or `None` (the spec's `-1`) if none.
    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        match self {
            FiniteBitSet::Complete { len } => (from < *len).then_some(from),
            FiniteBitSet::Partial { len, bits, .. } => {
                if from >= *len {
                    return None;
                }
                bits[from as usize..]
                    .first_one()
                    .map(|offset| from + offset as u32)
            }
        }
    }

    /// Union merge in place; the wider of the two operands wins.
    pub fn merge(&mut self, other: &FiniteBitSet) {
        debug_assert_eq!(self.len(), other.len(), "merging bitsets of different length");
        if self.is_complete() || other.is_complete() {
            let len = self.len();
            *self = FiniteBitSet::Complete { len };
            return;
        }
        if let (
            FiniteBitSet::Partial { bits, set_count, .. },
            FiniteBitSet::Partial { bits: other_bits, .. },
        ) = (&mut *self, other)
        {
            *bits |= other_bits.clone();
            *set_count = bits.count_ones() as u32;
            if *set_count == bits.len() as u32 {
                let len = self.len();
                *self = FiniteBitSet::Complete { len };
            }
        }
    }

    /// Packs as `[version: u32][len: u32][packed bytes]`, the on-disk
    /// `<archivePath>.bits` layout from §6.
    pub fn encode(&self) -> Vec<u8> {
        const VERSION: u32 = 1;
        let len = self.len();
        let mut out = Vec::with_capacity(8 + len.div_ceil(8) as usize);
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        match self {
            FiniteBitSet::Complete { .. } => out.extend(std::iter::repeat_n(0xFFu8, len.div_ceil(8) as usize)),
            FiniteBitSet::Partial { bits, .. } => out.extend_from_slice(bits.as_raw_slice()),
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::MalformedBitset("truncated header".into()));
        }
        let version = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if version != 1 {
            return Err(Error::MalformedBitset(format!("unsupported version {version}")));
        }
        let len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let expected_bytes = len.div_ceil(8) as usize;
        let packed = &buf[8..];
        if packed.len() < expected_bytes {
            return Err(Error::MalformedBitset("truncated body".into()));
        }
        let mut bits = Bits::from_slice(&packed[..expected_bytes]);
        bits.truncate(len as usize);
        let set_count = bits.count_ones() as u32;
        if set_count == len {
            Ok(FiniteBitSet::Complete { len })
        } else {
            Ok(FiniteBitSet::Partial {
                len,
                bits,
                set_count,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_to_complete_on_last_bit() {
        let mut bs = FiniteBitSet::empty(3);
        assert!(bs.set_bit(0));
        assert!(bs.set_bit(1));
        assert!(!bs.is_complete());
        assert!(bs.set_bit(2));
        assert!(bs.is_complete());
        assert_eq!(bs.next_set_bit(0), Some(0));
        assert_eq!(bs.next_set_bit(1), Some(1));
        assert_eq!(bs.next_set_bit(3), None);
    }

    #[test]
    fn demotes_on_clear() {
        let mut bs = FiniteBitSet::complete(4);
        assert!(bs.clear_bit(1));
        assert!(!bs.is_complete());
        assert_eq!(bs.set_count(), 3);
        assert!(bs.is_set(0));
        assert!(!bs.is_set(1));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut bs = FiniteBitSet::empty(10);
        bs.set_bit(2);
        bs.set_bit(7);
        let encoded = bs.encode();
        let decoded = FiniteBitSet::decode(&encoded).unwrap();
        assert_eq!(bs, decoded);

        let complete = FiniteBitSet::complete(5);
        let decoded = FiniteBitSet::decode(&complete.encode()).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.len(), 5);
    }

    #[test]
    fn merge_is_union() {
        let mut a = FiniteBitSet::empty(4);
        a.set_bit(0);
        let mut b = FiniteBitSet::empty(4);
        b.set_bit(1);
        a.merge(&b);
        assert!(a.is_set(0));
        assert!(a.is_set(1));
        assert!(!a.is_set(2));
    }
}
