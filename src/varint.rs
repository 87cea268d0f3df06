//! IETF QUIC variable-length integer (spec §4.2, §8 R1).
//!
//! Heavily inspired by quinn's `VarInt`: a 62-bit value whose wire length
//! (1/2/4/8 bytes) is selected by the top two bits of the first byte.

use crate::result::{Error, QuicResult};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    pub const MAX: Self = Self((1 << 62) - 1);

    #[inline(always)]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    #[inline(always)]
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn new_u64(value: u64) -> QuicResult<Self> {
        if value <= Self::MAX.0 {
            Ok(Self(value))
        } else {
            Err(Error::InvalidVarint)
        }
    }

    #[inline(always)]
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub fn usize(self) -> QuicResult<usize> {
        usize::try_from(self.0).map_err(|_| Error::InvalidVarint)
    }

    /// Wire length in bytes: 1, 2, 4, or 8.
    pub fn size(self) -> usize {
        if self.0 < (1 << 6) {
            1
        } else if self.0 < (1 << 14) {
            2
        } else if self.0 < (1 << 30) {
            4
        } else {
            8
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.size();
        let mut buf = Vec::with_capacity(size);
        let prefix: u8 = match size {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            8 => 0b11,
            _ => unreachable!(),
        };
        buf.push((prefix << 6) | ((self.0 >> (8 * (size - 1))) & 0x3f) as u8);
        for i in (0..size - 1).rev() {
            buf.push(((self.0 >> (8 * i)) & 0xff) as u8);
        }
        buf
    }
}

impl Default for VarInt {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> Self {
        Self::from_u32(v)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = Error;
    fn try_from(v: u64) -> QuicResult<Self> {
        Self::new_u64(v)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = Error;
    fn try_from(v: usize) -> QuicResult<Self> {
        Self::new_u64(v as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{Reader, Writer};

    fn round_trip(v: u64) {
        let vi = VarInt::new_u64(v).unwrap();
        let encoded = vi.encode();
        let mut buf = vec![0u8; encoded.len()];
        let mut w = Writer::new(&mut buf);
        w.put_varint(vi).unwrap();
        assert_eq!(buf, encoded);

        let mut r = Reader::new(&encoded);
        let decoded = r.get_varint().unwrap();
        assert_eq!(decoded, vi);
    }

    #[test]
    fn round_trips_boundary_values() {
        for v in [
            0,
            1,
            63,
            64,
            16_383,
            16_384,
            357_913_941,
            1 << 30,
            (1 << 30) - 1,
            1_537_228_672_809_129_301,
            VarInt::MAX.into_inner(),
        ] {
            round_trip(v);
        }
    }

    #[test]
    fn rejects_values_above_max() {
        assert!(VarInt::new_u64(1 << 62).is_err());
        assert!(VarInt::new_u64(u64::MAX).is_err());
    }

    #[test]
    fn exact_encodings_match_spec_examples() {
        assert_eq!(VarInt::from_u32(63).encode(), vec![0b00_111111]);
        assert_eq!(
            VarInt::new_u64(16_383).unwrap().encode(),
            vec![0b01_111111, 0b11_111111]
        );
    }
}
