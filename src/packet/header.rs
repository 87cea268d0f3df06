//! Long- and short-header encode/decode (spec §4.4, §4.5, §6.2).
//!
//! Header parsing happens in two stages because the low bits of the first
//! byte and the packet-number field are still masked by header protection
//! when a header is first read off the wire (spec §4.3). `decode_long_prefix`
//! / `decode_short_prefix` parse everything that is sent in the clear and
//! leave the reader positioned at the (still masked) packet-number field;
//! the caller removes header protection and finishes decoding from there
//! (see [`crate::packet::rx`]).

use rand::RngCore;

use crate::cid::ConnectionId;
use crate::codec::{Reader, Writer};
use crate::result::{require, Error, QuicResult};
use crate::varint::VarInt;

use super::types::PacketType;

const FORM_LONG: u8 = 0b1000_0000;
const FIXED_BIT: u8 = 0b0100_0000;

#[derive(Debug, Clone)]
pub struct LongHeader {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    /// Initial: client's retry token (empty unless retrying); Retry: the
    /// opaque client-visible token.
    pub token: Vec<u8>,
    /// Retry only: the original destination CID the client first used.
    pub odcid: Option<ConnectionId>,
}

impl LongHeader {
    /// Encodes everything up to (not including) the packet-number field.
    /// `length_after_pn` is the length, in bytes, of the payload + AEAD tag
    /// that will follow the packet number (spec §4.4 step 16: length field
    /// covers "encoded packet-number bytes + payload + AEAD tag").
    pub fn encode_prefix(
        &self,
        pn_len: usize,
        length_after_pn: usize,
        rng: &mut dyn RngCore,
        w: &mut Writer,
    ) -> QuicResult<()> {
        let mut first = FORM_LONG | FIXED_BIT | (self.ty.type_bits() << 4);
        if matches!(self.ty, PacketType::Retry) {
            // Retry randomizes the low 4 bits (spec §4.4 step 2).
            first |= (rng.next_u32() & 0x0f) as u8;
        } else {
            require((1..=4).contains(&pn_len), "packet number length out of range")?;
            first |= (pn_len as u8 - 1) & 0b11;
        }
        w.put_u8(first)?;
        w.put_u32(self.version)?;
        w.put_u8(self.dcid.len() as u8)?;
        w.put_bytes(self.dcid.as_slice())?;
        w.put_u8(self.scid.len() as u8)?;
        w.put_bytes(self.scid.as_slice())?;

        match self.ty {
            PacketType::Retry => {
                let odcid = self
                    .odcid
                    .as_ref()
                    .ok_or(Error::FrameEncoding("retry header missing odcid"))?;
                w.put_u8(odcid.len() as u8)?;
                w.put_bytes(odcid.as_slice())?;
                w.put_bytes(&self.token)?;
            }
            PacketType::Initial => {
                w.put_varint(VarInt::try_from(self.token.len())?)?;
                w.put_bytes(&self.token)?;
                w.put_varint(VarInt::try_from(length_after_pn + pn_len)?)?;
            }
            PacketType::ZeroRtt | PacketType::Handshake => {
                w.put_varint(VarInt::try_from(length_after_pn + pn_len)?)?;
            }
        }
        Ok(())
    }
}

/// Result of parsing the unprotected prefix of a long header. `first_byte`
/// is returned raw (its low 4 bits are still masked); `length` is the
/// decoded payload length for non-Retry types.
pub struct LongHeaderPrefix {
    pub first_byte: u8,
    pub header: LongHeader,
    pub length: Option<VarInt>,
}

pub fn decode_long_prefix(r: &mut Reader) -> QuicResult<LongHeaderPrefix> {
    let first_byte = r.get_u8()?;
    require(first_byte & FORM_LONG != 0, "expected long-header form bit")?;
    let type_bits = (first_byte >> 4) & 0b11;
    let ty = PacketType::from_type_bits(type_bits).ok_or(Error::UnknownPacketType)?;

    let version = r.get_u32()?;

    let dcid_len = r.get_u8()? as usize;
    let dcid = ConnectionId::new(r.get_bytes(dcid_len)?.to_vec())?;
    let scid_len = r.get_u8()? as usize;
    let scid = ConnectionId::new(r.get_bytes(scid_len)?.to_vec())?;

    let (token, odcid, length) = match ty {
        PacketType::Retry => {
            let odcid_len = r.get_u8()? as usize;
            let odcid = ConnectionId::new(r.get_bytes(odcid_len)?.to_vec())?;
            let token = r.get_rest().to_vec();
            (token, Some(odcid), None)
        }
        PacketType::Initial => {
            let token_len = r.get_varint()?.usize()?;
            let token = r.get_bytes(token_len)?.to_vec();
            let length = r.get_varint()?;
            (token, None, Some(length))
        }
        PacketType::ZeroRtt | PacketType::Handshake => {
            let length = r.get_varint()?;
            (Vec::new(), None, Some(length))
        }
    };

    Ok(LongHeaderPrefix {
        first_byte,
        header: LongHeader {
            ty,
            version,
            dcid,
            scid,
            token,
            odcid,
        },
        length,
    })
}

/// The version-independent prefix of a long header (RFC 8999): first byte,
/// version, dcid, scid. Safe to read even when `version` turns out to be
/// one this crate doesn't speak, since only these fields are guaranteed
/// stable across QUIC versions.
pub struct InvariantPrefix {
    pub first_byte: u8,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
}

pub fn decode_invariant_prefix(r: &mut Reader) -> QuicResult<InvariantPrefix> {
    let first_byte = r.get_u8()?;
    require(first_byte & FORM_LONG != 0, "expected long-header form bit")?;
    let version = r.get_u32()?;
    let dcid_len = r.get_u8()? as usize;
    let dcid = ConnectionId::new(r.get_bytes(dcid_len)?.to_vec())?;
    let scid_len = r.get_u8()? as usize;
    let scid = ConnectionId::new(r.get_bytes(scid_len)?.to_vec())?;
    Ok(InvariantPrefix {
        first_byte,
        version,
        dcid,
        scid,
    })
}

/// A Version Negotiation packet: reuses the long-header CID layout but is
/// never packet-protected (spec §4.5 step 4, §6.2).
pub struct VersionNegotiationPacket {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub versions: Vec<u32>,
}

impl VersionNegotiationPacket {
    pub fn encode(&self, rng: &mut dyn RngCore, w: &mut Writer) -> QuicResult<()> {
        let first = FORM_LONG | (rng.next_u32() & 0x7f) as u8;
        w.put_u8(first)?;
        w.put_u32(0)?; // version 0 identifies Version Negotiation
        w.put_u8(self.dcid.len() as u8)?;
        w.put_bytes(self.dcid.as_slice())?;
        w.put_u8(self.scid.len() as u8)?;
        w.put_bytes(self.scid.as_slice())?;
        for v in &self.versions {
            w.put_u32(*v)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader) -> QuicResult<Self> {
        let first_byte = r.get_u8()?;
        require(first_byte & FORM_LONG != 0, "expected long-header form bit")?;
        let version = r.get_u32()?;
        require(version == 0, "not a version negotiation packet")?;
        let dcid_len = r.get_u8()? as usize;
        let dcid = ConnectionId::new(r.get_bytes(dcid_len)?.to_vec())?;
        let scid_len = r.get_u8()? as usize;
        let scid = ConnectionId::new(r.get_bytes(scid_len)?.to_vec())?;
        let mut versions = Vec::new();
        while !r.is_empty() {
            versions.push(r.get_u32()?);
        }
        Ok(Self {
            dcid,
            scid,
            versions,
        })
    }
}

pub struct ShortHeader {
    pub dcid: ConnectionId,
    pub spin: bool,
    pub key_phase: bool,
}

const SHORT_FORM_SHORT: u8 = 0b0000_0000;
const SHORT_SPIN_BIT: u8 = 0b0010_0000;
const SHORT_KEY_PHASE_BIT: u8 = 0b0000_0100;

impl ShortHeader {
    pub fn encode_prefix(&self, pn_len: usize, w: &mut Writer) -> QuicResult<()> {
        require((1..=4).contains(&pn_len), "packet number length out of range")?;
        let mut first = SHORT_FORM_SHORT | FIXED_BIT;
        if self.spin {
            first |= SHORT_SPIN_BIT;
        }
        if self.key_phase {
            first |= SHORT_KEY_PHASE_BIT;
        }
        first |= (pn_len as u8 - 1) & 0b11;
        w.put_u8(first)?;
        w.put_bytes(self.dcid.as_slice())?;
        Ok(())
    }
}

pub struct ShortHeaderPrefix {
    pub first_byte: u8,
    pub dcid: ConnectionId,
}

pub fn decode_short_prefix(r: &mut Reader, dcid_len: usize) -> QuicResult<ShortHeaderPrefix> {
    let first_byte = r.get_u8()?;
    require(first_byte & FORM_LONG == 0, "expected short-header form bit")?;
    let dcid = ConnectionId::new(r.get_bytes(dcid_len)?.to_vec())?;
    Ok(ShortHeaderPrefix { first_byte, dcid })
}

/// Reads the spin bit from an already-unmasked short-header first byte.
pub fn short_spin_bit(first_byte: u8) -> bool {
    first_byte & SHORT_SPIN_BIT != 0
}

/// Reads the key-phase bit from an already-unmasked short-header first byte.
pub fn short_key_phase_bit(first_byte: u8) -> bool {
    first_byte & SHORT_KEY_PHASE_BIT != 0
}

/// Decodes the packet-number length from an already-unmasked first byte.
pub fn pn_length_from_first_byte(first_byte: u8) -> usize {
    (first_byte & 0b11) as usize + 1
}

/// A version is "reserved" (grease) when `v & 0x0f0f0f0f == 0x0a0a0a0a`
/// (spec §6.2).
pub fn is_reserved_version(v: u32) -> bool {
    v & 0x0f0f_0f0f == 0x0a0a_0a0a
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::types::PacketType;

    fn cid(b: &[u8]) -> ConnectionId {
        ConnectionId::new(b.to_vec()).unwrap()
    }

    #[test]
    fn long_header_round_trips_through_clear_fields() {
        let header = LongHeader {
            ty: PacketType::Initial,
            version: 0xff00_0016,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: cid(&[9, 9, 9, 9]),
            token: vec![0xaa, 0xbb],
            odcid: None,
        };
        let mut buf = [0u8; 128];
        let mut w = Writer::new(&mut buf);
        let mut rng = rand::thread_rng();
        header.encode_prefix(2, 100, &mut rng, &mut w).unwrap();
        let encoded_len = w.pos();

        let mut r = Reader::new(&buf[..encoded_len]);
        let prefix = decode_long_prefix(&mut r).unwrap();
        assert_eq!(prefix.header.version, header.version);
        assert_eq!(prefix.header.dcid, header.dcid);
        assert_eq!(prefix.header.scid, header.scid);
        assert_eq!(prefix.header.token, header.token);
        assert_eq!(prefix.length.unwrap().into_inner(), 102);
        assert_eq!(pn_length_from_first_byte(prefix.first_byte), 2);
    }

    #[test]
    fn retry_header_carries_odcid_and_token() {
        let header = LongHeader {
            ty: PacketType::Retry,
            version: 0xff00_0016,
            dcid: cid(&[1; 8]),
            scid: cid(&[2; 8]),
            token: vec![1, 2, 3, 4],
            odcid: Some(cid(&[9; 8])),
        };
        let mut buf = [0u8; 128];
        let mut w = Writer::new(&mut buf);
        let mut rng = rand::thread_rng();
        header.encode_prefix(0, 0, &mut rng, &mut w).unwrap();
        let mut r = Reader::new(&buf[..w.pos()]);
        let prefix = decode_long_prefix(&mut r).unwrap();
        assert_eq!(prefix.header.odcid, header.odcid);
        assert_eq!(prefix.header.token, header.token);
        assert!(prefix.length.is_none());
    }

    #[test]
    fn reserved_version_detection() {
        assert!(is_reserved_version(0x0a0a_0a0a));
        assert!(is_reserved_version(0x1a2a_3a4a));
        assert!(!is_reserved_version(0xff00_0016));
    }

    #[test]
    fn invariant_prefix_reads_an_unsupported_version_header() {
        let header = LongHeader {
            ty: PacketType::Initial,
            version: 0xaaaa_aaaa, // not a version this crate speaks
            dcid: cid(&[1, 2, 3, 4]),
            scid: cid(&[5, 6, 7, 8]),
            token: Vec::new(),
            odcid: None,
        };
        let mut buf = [0u8; 128];
        let mut w = Writer::new(&mut buf);
        let mut rng = rand::thread_rng();
        header.encode_prefix(1, 0, &mut rng, &mut w).unwrap();
        let mut r = Reader::new(&buf[..w.pos()]);
        let prefix = decode_invariant_prefix(&mut r).unwrap();
        assert_eq!(prefix.version, header.version);
        assert_eq!(prefix.dcid, header.dcid);
        assert_eq!(prefix.scid, header.scid);
    }
}
