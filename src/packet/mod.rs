//! Orchestrates header + protection into full packet encode/decode (spec
//! §4.4 "Packet Encoding", §4.5 "Packet Decoding").
//!
//! `header` and `protection` each implement one half of the on-wire format;
//! everything here is the glue a real endpoint needs that neither half can
//! do alone: picking a packet-number length, sampling ciphertext for header
//! protection at the right offset, and reassembling a recovered packet
//! number before handing plaintext up to the connection.

pub mod header;
pub mod protection;
pub mod types;

pub use types::{Epoch, PacketType};

use rand::RngCore;

use crate::cid::ConnectionId;
use crate::codec::{Reader, Writer};
use crate::result::{require, Error, QuicResult};

use header::{
    decode_long_prefix, decode_short_prefix, pn_length_from_first_byte, short_key_phase_bit,
    short_spin_bit, LongHeader, ShortHeader,
};
use protection::{encode_pn_length, recover_packet_number, CryptoContext, AEAD_TAG_LEN, HP_SAMPLE_OFFSET};

const SAMPLE_LEN: usize = 16;
/// Low 4 bits of a long-header first byte carry the reserved bits and
/// pn-length, and are the only first-byte bits header protection masks
/// (spec §4.3, §6.2).
const LONG_HP_BITS: u8 = 0b0000_1111;
/// Short header protects its low 5 bits (key phase + pn-length, spec §6.2).
const SHORT_HP_BITS: u8 = 0b0001_1111;

pub struct DecodedLong {
    pub header: LongHeader,
    pub pn: u64,
    pub payload: Vec<u8>,
    /// Bytes of `buf` this packet consumed, for advancing past a coalesced
    /// packet to the next one in the same datagram (spec §4.5 step 2).
    pub consumed: usize,
}

pub struct DecodedShort {
    pub dcid: ConnectionId,
    pub spin: bool,
    pub key_phase: bool,
    pub pn: u64,
    pub payload: Vec<u8>,
}

fn apply_header_protection(
    out: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    hp_bits_mask: u8,
    mask: &[u8; 5],
) {
    out[0] ^= mask[0] & hp_bits_mask;
    for i in 0..pn_len {
        out[pn_offset + i] ^= mask[1 + i];
    }
}

fn hp_sample<'a>(buf: &'a [u8], pn_offset: usize) -> QuicResult<&'a [u8; SAMPLE_LEN]> {
    let start = pn_offset + HP_SAMPLE_OFFSET;
    let slice = buf
        .get(start..start + SAMPLE_LEN)
        .ok_or(Error::BufferTooShort)?;
    Ok(slice.try_into().expect("slice has SAMPLE_LEN bytes"))
}

/// Encodes an Initial/0-RTT/Handshake packet (anything with a `length`
/// field). `out` must be large enough for the whole datagram; returns the
/// number of bytes written (spec §4.4, steps 1-18).
pub fn encode_long(
    header: &LongHeader,
    pn: u64,
    largest_acked: Option<u64>,
    payload: &[u8],
    crypto: &CryptoContext,
    rng: &mut dyn RngCore,
    out: &mut [u8],
) -> QuicResult<usize> {
    let pn_len = encode_pn_length(pn, largest_acked);
    let (pn_offset, total_len) = {
        let mut w = Writer::new(out);
        header.encode_prefix(pn_len, payload.len() + AEAD_TAG_LEN, rng, &mut w)?;
        let pn_offset = w.pos();
        w.put_pn(pn, pn_len)?;
        let header_len = w.pos();
        w.put_bytes(payload)?;

        let mut sealed = out[header_len..header_len + payload.len()].to_vec();
        // `seal` appends the tag; it needs the header bytes as AAD, which we
        // can now read back since they were written above.
        let header_bytes = out[..header_len].to_vec();
        crypto.tx.packet.seal(pn, &header_bytes, &mut sealed)?;
        require(
            sealed.len() == payload.len() + AEAD_TAG_LEN,
            "sealed payload has unexpected length",
        )?;
        out[header_len..header_len + sealed.len()].copy_from_slice(&sealed);
        (pn_offset, header_len + sealed.len())
    };

    let sample = hp_sample(out, pn_offset)?;
    let mask = crypto.tx.header.mask(sample)?;
    apply_header_protection(out, pn_offset, pn_len, LONG_HP_BITS, &mask);
    Ok(total_len)
}

/// Encodes a 1-RTT (short-header) packet. Unlike long-header packets, a
/// short-header packet always extends to the end of the datagram (spec §4.4:
/// short-header packets are never followed by a coalesced packet).
pub fn encode_short(
    header: &ShortHeader,
    pn: u64,
    largest_acked: Option<u64>,
    payload: &[u8],
    crypto: &CryptoContext,
    out: &mut [u8],
) -> QuicResult<usize> {
    let pn_len = encode_pn_length(pn, largest_acked);
    let (pn_offset, total_len) = {
        let mut w = Writer::new(out);
        header.encode_prefix(pn_len, &mut w)?;
        let pn_offset = w.pos();
        w.put_pn(pn, pn_len)?;
        let header_len = w.pos();
        w.put_bytes(payload)?;

        let mut sealed = out[header_len..header_len + payload.len()].to_vec();
        let header_bytes = out[..header_len].to_vec();
        crypto.tx.packet.seal(pn, &header_bytes, &mut sealed)?;
        out[header_len..header_len + sealed.len()].copy_from_slice(&sealed);
        (pn_offset, header_len + sealed.len())
    };

    let sample = hp_sample(out, pn_offset)?;
    let mask = crypto.tx.header.mask(sample)?;
    apply_header_protection(out, pn_offset, pn_len, SHORT_HP_BITS, &mask);
    Ok(total_len)
}

/// Decodes one long-header packet starting at `buf[0]`, removing header
/// protection and opening the AEAD payload in place (spec §4.5 steps 5-9).
/// `largest_acked` seeds packet-number reconstruction (spec §4.3, §8 R3).
pub fn decode_long(
    buf: &mut [u8],
    crypto: &CryptoContext,
    largest_acked: Option<u64>,
) -> QuicResult<DecodedLong> {
    let (prefix, pn_offset, ciphertext_end) = {
        let mut r = Reader::new(buf);
        let prefix = decode_long_prefix(&mut r)?;
        let pn_offset = r.pos();
        let length = prefix
            .length
            .ok_or(Error::ProtocolViolation("long header missing length"))?
            .usize()?;
        (prefix, pn_offset, pn_offset + length)
    };
    require(ciphertext_end <= buf.len(), "packet length exceeds datagram")?;

    let sample = hp_sample(buf, pn_offset)?;
    let mask = crypto.rx.header.mask(sample)?;
    buf[0] ^= mask[0] & LONG_HP_BITS;
    let pn_len = pn_length_from_first_byte(buf[0]);
    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];
    }

    let mut truncated = 0u64;
    for i in 0..pn_len {
        truncated = (truncated << 8) | buf[pn_offset + i] as u64;
    }
    let expected = largest_acked.map_or(0, |la| la + 1);
    let pn = recover_packet_number(truncated, pn_len, expected);

    let header_len = pn_offset + pn_len;
    let header_bytes = buf[..header_len].to_vec();
    let plaintext = crypto
        .rx
        .packet
        .open(pn, &header_bytes, &mut buf[header_len..ciphertext_end])?
        .to_vec();

    Ok(DecodedLong {
        header: prefix.header,
        pn,
        payload: plaintext,
        consumed: ciphertext_end,
    })
}

/// Decodes a short-header packet occupying the rest of `buf` (spec §4.5).
/// The caller picks which [`CryptoContext`] to try based on the unmasked
/// key-phase bit relative to its own bookkeeping (spec §4.10); this function
/// reports the bit back but does not interpret it.
pub fn decode_short(
    buf: &mut [u8],
    dcid_len: usize,
    crypto: &CryptoContext,
    largest_acked: Option<u64>,
) -> QuicResult<DecodedShort> {
    let pn_offset = {
        let mut r = Reader::new(buf);
        let _ = decode_short_prefix(&mut r, dcid_len)?;
        r.pos()
    };

    let sample = hp_sample(buf, pn_offset)?;
    let mask = crypto.rx.header.mask(sample)?;
    buf[0] ^= mask[0] & SHORT_HP_BITS;
    let pn_len = pn_length_from_first_byte(buf[0]);
    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];
    }

    let mut truncated = 0u64;
    for i in 0..pn_len {
        truncated = (truncated << 8) | buf[pn_offset + i] as u64;
    }
    let expected = largest_acked.map_or(0, |la| la + 1);
    let pn = recover_packet_number(truncated, pn_len, expected);

    let spin = short_spin_bit(buf[0]);
    let key_phase = short_key_phase_bit(buf[0]);
    let header_len = pn_offset + pn_len;
    let header_bytes = buf[..header_len].to_vec();
    let dcid = ConnectionId::new(buf[1..1 + dcid_len].to_vec())?;
    let plaintext = crypto
        .rx
        .packet
        .open(pn, &header_bytes, &mut buf[header_len..])?
        .to_vec();

    Ok(DecodedShort {
        dcid,
        spin,
        key_phase,
        pn,
        payload: plaintext,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::header::{LongHeader, ShortHeader};
    use crate::packet::protection::derive_initial_secrets;
    use crate::packet::types::PacketType;

    fn cid(b: &[u8]) -> ConnectionId {
        ConnectionId::new(b.to_vec()).unwrap()
    }

    #[test]
    fn long_header_initial_round_trips_through_protection() {
        let dcid_bytes = [0x83u8, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let (client, server) = derive_initial_secrets(&dcid_bytes).unwrap();

        let header = LongHeader {
            ty: PacketType::Initial,
            version: 0xff00_0016,
            dcid: cid(&dcid_bytes),
            scid: cid(&[1, 2, 3, 4]),
            token: Vec::new(),
            odcid: None,
        };
        let payload = vec![0x42u8; 20];
        let mut out = [0u8; 256];
        let mut rng = rand::thread_rng();
        let written = encode_long(&header, 2, None, &payload, &client, &mut rng, &mut out).unwrap();

        let decoded = decode_long(&mut out[..written], &server, None).unwrap();
        assert_eq!(decoded.pn, 2);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.header.dcid, header.dcid);
        assert_eq!(decoded.consumed, written);
    }

    #[test]
    fn short_header_round_trips_through_protection() {
        let dcid_bytes = [9u8; 8];
        let (client, server) = derive_initial_secrets(&dcid_bytes).unwrap();
        let header = ShortHeader {
            dcid: cid(&dcid_bytes),
            spin: true,
            key_phase: false,
        };
        let payload = vec![1u8, 2, 3, 4, 5];
        let mut out = [0u8; 128];
        let written = encode_short(&header, 7, Some(5), &payload, &client, &mut out).unwrap();

        let decoded = decode_short(&mut out[..written], dcid_bytes.len(), &server, Some(5)).unwrap();
        assert_eq!(decoded.pn, 7);
        assert_eq!(decoded.payload, payload);
        assert!(decoded.spin);
        assert!(!decoded.key_phase);
    }
}
