//! Packet protection: AEAD + header protection (spec §4.3).
//!
//! Initial keys are derived from a version-specific salt and the client's
//! destination CID via HKDF; Handshake/0-RTT/1-RTT keys arrive from the TLS
//! callback `update_traffic_key` (see [`crate::tls`]). All secret-derivation
//! and sealing/opening goes through `ring`, the same crate
//! `hendrikcech-quiche` links for its AEAD and HP contexts.

use ring::aead::quic as ring_quic;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf::{Prk, Salt, HKDF_SHA256};

use crate::result::{Error, QuicResult};

/// The salt used to derive Initial secrets for this implementation's draft
/// version (spec §4.3 "Initial keys are derived from a version-specific
/// salt"). A production endpoint keys this off the negotiated version; we
/// support a single draft-22-era salt plus the private version sharing it.
const INITIAL_SALT: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63, 0x65,
    0xbe, 0xf9, 0xf5, 0x02,
];

pub const AEAD_TAG_LEN: usize = 16;
const SAMPLE_LEN: usize = 16;
/// Offset of the HP sample from the start of the (encrypted) packet number
/// field (spec §4.3: "sample 16 bytes at `pkt_nr_pos + 4`").
pub const HP_SAMPLE_OFFSET: usize = 4;

/// HKDF-Expand-Label, RFC 8446 §7.1, with an empty context -- the form every
/// QUIC key derivation in this crate uses.
fn hkdf_expand_label(secret: &[u8], label: &str, out_len: usize) -> QuicResult<Vec<u8>> {
    let prk = Prk::new_less_safe(HKDF_SHA256, secret);
    let full_label = format!("tls13 {label}");
    let mut hkdf_label = Vec::with_capacity(3 + full_label.len());
    hkdf_label.push((out_len >> 8) as u8);
    hkdf_label.push(out_len as u8);
    hkdf_label.push(full_label.len() as u8);
    hkdf_label.extend_from_slice(full_label.as_bytes());
    hkdf_label.push(0); // zero-length context

    struct Len(usize);
    impl ring::hkdf::KeyType for Len {
        fn len(&self) -> usize {
            self.0
        }
    }

    let okm = prk
        .expand(&[&hkdf_label], Len(out_len))
        .map_err(|_| Error::CryptoFail)?;
    let mut out = vec![0u8; out_len];
    okm.fill(&mut out).map_err(|_| Error::CryptoFail)?;
    Ok(out)
}

/// AEAD algorithm + header-protection algorithm pairing negotiated by TLS.
#[derive(Clone, Copy)]
pub enum CipherSuite {
    Aes128Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    fn aead_algorithm(self) -> &'static aead::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &aead::AES_128_GCM,
            CipherSuite::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn hp_algorithm(self) -> &'static ring_quic::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &ring_quic::AES_128,
            CipherSuite::ChaCha20Poly1305 => &ring_quic::CHACHA20,
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::ChaCha20Poly1305 => 32,
        }
    }
}

pub struct PacketProtectionKey {
    key: LessSafeKey,
    iv: [u8; 12],
}

impl PacketProtectionKey {
    fn new(suite: CipherSuite, key_bytes: &[u8], iv: [u8; 12]) -> QuicResult<Self> {
        let unbound =
            UnboundKey::new(suite.aead_algorithm(), key_bytes).map_err(|_| Error::CryptoFail)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            iv,
        })
    }

    fn nonce_for(&self, pn: u64) -> Nonce {
        let mut nonce = self.iv;
        let pn_bytes = pn.to_be_bytes();
        for i in 0..8 {
            nonce[4 + i] ^= pn_bytes[i];
        }
        Nonce::assume_unique_for_key(nonce)
    }

    /// Seals `payload` in place, appending the 16-byte AEAD tag, with `header`
    /// as associated data (spec §4.3: "the header ... is the AAD").
    pub fn seal(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> QuicResult<()> {
        self.key
            .seal_in_place_append_tag(self.nonce_for(pn), Aad::from(header), payload)
            .map_err(|_| Error::CryptoFail)?;
        Ok(())
    }

    /// Opens `ciphertext` (including its trailing tag) in place, returning
    /// the plaintext prefix.
    pub fn open<'a>(
        &self,
        pn: u64,
        header: &[u8],
        ciphertext: &'a mut [u8],
    ) -> QuicResult<&'a mut [u8]> {
        self.key
            .open_in_place(self.nonce_for(pn), Aad::from(header), ciphertext)
            .map_err(|_| Error::CryptoFail)
    }
}

pub struct HeaderProtectionKey {
    key: ring_quic::HeaderProtectionKey,
}

impl HeaderProtectionKey {
    fn new(suite: CipherSuite, key_bytes: &[u8]) -> QuicResult<Self> {
        let key = ring_quic::HeaderProtectionKey::new(suite.hp_algorithm(), key_bytes)
            .map_err(|_| Error::CryptoFail)?;
        Ok(Self { key })
    }

    /// Computes the 5-byte mask from a 16-byte ciphertext sample (spec §4.3).
    pub fn mask(&self, sample: &[u8; SAMPLE_LEN]) -> QuicResult<[u8; 5]> {
        self.key.new_mask(sample).map_err(|_| Error::CryptoFail)
    }
}

/// One direction's (packet, header-protection) key pair.
pub struct DirectionalKeys {
    pub packet: PacketProtectionKey,
    pub header: HeaderProtectionKey,
}

impl DirectionalKeys {
    fn derive(suite: CipherSuite, secret: &[u8]) -> QuicResult<Self> {
        let key_bytes = hkdf_expand_label(secret, "quic key", suite.key_len())?;
        let iv_bytes = hkdf_expand_label(secret, "quic iv", 12)?;
        let hp_bytes = hkdf_expand_label(secret, "quic hp", suite.key_len())?;
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);
        Ok(Self {
            packet: PacketProtectionKey::new(suite, &key_bytes, iv)?,
            header: HeaderProtectionKey::new(suite, &hp_bytes)?,
        })
    }
}

/// Both directions' secrets and derived keys for one epoch (spec §3
/// "early (Initial/Handshake) cipher contexts").
pub struct CryptoContext {
    pub suite: CipherSuite,
    pub tx: DirectionalKeys,
    pub rx: DirectionalKeys,
    tx_secret: Vec<u8>,
    rx_secret: Vec<u8>,
}

impl CryptoContext {
    pub fn from_secrets(
        suite: CipherSuite,
        tx_secret: Vec<u8>,
        rx_secret: Vec<u8>,
    ) -> QuicResult<Self> {
        let tx = DirectionalKeys::derive(suite, &tx_secret)?;
        let rx = DirectionalKeys::derive(suite, &rx_secret)?;
        Ok(Self {
            suite,
            tx,
            rx,
            tx_secret,
            rx_secret,
        })
    }

    /// Derives the next generation's secrets and keys for a 1-RTT key update
    /// (spec §4.10: HKDF-Expand-Label with label "traffic upd").
    pub fn next_generation(&self) -> QuicResult<Self> {
        let tx_secret = hkdf_expand_label(&self.tx_secret, "traffic upd", self.tx_secret.len())?;
        let rx_secret = hkdf_expand_label(&self.rx_secret, "traffic upd", self.rx_secret.len())?;
        Self::from_secrets(self.suite, tx_secret, rx_secret)
    }
}

/// Derives the Initial epoch's client/server crypto contexts from a
/// client-chosen destination CID (spec §4.3).
pub fn derive_initial_secrets(dcid: &[u8]) -> QuicResult<(CryptoContext, CryptoContext)> {
    let salt = Salt::new(HKDF_SHA256, &INITIAL_SALT);
    let initial_secret: Prk = salt.extract(dcid);

    struct Len32;
    impl ring::hkdf::KeyType for Len32 {
        fn len(&self) -> usize {
            32
        }
    }
    let mut client_secret = [0u8; 32];
    let mut server_secret = [0u8; 32];

    let expand_fixed = |label: &str, out: &mut [u8; 32]| -> QuicResult<()> {
        let full_label = format!("tls13 {label}");
        let mut hkdf_label = Vec::with_capacity(3 + full_label.len());
        hkdf_label.push(0u8);
        hkdf_label.push(32u8);
        hkdf_label.push(full_label.len() as u8);
        hkdf_label.extend_from_slice(full_label.as_bytes());
        hkdf_label.push(0);
        let okm = initial_secret
            .expand(&[&hkdf_label], Len32)
            .map_err(|_| Error::CryptoFail)?;
        okm.fill(out).map_err(|_| Error::CryptoFail)?;
        Ok(())
    };
    expand_fixed("client in", &mut client_secret)?;
    expand_fixed("server in", &mut server_secret)?;

    // Client sends with the "client in" secret and reads with "server in";
    // server is the mirror image.
    let client_ctx =
        CryptoContext::from_secrets(CipherSuite::Aes128Gcm, client_secret.to_vec(), server_secret.to_vec())?;
    let server_ctx =
        CryptoContext::from_secrets(CipherSuite::Aes128Gcm, server_secret.to_vec(), client_secret.to_vec())?;
    Ok((client_ctx, server_ctx))
}

/// Recovers a truncated packet number to its full 62-bit value by centering
/// a window of size `2^(8*pnl)` around `expected` (spec §4.3, §8 R3).
pub fn recover_packet_number(truncated: u64, pnl: usize, expected: u64) -> u64 {
    let pn_bits = 8 * pnl as u32;
    let pn_win = 1u64 << pn_bits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | (truncated & pn_mask);
    if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

/// Smallest packet-number encoding length (1-4 bytes) able to represent
/// `pn` such that the receiver can always recover it given `largest_acked`
/// (spec §4.4 step 3).
pub fn encode_pn_length(pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(la) => pn.saturating_sub(la),
        None => pn + 1,
    };
    // Need `2 * num_unacked` representable range (RFC 9000 Appendix A.2).
    let bits = 64 - (2 * num_unacked.max(1)).leading_zeros();
    match bits {
        0..=8 => 1,
        9..=16 => 2,
        17..=24 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_secrets_derive_without_error() {
        let (client, server) = derive_initial_secrets(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]).unwrap();
        // Client's tx key must equal server's rx key material: sealing with
        // one and opening with the other must round-trip.
        let header = b"header-as-aad";
        let mut payload = b"hello initial".to_vec();
        client.tx.packet.seal(1, header, &mut payload).unwrap();
        let opened = server.rx.packet.open(1, header, &mut payload).unwrap();
        assert_eq!(opened, b"hello initial");
    }

    #[test]
    fn packet_number_recovery_matches_expected_window() {
        // R3: for any true pn with |pn - expected| < 2^(8*pnl - 1),
        // recover(truncate(pn, pnl), expected, pnl) == pn.
        for pnl in 1..=4usize {
            let bits = 8 * pnl as u32;
            let half = 1u64 << (bits - 1);
            for expected in [0u64, 1000, 1_000_000] {
                for delta in [0i64, 5, -5, (half as i64) - 1, -(half as i64) + 1] {
                    let true_pn = (expected as i64 + delta).max(0) as u64;
                    let truncated = true_pn & ((1u64 << bits) - 1);
                    let recovered = recover_packet_number(truncated, pnl, expected);
                    assert_eq!(recovered, true_pn, "pnl={pnl} expected={expected} delta={delta}");
                }
            }
        }
    }

    #[test]
    fn key_update_changes_keys_but_round_trips() {
        let (client, _server) = derive_initial_secrets(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let next = client.next_generation().unwrap();
        let header = b"h";
        let mut payload = b"after update".to_vec();
        next.tx.packet.seal(0, header, &mut payload).unwrap();
        let opened = next.tx.packet.open(0, header, &mut payload);
        // Sealing and opening with tx (not rx) keys must fail: tx/rx are
        // independent directional secrets.
        assert!(opened.is_err());
    }
}
