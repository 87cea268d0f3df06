//! Stateless Retry token (spec §4.7 "Retry handling"): an HMAC-tagged
//! encoding of the original destination CID and the client's address,
//! so a server can validate a returned token without keeping per-client
//! state. Grounded on the retry-token scheme in the original C
//! implementation's source tree, which this spec's distillation omits.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;

use crate::cid::ConnectionId;
use crate::result::{require, Error, QuicResult};

const TOKEN_LIFETIME_SECS: u64 = 15;

pub struct RetryTokenKey {
    key: hmac::Key,
}

impl RetryTokenKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &bytes),
        }
    }

    /// `odcid || addr-bytes || unix-timestamp(8) || hmac-tag(32)`.
    pub fn issue(&self, odcid: &ConnectionId, addr: SocketAddr) -> Vec<u8> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut msg = Vec::new();
        msg.push(odcid.len() as u8);
        msg.extend_from_slice(odcid.as_slice());
        push_addr(&mut msg, addr);
        msg.extend_from_slice(&now.to_be_bytes());

        let tag = hmac::sign(&self.key, &msg);
        msg.extend_from_slice(tag.as_ref());
        msg
    }

    /// Verifies a token returned in a client Initial's token field, checking
    /// the HMAC tag, the freshness window, and that it was issued for `addr`.
    pub fn validate(&self, token: &[u8], addr: SocketAddr) -> QuicResult<ConnectionId> {
        require(token.len() > 32 + 8 + 1, "retry token too short")?;
        let (msg, tag) = token.split_at(token.len() - 32);
        hmac::verify(&self.key, msg, tag).map_err(|_| Error::InvalidToken)?;

        let odcid_len = msg[0] as usize;
        require(msg.len() >= 1 + odcid_len + 8, "retry token malformed")?;
        let odcid = ConnectionId::new(msg[1..1 + odcid_len].to_vec())?;

        let addr_end = msg.len() - 8;
        let ts_bytes = &msg[addr_end..];
        let mut ts = [0u8; 8];
        ts.copy_from_slice(ts_bytes);
        let issued_at = u64::from_be_bytes(ts);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        require(
            now.saturating_sub(issued_at) <= TOKEN_LIFETIME_SECS,
            "retry token expired",
        )?;

        let mut expected_addr = Vec::new();
        push_addr(&mut expected_addr, addr);
        require(
            &msg[1 + odcid_len..addr_end] == expected_addr.as_slice(),
            "retry token issued for a different address",
        )?;

        Ok(odcid)
    }
}

fn push_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            out.push(4);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            out.push(6);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn issued_token_validates_for_the_same_address() {
        let key = RetryTokenKey::generate();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433);
        let odcid = ConnectionId::new(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let token = key.issue(&odcid, addr);
        let recovered = key.validate(&token, addr).unwrap();
        assert_eq!(recovered, odcid);
    }

    #[test]
    fn token_rejected_for_a_different_address() {
        let key = RetryTokenKey::generate();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433);
        let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999);
        let odcid = ConnectionId::new(vec![1; 8]).unwrap();
        let token = key.issue(&odcid, addr);
        assert!(key.validate(&token, other).is_err());
    }
}
