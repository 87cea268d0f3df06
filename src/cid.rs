//! Connection ID lifecycle (spec §3 "Connection ID", §4.11).

use std::collections::BTreeMap;

use rand::RngCore;

use crate::result::{require, QuicResult};

pub const MIN_CID_LEN: usize = 4;
pub const MAX_CID_LEN: usize = 20;
pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// An opaque connection identifier, 4-20 bytes (0 is allowed only for a
/// client-chosen source CID, spec §6.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: Vec<u8>,
}

impl ConnectionId {
    pub fn new(bytes: Vec<u8>) -> QuicResult<Self> {
        require(bytes.len() <= MAX_CID_LEN, "connection id exceeds 20 bytes")?;
        Ok(Self { bytes })
    }

    /// CID for a zero-length (client-only) short-header destination.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn random(rng: &mut dyn RngCore, len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// One entry in a connection's source- or destination-CID set, keyed by
/// sequence number (spec §3 "Connection ID").
#[derive(Debug, Clone)]
pub struct IssuedCid {
    pub seq: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub retired: bool,
}

/// An ordered-by-sequence set of CIDs, with exactly one "active" member.
///
/// Matches the Design Note in spec §9: a sorted container keyed by sequence
/// number, rather than the intrusive splay tree the original C uses.
#[derive(Debug, Default)]
pub struct CidSet {
    by_seq: BTreeMap<u64, IssuedCid>,
    active_seq: Option<u64>,
    next_seq: u64,
}

impl CidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: IssuedCid) -> QuicResult<()> {
        require(
            entry.cid.len() >= MIN_CID_LEN || entry.cid.is_empty(),
            "connection id shorter than 4 bytes",
        )?;
        require(
            entry.retire_prior_to <= entry.seq,
            "retire_prior_to exceeds sequence number",
        )?;
        if self.by_seq.contains_key(&entry.seq) {
            // Duplicate sequence numbers are ignored (spec §4.11).
            return Ok(());
        }
        if self.active_seq.is_none() {
            self.active_seq = Some(entry.seq);
        }
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.by_seq.insert(entry.seq, entry);
        Ok(())
    }

    pub fn active(&self) -> Option<&IssuedCid> {
        self.active_seq.and_then(|seq| self.by_seq.get(&seq))
    }

    pub fn active_seq(&self) -> Option<u64> {
        self.active_seq
    }

    pub fn get(&self, seq: u64) -> Option<&IssuedCid> {
        self.by_seq.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.by_seq.iter().filter(|(_, c)| !c.retired).count()
    }

    /// Marks `seq` retired and, if it was active, promotes the
    /// next-highest-sequence non-retired entry (spec §4.11).
    pub fn retire(&mut self, seq: u64) -> QuicResult<Option<IssuedCid>> {
        let entry = match self.by_seq.get_mut(&seq) {
            Some(e) => e,
            None => return Ok(None),
        };
        entry.retired = true;
        let retired = entry.clone();

        if self.active_seq == Some(seq) {
            self.active_seq = self
                .by_seq
                .iter()
                .filter(|(_, c)| !c.retired)
                .map(|(s, _)| *s)
                .next();
        }
        Ok(Some(retired))
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssuedCid> {
        self.by_seq.values()
    }

    /// Active CIDs below `active`, newly-retired and awaiting a
    /// RETIRE_CONNECTION_ID frame (spec §4.4 step 8).
    pub fn pending_retirements(&self) -> Vec<u64> {
        self.by_seq
            .values()
            .filter(|c| c.retired)
            .map(|c| c.seq)
            .collect()
    }

    pub fn drop_seq(&mut self, seq: u64) {
        self.by_seq.remove(&seq);
    }
}

/// Validates a locally-received NEW_CONNECTION_ID frame per spec §4.11 /
/// §8 boundary behavior ("retire_prior_to > sequence MUST PROTOCOL_VIOLATION").
pub fn validate_new_connection_id(
    seq: u64,
    retire_prior_to: u64,
    cid_len: u8,
) -> QuicResult<()> {
    require(
        (MIN_CID_LEN..=MAX_CID_LEN).contains(&(cid_len as usize)),
        "NEW_CONNECTION_ID length out of range",
    )?;
    require(
        retire_prior_to <= seq,
        "NEW_CONNECTION_ID retire_prior_to exceeds sequence",
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retiring_active_promotes_next() {
        let mut set = CidSet::new();
        set.insert(IssuedCid {
            seq: 0,
            retire_prior_to: 0,
            cid: ConnectionId::new(vec![1; 8]).unwrap(),
            reset_token: None,
            retired: false,
        })
        .unwrap();
        set.insert(IssuedCid {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::new(vec![2; 8]).unwrap(),
            reset_token: None,
            retired: false,
        })
        .unwrap();
        assert_eq!(set.active_seq(), Some(0));
        set.retire(0).unwrap();
        assert_eq!(set.active_seq(), Some(1));
    }

    #[test]
    fn rejects_retire_prior_to_above_sequence() {
        assert!(validate_new_connection_id(1, 2, 8).is_err());
    }

    #[test]
    fn rejects_out_of_range_length() {
        assert!(validate_new_connection_id(1, 0, 3).is_err());
        assert!(validate_new_connection_id(1, 0, 21).is_err());
    }
}
