//! Packet-number spaces (spec §3 "Packet-number space", §4.6, §4.11).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::interval_set::IntervalSet;
use crate::packet::protection::CryptoContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PnSpaceId {
    Initial,
    Handshake,
    Application,
}

impl PnSpaceId {
    pub const ALL: [PnSpaceId; 3] = [
        PnSpaceId::Initial,
        PnSpaceId::Handshake,
        PnSpaceId::Application,
    ];
}

/// Bookkeeping for one sent, not-yet-{acked,lost} packet (spec invariant I4).
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub is_crypto: bool,
    /// If this transmission is a retransmission, the pn of the packet it
    /// carries a copy of the stream/crypto payload for (spec §4.9 "RTX chain").
    pub rtx_of: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// One packet-number space: Initial, Handshake, or Application (spec §3).
pub struct PnSpace {
    pub id: PnSpaceId,
    pub sent: BTreeMap<u64, SentPacket>,
    /// Packet numbers received since the last ACK was sent (drives the
    /// ACK-elicitation decision in spec §4.5 step 10).
    pub recv_since_last_ack: IntervalSet,
    /// Every packet number ever successfully authenticated in this space
    /// (spec invariant I6, dedup property P2).
    pub recv_all: IntervalSet,
    pub largest_acked: Option<u64>,
    pub largest_sent: Option<u64>,
    pub next_pn: u64,
    pub frames_rx: u64,
    pub ecn_counts: EcnCounts,
    pub packets_since_last_ack_tx: u64,
    pub immediate_ack: bool,
    pub abandoned: bool,
    pub loss_time: Option<Instant>,
    pub last_sent_ack_eliciting: Option<Instant>,
    pub last_sent_crypto: Option<Instant>,
    pub crypto: Option<CryptoContext>,
    /// Application space only: 0-RTT keys, and 1-RTT keys indexed by key
    /// phase (spec §3 "two-element array of 1-RTT contexts").
    pub zero_rtt_crypto: Option<CryptoContext>,
    pub one_rtt_crypto: [Option<CryptoContext>; 2],
    pub key_phase_out: u8,
    pub key_phase_in: u8,
}

impl PnSpace {
    pub fn new(id: PnSpaceId) -> Self {
        Self {
            id,
            sent: BTreeMap::new(),
            recv_since_last_ack: IntervalSet::new(),
            recv_all: IntervalSet::new(),
            largest_acked: None,
            largest_sent: None,
            next_pn: 0,
            frames_rx: 0,
            ecn_counts: EcnCounts::default(),
            packets_since_last_ack_tx: 0,
            immediate_ack: false,
            abandoned: false,
            loss_time: None,
            last_sent_ack_eliciting: None,
            last_sent_crypto: None,
            crypto: None,
            zero_rtt_crypto: None,
            one_rtt_crypto: [None, None],
            key_phase_out: 0,
            key_phase_in: 0,
        }
    }

    /// Allocates the next packet number; the first packet in a space is 0
    /// (spec §4.4 step 1, invariant P1).
    pub fn alloc_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn on_pkt_sent(&mut self, pn: u64, pkt: SentPacket) {
        let now = pkt.time_sent;
        self.largest_sent = Some(self.largest_sent.map_or(pn, |l| l.max(pn)));
        if pkt.ack_eliciting {
            self.last_sent_ack_eliciting = Some(now);
        }
        if pkt.is_crypto {
            self.last_sent_crypto = Some(now);
        }
        self.sent.insert(pn, pkt);
    }

    /// Total bytes of sent-but-not-{acked,lost,abandoned} ack-eliciting or
    /// padding-only packets (spec invariant I2, computed on demand here and
    /// cached by the caller as `in_flight`).
    pub fn in_flight_bytes(&self) -> usize {
        self.sent.values().filter(|p| p.in_flight).map(|p| p.size).sum()
    }

    pub fn on_pkt_received(&mut self, pn: u64) {
        debug_assert!(!self.recv_all.contains(pn));
        self.recv_all.insert(pn);
        self.recv_since_last_ack.insert(pn);
        self.packets_since_last_ack_tx += 1;
    }

    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.recv_all.contains(pn)
    }

    pub fn on_ack_tx(&mut self) {
        self.packets_since_last_ack_tx = 0;
        self.immediate_ack = false;
    }

    /// 1-RTT crypto context for a given key phase (Application space only).
    pub fn one_rtt(&self, phase: u8) -> Option<&CryptoContext> {
        self.one_rtt_crypto[(phase & 1) as usize].as_ref()
    }

    pub fn one_rtt_mut(&mut self, phase: u8) -> &mut Option<CryptoContext> {
        &mut self.one_rtt_crypto[(phase & 1) as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pn_allocation_starts_at_zero_and_increments() {
        let mut space = PnSpace::new(PnSpaceId::Initial);
        assert_eq!(space.alloc_pn(), 0);
        assert_eq!(space.alloc_pn(), 1);
        assert_eq!(space.alloc_pn(), 2);
    }

    #[test]
    fn duplicate_detection_follows_recv_all() {
        let mut space = PnSpace::new(PnSpaceId::Application);
        assert!(!space.is_duplicate(5));
        space.on_pkt_received(5);
        assert!(space.is_duplicate(5));
        assert!(!space.is_duplicate(6));
    }

    #[test]
    fn in_flight_bytes_excludes_non_in_flight_packets() {
        let mut space = PnSpace::new(PnSpaceId::Handshake);
        let now = Instant::now();
        space.on_pkt_sent(
            0,
            SentPacket {
                time_sent: now,
                size: 100,
                ack_eliciting: true,
                in_flight: true,
                is_crypto: true,
                rtx_of: None,
            },
        );
        space.on_pkt_sent(
            1,
            SentPacket {
                time_sent: now,
                size: 50,
                ack_eliciting: false,
                in_flight: false,
                is_crypto: false,
                rtx_of: None,
            },
        );
        assert_eq!(space.in_flight_bytes(), 100);
        assert_eq!(space.largest_sent, Some(1));
        assert!(space.last_sent_crypto.is_some());
    }

    #[test]
    fn one_rtt_crypto_is_indexed_by_key_phase_parity() {
        let mut space = PnSpace::new(PnSpaceId::Application);
        assert!(space.one_rtt(0).is_none());
        *space.one_rtt_mut(1) = None;
        assert!(space.one_rtt(1).is_none());
        assert!(space.one_rtt(3).is_none());
    }
}
