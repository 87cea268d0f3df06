//! Loss detection, RTT estimation, and congestion control (spec §4.9).
//!
//! One [`Recovery`] is shared across all three packet-number spaces; the
//! per-space sent-packet bookkeeping itself lives in [`crate::pn_space`].

use std::time::{Duration, Instant};

use crate::pn_space::{PnSpace, PnSpaceId, SentPacket};

pub const MAX_DATAGRAM_SIZE: u64 = 1452;
/// `kInitialWindow = min(10*MSS, max(2*MSS, 14720))` (RFC 9002 §7.2).
const INITIAL_WINDOW: u64 = {
    let ten_mss = 10 * MAX_DATAGRAM_SIZE;
    let floor = if 2 * MAX_DATAGRAM_SIZE > 14720 {
        2 * MAX_DATAGRAM_SIZE
    } else {
        14720
    };
    if ten_mss < floor {
        floor
    } else {
        ten_mss
    }
};
const MINIMUM_WINDOW: u64 = 2 * MAX_DATAGRAM_SIZE;
const GRANULARITY: Duration = Duration::from_millis(1);
/// RFC 9002 §6.1.1: three packets or one-eighth of the window, whichever is
/// larger, is the reordering threshold below which a packet is not yet
/// "lost" purely on a larger packet being acked.
const PACKET_THRESHOLD: u64 = 3;

pub struct RttEstimator {
    pub latest_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub rttvar: Duration,
    pub min_rtt: Duration,
    first_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: Duration::from_millis(333),
            rttvar: Duration::from_millis(166),
            min_rtt: Duration::MAX,
            first_sample: true,
        }
    }

    /// Updates the estimator from a fresh ACK, with `ack_delay` already
    /// clamped to the peer's max-ack-delay (spec §4.9).
    pub fn update(&mut self, rtt_sample: Duration, ack_delay: Duration) {
        self.latest_rtt = rtt_sample;
        self.min_rtt = self.min_rtt.min(rtt_sample);
        let adjusted = rtt_sample.saturating_sub(ack_delay).max(self.min_rtt);

        if self.first_sample {
            self.smoothed_rtt = adjusted;
            self.rttvar = adjusted / 2;
            self.first_sample = false;
            return;
        }
        let var_sample = self.smoothed_rtt.abs_diff(adjusted);
        self.rttvar = (self.rttvar * 3 + var_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
    }

    pub fn pto_base(&self) -> Duration {
        self.smoothed_rtt + (self.rttvar * 4).max(GRANULARITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    /// Inside the current recovery epoch; at most one congestion event per
    /// epoch (spec §4.9 "one event per recovery epoch").
    Recovery,
}

pub struct CongestionController {
    pub cwnd: u64,
    pub ssthresh: u64,
    pub bytes_in_flight: u64,
    pub state: CongestionState,
    congestion_recovery_start: Option<Instant>,
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            state: CongestionState::SlowStart,
            congestion_recovery_start: None,
        }
    }

    pub fn on_packet_sent(&mut self, size: u64) {
        self.bytes_in_flight += size;
    }

    pub fn is_congestion_window_limited(&self) -> bool {
        self.bytes_in_flight >= self.cwnd
    }

    /// NewReno increase on a cumulative ack (spec §4.9).
    pub fn on_packet_acked(&mut self, size: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
        if self.state == CongestionState::Recovery {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += size; // slow start
        } else {
            self.cwnd += MAX_DATAGRAM_SIZE * size / self.cwnd; // congestion avoidance
        }
    }

    pub fn on_packet_lost(&mut self, size: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
    }

    /// Triggered at the send time of the largest lost packet in a batch, at
    /// most once per recovery epoch (spec §4.9).
    pub fn on_congestion_event(&mut self, sent_time: Instant) {
        if let Some(start) = self.congestion_recovery_start {
            if sent_time <= start {
                return; // already inside this recovery epoch
            }
        }
        self.congestion_recovery_start = Some(Instant::now());
        self.cwnd = (self.cwnd / 2).max(MINIMUM_WINDOW);
        self.ssthresh = self.cwnd;
        self.state = CongestionState::Recovery;
    }

    /// Leaves recovery once an ack covers a packet sent after the epoch
    /// began.
    pub fn maybe_exit_recovery(&mut self, newly_acked_sent_at: Instant) {
        if let Some(start) = self.congestion_recovery_start {
            if newly_acked_sent_at > start {
                self.state = CongestionState::CongestionAvoidance;
                self.congestion_recovery_start = None;
            }
        }
    }

    /// Collapses the window to the minimum in place on persistent congestion
    /// (RFC 9002 §7.6), rather than replacing the controller wholesale --
    /// `bytes_in_flight` is a running total shared across all three
    /// packet-number spaces (invariant I2), so it must not get zeroed here.
    pub fn collapse_to_minimum_window(&mut self) {
        self.cwnd = MINIMUM_WINDOW;
    }
}

pub struct Recovery {
    pub rtt: RttEstimator,
    pub cc: CongestionController,
    pub pto_count: u32,
    pub crypto_count: u32,
}

impl Recovery {
    pub fn new() -> Self {
        Self {
            rtt: RttEstimator::new(),
            cc: CongestionController::new(),
            pto_count: 0,
            crypto_count: 0,
        }
    }

    /// Timer selection (spec §4.9 "set-loss-detection-timer"). `has_1rtt_keys`
    /// and `crypto_unacked` together decide between a crypto-PTO, a regular
    /// PTO, or disarming.
    pub fn loss_detection_timer(
        &self,
        spaces: &[&PnSpace],
        has_1rtt_keys: bool,
        crypto_unacked: bool,
        max_ack_delay: Duration,
    ) -> Option<Instant> {
        if let Some(earliest) = spaces.iter().filter_map(|s| s.loss_time).min() {
            return Some(earliest);
        }
        if crypto_unacked || !has_1rtt_keys {
            let last_sent_crypto = spaces.iter().filter_map(|s| s.last_sent_crypto).max()?;
            let timeout = (self.rtt.smoothed_rtt * 2).max(GRANULARITY) * 2u32.pow(self.crypto_count);
            return Some(last_sent_crypto + timeout);
        }
        let last_sent = spaces.iter().filter_map(|s| s.last_sent_ack_eliciting).max()?;
        let timeout = (self.rtt.pto_base() + max_ack_delay) * 2u32.pow(self.pto_count);
        Some(last_sent + timeout)
    }

    /// Declares packets lost per space (spec §4.9). Returns the lost packet
    /// numbers and whether any lost packet was ack-eliciting (so the caller
    /// can trigger a congestion event at the largest lost packet's send time).
    pub fn detect_lost_packets(
        &mut self,
        space: &mut PnSpace,
        now: Instant,
    ) -> Vec<(u64, SentPacket)> {
        let largest_acked = match space.largest_acked {
            Some(la) => la,
            None => return Vec::new(),
        };
        let loss_delay = (self.rtt.smoothed_rtt.max(self.rtt.latest_rtt) * 9 / 8).max(GRANULARITY);

        let mut lost = Vec::new();
        space.loss_time = None;
        let pns: Vec<u64> = space.sent.keys().copied().collect();
        for pn in pns {
            if pn > largest_acked {
                continue;
            }
            let sent_time = space.sent[&pn].time_sent;
            let time_lost = now.saturating_duration_since(sent_time) >= loss_delay;
            let pn_lost = largest_acked >= pn + PACKET_THRESHOLD;
            if time_lost || pn_lost {
                if let Some(pkt) = space.sent.remove(&pn) {
                    lost.push((pn, pkt));
                }
            } else {
                let next_loss_time = sent_time + loss_delay;
                space.loss_time = Some(space.loss_time.map_or(next_loss_time, |t| t.min(next_loss_time)));
            }
        }
        lost
    }

    /// Persistent congestion per RFC 9002 §7.6: every packet sent in
    /// `[start, end]` is lost and the span exceeds the PTO-based duration.
    /// The original implementation this crate is derived from stubs
    /// persistent congestion detection to `false`; this reimplements it
    /// properly rather than carrying that gap forward.
    pub fn is_persistent_congestion(
        &self,
        lost: &[(u64, SentPacket)],
        max_ack_delay: Duration,
    ) -> bool {
        if lost.len() < 2 {
            return false;
        }
        let pto = self.rtt.smoothed_rtt
            + (self.rtt.rttvar * 4).max(GRANULARITY)
            + max_ack_delay;
        let duration = pto * (2u32.pow(self.pto_count.max(1)));

        let first = lost.first().unwrap().1.time_sent;
        let last = lost.last().unwrap().1.time_sent;
        last.saturating_duration_since(first) >= duration
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_window_matches_rfc9002() {
        assert_eq!(INITIAL_WINDOW, 14520.max(14720));
    }

    #[test]
    fn rtt_first_sample_seeds_smoothed_and_var() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.smoothed_rtt, Duration::from_millis(100));
        assert_eq!(rtt.rttvar, Duration::from_millis(50));
    }

    #[test]
    fn congestion_event_halves_window_once_per_epoch() {
        let mut cc = CongestionController::new();
        let before = cc.cwnd;
        let t0 = Instant::now();
        cc.on_congestion_event(t0);
        assert_eq!(cc.cwnd, (before / 2).max(MINIMUM_WINDOW));
        let after_first = cc.cwnd;
        cc.on_congestion_event(t0); // same epoch, no-op
        assert_eq!(cc.cwnd, after_first);
    }

    #[test]
    fn slow_start_increases_by_full_packet_size() {
        let mut cc = CongestionController::new();
        let before = cc.cwnd;
        cc.on_packet_acked(MAX_DATAGRAM_SIZE);
        assert_eq!(cc.cwnd, before + MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn persistent_congestion_collapses_cwnd_in_place() {
        let mut cc = CongestionController::new();
        cc.bytes_in_flight = 9000;
        cc.on_congestion_event(Instant::now());
        cc.collapse_to_minimum_window();
        assert_eq!(cc.cwnd, MINIMUM_WINDOW);
        assert_eq!(cc.bytes_in_flight, 9000);
    }
}
