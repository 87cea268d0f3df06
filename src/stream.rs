//! Stream layer (spec §4.8): per-stream flow control and in/out buffering.
//!
//! Stream ids follow QUIC conventions: bit 0 selects the initiator
//! (0 = client, 1 = server), bit 1 selects directionality (0 = bidi,
//! 1 = uni).

use std::collections::BTreeMap;

use crate::interval_set::IntervalSet;
use crate::result::{Error, QuicResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Bidi,
    Uni,
}

pub fn initiator_bit(role: Role) -> u64 {
    match role {
        Role::Client => 0,
        Role::Server => 1,
    }
}

pub fn is_client_initiated(id: u64) -> bool {
    id & 0x1 == 0
}

pub fn is_bidi(id: u64) -> bool {
    id & 0x2 == 0
}

/// True when `id` was opened by `role`, as seen by an endpoint of that role.
pub fn is_local(id: u64, role: Role) -> bool {
    (id & 0x1) == initiator_bit(role)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// Local send side finished (FIN sent/received and acked, or RESET).
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Out-of-order bytes not yet contiguous with `in_data_off` (spec §4.6:
/// "attempt to drain in_ooo whose left edge now touches in_data_off").
#[derive(Default)]
struct OutOfOrder {
    ranges: IntervalSet,
    bytes: BTreeMap<u64, Vec<u8>>,
}

impl OutOfOrder {
    fn insert(&mut self, offset: u64, data: &[u8]) -> QuicResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        // Byte ranges are half-open [offset, end); the interval set stores
        // inclusive bounds, so the last covered byte is `end - 1`.
        let end = offset + data.len() as u64;
        let last = end - 1;
        // Partial overlaps with already-buffered out-of-order data are
        // rejected rather than merged (documented implementation choice,
        // spec §4.6).
        for &(lo, hi) in self.ranges.ranges() {
            let overlaps = offset <= hi && lo <= last;
            let exact = offset == lo && last == hi;
            if overlaps && !exact {
                return Err(Error::ProtocolViolation(
                    "partial overlap with buffered out-of-order stream data",
                ));
            }
        }
        if self.ranges.contains(offset) && self.ranges.contains(last) {
            return Ok(()); // duplicate exact range, ignored
        }
        self.ranges.insert_range(offset, last);
        self.bytes.insert(offset, data.to_vec());
        Ok(())
    }

    /// Drains contiguous bytes starting at `from`, removing them from the
    /// out-of-order store, returning the drained bytes and new `from`.
    fn drain_from(&mut self, mut from: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let Some((&offset, _)) = self.bytes.iter().find(|(&o, d)| o <= from && from < o + d.len() as u64) else {
                break;
            };
            let data = self.bytes.remove(&offset).unwrap();
            let start = (from - offset) as usize;
            out.extend_from_slice(&data[start..]);
            from = offset + data.len() as u64;
        }
        out
    }
}

/// One stream's state, buffers, and flow-control bookkeeping (spec §3
/// "Stream", §4.8).
pub struct Stream {
    pub id: u64,
    pub state: StreamState,

    pub in_data_off: u64,
    pub in_data_max: u64,
    pub in_fin_offset: Option<u64>,
    in_ooo: OutOfOrder,
    pub in_buf: Vec<u8>,
    /// Highest `offset + len` ever seen on this stream, in or out of order
    /// (spec §4.8: the connection-level MAX_DATA accounting counts this, not
    /// `in_data_off`, so retransmitted bytes aren't double-charged).
    pub in_highest_offset: u64,

    /// Cursor into `out_buf`: bytes before this offset have gone out in a
    /// STREAM frame at least once. `out_buf` is never trimmed, so a lost
    /// range can always be recovered from it (mirrors the CRYPTO stream).
    pub out_data_off: u64,
    pub out_data_max: u64,
    pub out_buf: Vec<u8>,
    pub out_fin: bool,
    pub out_blocked: bool,
    /// `(pn, offset, len)` for each sent-but-unacked STREAM byte range.
    out_in_flight: Vec<(u64, u64, u64)>,
}

impl Stream {
    pub fn new(id: u64, initial_max_data: u64) -> Self {
        Self {
            id,
            state: StreamState::Open,
            in_data_off: 0,
            in_data_max: initial_max_data,
            in_fin_offset: None,
            in_ooo: OutOfOrder::default(),
            in_buf: Vec::new(),
            in_highest_offset: 0,
            out_data_off: 0,
            out_data_max: 0,
            out_buf: Vec::new(),
            out_fin: false,
            out_blocked: false,
            out_in_flight: Vec::new(),
        }
    }

    /// Applies a received STREAM/CRYPTO frame's payload (spec §4.6). Returns
    /// `true` if `in_data_max` should be doubled and re-advertised (half the
    /// window has been consumed).
    pub fn on_data_received(&mut self, offset: u64, data: &[u8], fin: bool) -> QuicResult<bool> {
        let end = offset + data.len() as u64;
        if let Some(final_offset) = self.in_fin_offset {
            if end > final_offset || (fin && offset + data.len() as u64 != final_offset) {
                return Err(Error::FinalSize);
            }
        }
        if fin {
            self.in_fin_offset = Some(end);
        }
        if data.is_empty() && !fin {
            return Ok(false); // zero-length non-FIN frames are ignored
        }
        if end > self.in_data_max {
            return Err(Error::FlowControl);
        }

        if offset == self.in_data_off {
            self.in_buf.extend_from_slice(data);
            self.in_data_off = end;
            let drained = self.in_ooo.drain_from(self.in_data_off);
            if !drained.is_empty() {
                self.in_data_off += drained.len() as u64;
                self.in_buf.extend_from_slice(&drained);
            }
        } else if offset > self.in_data_off {
            self.in_ooo.insert(offset, data)?;
        } // offset < in_data_off: fully duplicate prefix, ignored

        if let Some(final_offset) = self.in_fin_offset {
            if self.in_data_off >= final_offset {
                self.state = match self.state {
                    StreamState::Open => StreamState::HalfClosedRemote,
                    StreamState::HalfClosedLocal => StreamState::Closed,
                    other => other,
                };
            }
        }

        Ok(self.in_data_off >= self.in_data_max / 2)
    }

    /// Doubles the inbound window after half has been consumed (spec §4.8).
    pub fn grow_in_data_max(&mut self) -> u64 {
        self.in_data_max *= 2;
        self.in_data_max
    }

    /// How many bytes of the connection-level MAX_DATA budget a frame
    /// ending at `end` would newly consume, without committing it.
    pub fn highest_offset_delta(&self, end: u64) -> u64 {
        end.saturating_sub(self.in_highest_offset)
    }

    /// Commits the delta computed by [`Stream::highest_offset_delta`].
    pub fn advance_highest_offset(&mut self, end: u64) {
        if end > self.in_highest_offset {
            self.in_highest_offset = end;
        }
    }

    /// Queues `data` for output, honoring `out_data_max`; sets `out_blocked`
    /// if the write would exceed the peer-advertised limit.
    pub fn queue_write(&mut self, data: &[u8], fin: bool) -> QuicResult<usize> {
        let room = self.out_data_max.saturating_sub(self.out_buf.len() as u64);
        let to_write = data.len().min(room as usize);
        self.out_buf.extend_from_slice(&data[..to_write]);
        if to_write < data.len() {
            self.out_blocked = true;
        } else if fin {
            self.out_fin = true;
        }
        Ok(to_write)
    }

    /// The next unsent byte range, if any (spec §4.8 "send path"; mirrors
    /// the per-epoch CRYPTO stream's `out_sent` cursor).
    pub fn pending_send(&self) -> Option<(u64, &[u8])> {
        if (self.out_data_off as usize) < self.out_buf.len() {
            Some((self.out_data_off, &self.out_buf[self.out_data_off as usize..]))
        } else {
            None
        }
    }

    /// True once every buffered byte (FIN included, if set) has been sent
    /// at least once.
    pub fn fully_sent(&self) -> bool {
        self.out_data_off as usize >= self.out_buf.len()
    }

    /// Advances the send cursor and records `len` bytes starting at the
    /// cursor's prior value as in flight in packet `pn`.
    pub fn mark_sent(&mut self, pn: u64, len: usize) {
        let offset = self.out_data_off;
        self.out_data_off += len as u64;
        self.out_in_flight.push((pn, offset, len as u64));
    }

    /// Drops in-flight bookkeeping for newly-acked packet numbers.
    pub fn ack(&mut self, acked_pns: &[u64]) {
        self.out_in_flight.retain(|(pn, _, _)| !acked_pns.contains(pn));
    }

    /// Rewinds the send cursor so a lost byte range is picked up again by
    /// [`Stream::pending_send`].
    pub fn reclaim_lost(&mut self, lost_pns: &[u64]) -> bool {
        let mut rewound = false;
        let mut rewind_to = None;
        self.out_in_flight.retain(|(pn, offset, _)| {
            if lost_pns.contains(pn) {
                rewind_to = Some(rewind_to.map_or(*offset, |r: u64| r.min(*offset)));
                false
            } else {
                true
            }
        });
        if let Some(offset) = rewind_to {
            self.out_data_off = self.out_data_off.min(offset);
            rewound = true;
        }
        rewound
    }

    /// Raises `out_data_max` on receipt of MAX_STREAM_DATA (spec §4.8:
    /// "advances on receipt"; monotonic, ignores stale/smaller values).
    pub fn on_max_stream_data(&mut self, max: u64) {
        if max > self.out_data_max {
            self.out_data_max = max;
            self.out_blocked = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_order_data_appends_directly() {
        let mut s = Stream::new(0, 1000);
        let grew = s.on_data_received(0, b"hello", false).unwrap();
        assert!(!grew);
        assert_eq!(s.in_buf, b"hello");
        assert_eq!(s.in_data_off, 5);
    }

    #[test]
    fn out_of_order_data_drains_once_gap_fills() {
        let mut s = Stream::new(0, 1000);
        s.on_data_received(5, b"world", false).unwrap();
        assert_eq!(s.in_data_off, 0);
        s.on_data_received(0, b"hello", false).unwrap();
        assert_eq!(s.in_buf, b"helloworld");
        assert_eq!(s.in_data_off, 10);
    }

    #[test]
    fn fin_past_final_size_is_rejected() {
        let mut s = Stream::new(0, 1000);
        s.on_data_received(0, b"hello", true).unwrap();
        assert!(s.on_data_received(5, b"more", false).is_err());
    }

    #[test]
    fn exceeding_flow_control_is_rejected() {
        let mut s = Stream::new(0, 4);
        assert!(s.on_data_received(0, b"hello", false).is_err());
    }

    #[test]
    fn write_beyond_peer_limit_blocks() {
        let mut s = Stream::new(0, 1000);
        s.out_data_max = 3;
        let written = s.queue_write(b"hello", false).unwrap();
        assert_eq!(written, 3);
        assert!(s.out_blocked);
    }

    #[test]
    fn max_stream_data_is_monotonic() {
        let mut s = Stream::new(0, 1000);
        s.on_max_stream_data(100);
        s.on_max_stream_data(50);
        assert_eq!(s.out_data_max, 100);
    }
}
