//! The `Connection`: one QUIC endpoint's view of a single peer (spec §3
//! "Connection", §4.4-§4.11). Wires together packet protection, the frame
//! codec, stream buffering, loss recovery, and the TLS handshake.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::cid::{CidSet, ConnectionId, IssuedCid};
use crate::codec::{Reader, Writer};
use crate::config::Config;
use crate::frame::{AckRange, Frame};
use crate::packet::header::{LongHeader, ShortHeader};
use crate::packet::protection::CryptoContext;
use crate::packet::types::{Epoch, PacketType};
use crate::packet::{self, DecodedLong, DecodedShort};
use crate::pn_space::{PnSpace, PnSpaceId, SentPacket};
use crate::recovery::Recovery;
use crate::result::{require, Error, QuicResult};
use crate::stream::{self, Role, Stream};
use crate::tls::{HandshakeStep, TlsEngine};
use crate::transport_params::TransportParameters;

use super::types::ConnectionState;

/// The version this endpoint speaks and negotiates (matches the draft this
/// crate's wire format targets, per spec §6.2).
pub const VERSION_CURRENT: u32 = 0xff00_0016;

/// Versions this endpoint will negotiate, in priority order (spec §4.7,
/// §6.2, mandatory scenario 2). A single entry today since this crate
/// speaks exactly one wire format, but a peer that doesn't support it still
/// gets a real Version Negotiation round-trip rather than silence.
pub(crate) const SUPPORTED_VERSIONS: [u32; 1] = [VERSION_CURRENT];

pub(crate) fn is_supported_version(v: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&v)
}

/// The three packet-number spaces, addressable by [`PnSpaceId`] (spec §3
/// "three packet-number spaces").
struct Spaces {
    initial: PnSpace,
    handshake: PnSpace,
    application: PnSpace,
}

impl Spaces {
    fn new() -> Self {
        Self {
            initial: PnSpace::new(PnSpaceId::Initial),
            handshake: PnSpace::new(PnSpaceId::Handshake),
            application: PnSpace::new(PnSpaceId::Application),
        }
    }

    fn get(&self, id: PnSpaceId) -> &PnSpace {
        match id {
            PnSpaceId::Initial => &self.initial,
            PnSpaceId::Handshake => &self.handshake,
            PnSpaceId::Application => &self.application,
        }
    }

    fn get_mut(&mut self, id: PnSpaceId) -> &mut PnSpace {
        match id {
            PnSpaceId::Initial => &mut self.initial,
            PnSpaceId::Handshake => &mut self.handshake,
            PnSpaceId::Application => &mut self.application,
        }
    }

    fn all(&self) -> [&PnSpace; 3] {
        [&self.initial, &self.handshake, &self.application]
    }
}

/// Outgoing/incoming CRYPTO-stream bookkeeping for one epoch (spec §4.6:
/// CRYPTO data is a per-epoch ordered byte stream, distinct from STREAM
/// flow control). Indexed 0=Initial, 1=Handshake, 2=1-RTT; 0-RTT never
/// carries CRYPTO frames (spec §4.6, frame epoch-legality table).
#[derive(Default)]
struct CryptoStream {
    out_buf: Vec<u8>,
    out_sent: u64,
    in_offset: u64,
    /// `(pn, offset, len)` for each CRYPTO byte range still in flight, so a
    /// loss can rewind `out_sent` to the right place for retransmission.
    in_flight: Vec<(u64, u64, u64)>,
}

fn crypto_idx(epoch: Epoch) -> usize {
    match epoch {
        Epoch::Initial => 0,
        Epoch::Handshake => 1,
        Epoch::ZeroRtt | Epoch::OneRtt => 2,
    }
}

fn crypto_idx_for_space(id: PnSpaceId) -> usize {
    match id {
        PnSpaceId::Initial => 0,
        PnSpaceId::Handshake => 1,
        PnSpaceId::Application => 2,
    }
}

/// Snapshot of connection statistics (spec §6.1 `info`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnInfo {
    pub pkts_in_valid: u64,
    pub pkts_in_invalid: u64,
    pub pkts_out: u64,
    pub pkts_out_lost: u64,
    pub pkts_out_rtx: u64,
    pub rtt: Duration,
    pub rttvar: Duration,
    pub cwnd: u64,
    pub ssthresh: u64,
    pub pto_cnt: u32,
}

/// Local error queued for the next CONNECTION_CLOSE (spec §3 "error code +
/// optional reason").
struct CloseError {
    code: u64,
    is_application: bool,
    reason: Vec<u8>,
}

pub struct Connection {
    pub role: Role,
    pub state: ConnectionState,
    pub version: u32,
    pub peer_addr: SocketAddr,
    migrating_to: Option<SocketAddr>,

    scids: CidSet,
    dcids: CidSet,
    active_dcid: ConnectionId,

    spaces: Spaces,
    recovery: Recovery,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    tls: Box<dyn TlsEngine + Send>,
    crypto: [CryptoStream; 3],

    streams: BTreeMap<u64, Stream>,
    next_stream_id: [u64; 2], // [bidi, uni], stepping by 4 from the role's low bits
    /// Streams we've opened per directionality, checked against
    /// `max_streams` before `reserve_stream` hands out another id (spec §4.8).
    open_streams: [u64; 2],
    /// The peer's MAX_STREAMS limit per directionality, seeded from its
    /// transport parameters and raised monotonically by MAX_STREAMS frames.
    max_streams: [u64; 2],

    /// Connection-level flow control (spec §4.8 "mirrored identically on the
    /// connection", invariant P4). `in_data_sum`/`out_data_sum` are the sum
    /// of the highest offset ever seen/written across every stream.
    in_data_sum: u64,
    out_data_sum: u64,
    max_data_in: u64,
    max_data_out: u64,

    config: Config,
    pending_control: Vec<Frame>,

    spin: bool,
    key_phase_flip_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    close_error: Option<CloseError>,
    handshake_done_rxed: bool,

    pkts_in_valid: u64,
    pkts_in_invalid: u64,
    pkts_out: u64,
    pkts_out_lost: u64,
    pkts_out_rtx: u64,
}

fn stream_index(bidi: bool) -> usize {
    if bidi {
        0
    } else {
        1
    }
}

impl Connection {
    fn base(
        role: Role,
        version: u32,
        peer_addr: SocketAddr,
        local_scid: ConnectionId,
        peer_dcid: ConnectionId,
        reset_token: [u8; 16],
        config: Config,
        tls: Box<dyn TlsEngine + Send>,
    ) -> QuicResult<Self> {
        let mut scids = CidSet::new();
        scids.insert(IssuedCid {
            seq: 0,
            retire_prior_to: 0,
            cid: local_scid,
            reset_token: Some(reset_token),
            retired: false,
        })?;
        let mut dcids = CidSet::new();
        dcids.insert(IssuedCid {
            seq: 0,
            retire_prior_to: 0,
            cid: peer_dcid.clone(),
            reset_token: None,
            retired: false,
        })?;

        let mut local_params = config.local_transport_params();
        local_params.stateless_reset_token = Some(reset_token);
        let max_data_in = local_params.initial_max_data;
        let next_stream_id = match role {
            Role::Client => [0u64, 2u64],
            Role::Server => [1u64, 3u64],
        };

        Ok(Self {
            role,
            state: ConnectionState::Idle,
            version,
            peer_addr,
            migrating_to: None,
            scids,
            dcids,
            active_dcid: peer_dcid,
            spaces: Spaces::new(),
            recovery: Recovery::new(),
            local_params,
            peer_params: None,
            tls,
            crypto: [
                CryptoStream::default(),
                CryptoStream::default(),
                CryptoStream::default(),
            ],
            streams: BTreeMap::new(),
            next_stream_id,
            open_streams: [0, 0],
            max_streams: [0, 0],
            in_data_sum: 0,
            out_data_sum: 0,
            max_data_in,
            max_data_out: 0,
            config,
            pending_control: Vec::new(),
            spin: false,
            key_phase_flip_deadline: None,
            idle_deadline: None,
            close_error: None,
            handshake_done_rxed: false,
            pkts_in_valid: 0,
            pkts_in_invalid: 0,
            pkts_out: 0,
            pkts_out_lost: 0,
            pkts_out_rtx: 0,
        })
    }

    /// Starts a client connection (spec §4.7 "idle -> opening on client
    /// connect").
    pub fn connect(
        peer_addr: SocketAddr,
        config: Config,
        tls: Box<dyn TlsEngine + Send>,
        rng: &mut dyn RngCore,
    ) -> QuicResult<Self> {
        let scid = ConnectionId::random(rng, config.client_scid_len);
        let dcid = ConnectionId::random(rng, 8);
        let mut reset_token = [0u8; 16];
        rng.fill_bytes(&mut reset_token);
        let (client_secrets, _) = crate::packet::protection::derive_initial_secrets(dcid.as_slice())?;
        let mut conn = Self::base(
            Role::Client,
            VERSION_CURRENT,
            peer_addr,
            scid,
            dcid,
            reset_token,
            config,
            tls,
        )?;
        conn.spaces.initial.crypto = Some(client_secrets);
        conn.state = ConnectionState::Opening;
        Ok(conn)
    }

    /// Accepts a server connection once a valid client Initial has produced
    /// a destination CID to key off (spec §4.7 "idle -> opening on server
    /// reception of a valid Initial", §4.5 step 4).
    pub fn accept(
        peer_addr: SocketAddr,
        client_dcid: &[u8],
        client_scid: ConnectionId,
        config: Config,
        tls: Box<dyn TlsEngine + Send>,
        rng: &mut dyn RngCore,
    ) -> QuicResult<Self> {
        let local_scid = ConnectionId::random(rng, config.server_scid_len);
        let mut reset_token = [0u8; 16];
        rng.fill_bytes(&mut reset_token);
        let (_, server_secrets) = crate::packet::protection::derive_initial_secrets(client_dcid)?;
        let mut conn = Self::base(
            Role::Server,
            VERSION_CURRENT,
            peer_addr,
            local_scid,
            client_scid,
            reset_token,
            config,
            tls,
        )?;
        conn.spaces.initial.crypto = Some(server_secrets);
        conn.state = ConnectionState::Opening;
        Ok(conn)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn local_cid_hex(&self) -> String {
        self.scids.active().map(|c| c.cid.to_hex()).unwrap_or_default()
    }

    pub fn local_cid(&self) -> Option<&ConnectionId> {
        self.scids.active().map(|c| &c.cid)
    }

    /// `info(conn)` (spec §6.1).
    pub fn info(&self) -> ConnInfo {
        ConnInfo {
            pkts_in_valid: self.pkts_in_valid,
            pkts_in_invalid: self.pkts_in_invalid,
            pkts_out: self.pkts_out,
            pkts_out_lost: self.pkts_out_lost,
            pkts_out_rtx: self.pkts_out_rtx,
            rtt: self.recovery.rtt.smoothed_rtt,
            rttvar: self.recovery.rtt.rttvar,
            cwnd: self.recovery.cc.cwnd,
            ssthresh: self.recovery.cc.ssthresh,
            pto_cnt: self.recovery.pto_count,
        }
    }

    // ---- handshake driving -------------------------------------------------

    /// Feeds the TLS engine and drains whatever it produces (spec §4.3, §9
    /// "TLS callback surface"). Called once after construction for the
    /// client's first flight, and again after every CRYPTO frame.
    pub fn drive_tls(&mut self, now: Instant) -> QuicResult<()> {
        let is_first_flight = self.role == Role::Client && self.crypto[0].out_buf.is_empty();
        let steps = if is_first_flight { self.tls.start()? } else { Vec::new() };
        self.apply_handshake_steps(steps, now)?;
        // Offered only on the client's first flight: a resumed session with
        // early data allowed produces 0-RTT keys before any Handshake bytes
        // have even been exchanged (spec §4.3 "0-RTT acceptance").
        if is_first_flight {
            if let Some(keys) = self.tls.zero_rtt_keys() {
                let ctx = keys.into_contexts(self.role == Role::Server)?;
                self.install_keys(Epoch::ZeroRtt, ctx);
            }
        }
        Ok(())
    }

    fn apply_handshake_steps(&mut self, steps: Vec<HandshakeStep>, now: Instant) -> QuicResult<()> {
        for step in steps {
            match step {
                HandshakeStep::Emit { epoch, data } => {
                    self.crypto[crypto_idx(epoch)].out_buf.extend_from_slice(&data);
                }
                HandshakeStep::Keys(keys) => {
                    let epoch = keys.epoch;
                    let ctx = keys.into_contexts(self.role == Role::Server)?;
                    self.install_keys(epoch, ctx);
                }
                HandshakeStep::PeerTransportParameters(params) => {
                    if params.initial_max_data > self.max_data_out {
                        self.max_data_out = params.initial_max_data;
                    }
                    self.max_streams[0] = self.max_streams[0].max(params.initial_max_streams_bidi);
                    self.max_streams[1] = self.max_streams[1].max(params.initial_max_streams_uni);
                    self.peer_params = Some(params);
                }
                HandshakeStep::Complete => {
                    self.state = self.state.on_handshake_complete();
                    if self.role == Role::Server {
                        self.queue_control_frame(Frame::HandshakeDone);
                    }
                    self.key_phase_flip_deadline = Some(now + self.config.tls_key_update_frequency);
                }
            }
        }
        Ok(())
    }

    fn install_keys(&mut self, epoch: Epoch, ctx: CryptoContext) {
        match epoch {
            Epoch::Initial => self.spaces.initial.crypto = Some(ctx),
            Epoch::Handshake => self.spaces.handshake.crypto = Some(ctx),
            Epoch::ZeroRtt => self.spaces.application.zero_rtt_crypto = Some(ctx),
            Epoch::OneRtt => {
                let phase = self.spaces.application.key_phase_in;
                *self.spaces.application.one_rtt_mut(phase) = Some(ctx);
            }
        }
    }

    fn crypto_context_for_tx(&self, epoch: Epoch) -> Option<&CryptoContext> {
        match epoch {
            Epoch::Initial => self.spaces.initial.crypto.as_ref(),
            Epoch::Handshake => self.spaces.handshake.crypto.as_ref(),
            Epoch::ZeroRtt => self.spaces.application.zero_rtt_crypto.as_ref(),
            Epoch::OneRtt => self.spaces.application.one_rtt(self.spaces.application.key_phase_out),
        }
    }

    fn crypto_context_for_rx(&self, epoch: Epoch) -> Option<&CryptoContext> {
        match epoch {
            Epoch::Initial => self.spaces.initial.crypto.as_ref(),
            Epoch::Handshake => self.spaces.handshake.crypto.as_ref(),
            Epoch::ZeroRtt => self.spaces.application.zero_rtt_crypto.as_ref(),
            Epoch::OneRtt => self.spaces.application.one_rtt(self.spaces.application.key_phase_in),
        }
    }

    // ---- receive path -------------------------------------------------

    /// Processes one UDP datagram, splitting out coalesced packets (spec
    /// §4.5). `from` lets the migration check (step 8) compare against the
    /// connection's current peer address.
    pub fn receive(&mut self, datagram: &mut [u8], from: SocketAddr, now: Instant) -> QuicResult<()> {
        let mut offset = 0usize;
        while offset < datagram.len() {
            let remaining = &mut datagram[offset..];
            let first = remaining[0];
            if first & 0b1000_0000 != 0 {
                match self.receive_long(remaining, now) {
                    Ok(0) => break,
                    Ok(consumed) => offset += consumed,
                    Err(e) => {
                        trace!(error = %e, "dropping undecodable long-header packet");
                        self.pkts_in_invalid += 1;
                        break;
                    }
                }
            } else {
                if let Err(e) = self.receive_short(remaining, from, now) {
                    trace!(error = %e, "dropping undecodable short-header packet");
                    self.pkts_in_invalid += 1;
                }
                break; // a short-header packet is never followed by coalesced packets
            }
        }
        let idle_timeout = self
            .local_params
            .idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.idle_timeout);
        self.idle_deadline = Some(now + idle_timeout);
        Ok(())
    }

    fn receive_long(&mut self, buf: &mut [u8], now: Instant) -> QuicResult<usize> {
        // The dcid/scid/version triple is the only part of a long header
        // guaranteed stable across versions (RFC 8999), so peek that first,
        // before assuming the rest of the packet is our own wire format.
        let invariant = {
            let mut peek = Reader::new(buf);
            crate::packet::header::decode_invariant_prefix(&mut peek)?
        };

        if invariant.version == 0 {
            let mut r = Reader::new(buf);
            let vn = crate::packet::header::VersionNegotiationPacket::decode(&mut r)?;
            self.on_version_negotiation(&vn.versions)?;
            return Ok(buf.len());
        }
        if invariant.version != self.version {
            trace!(version = invariant.version, expected = self.version, "dropping packet with unexpected version");
            return Ok(buf.len());
        }

        // Peek the type/epoch without mutating anything, so we know which
        // crypto context applies before header protection is removed.
        let epoch = {
            let mut peek = Reader::new(buf);
            let prefix = crate::packet::header::decode_long_prefix(&mut peek)?;
            prefix.header.ty.epoch()
        };
        let space_id = epoch.pn_space();

        let crypto = match self.crypto_context_for_rx(epoch) {
            Some(c) => c,
            None => {
                trace!(?epoch, "no keys yet for epoch, dropping packet");
                return Ok(buf.len());
            }
        };
        let largest_acked = self.spaces.get(space_id).largest_acked;
        let decoded: DecodedLong = packet::decode_long(buf, crypto, largest_acked)?;
        self.pkts_in_valid += 1;

        if self.spaces.get(space_id).is_duplicate(decoded.pn) {
            return Ok(decoded.consumed);
        }
        self.spaces.get_mut(space_id).on_pkt_received(decoded.pn);

        self.process_payload(epoch, &decoded.payload, now)?;
        Ok(decoded.consumed)
    }

    fn receive_short(&mut self, buf: &mut [u8], from: SocketAddr, now: Instant) -> QuicResult<()> {
        let dcid_len = self.scids.active().map(|c| c.cid.len()).unwrap_or(0);
        let space_id = PnSpaceId::Application;
        let phase_in = self.spaces.application.key_phase_in;
        let largest_acked = self.spaces.get(space_id).largest_acked;

        let decoded: DecodedShort = {
            let primary = self.spaces.application.one_rtt(phase_in);
            match primary {
                Some(c) => match packet::decode_short(buf, dcid_len, c, largest_acked) {
                    Ok(d) => d,
                    Err(_) => {
                        let other = self.spaces.application.one_rtt(phase_in ^ 1);
                        match other {
                            Some(c) => packet::decode_short(buf, dcid_len, c, largest_acked)?,
                            None => return Ok(()),
                        }
                    }
                },
                None => return Ok(()),
            }
        };

        self.pkts_in_valid += 1;
        if self.spaces.get(space_id).is_duplicate(decoded.pn) {
            return Ok(());
        }
        if decoded.key_phase != (phase_in != 0) {
            self.on_peer_key_update()?;
        }
        self.spin = decoded.spin;
        let largest_received_before = self.spaces.get(space_id).recv_all.largest();
        self.spaces.get_mut(space_id).on_pkt_received(decoded.pn);

        if from != self.peer_addr && largest_received_before.map_or(true, |largest| decoded.pn > largest) {
            self.migrating_to = Some(from);
            debug!(?from, "candidate peer migration, challenging new path");
        }

        self.process_payload(Epoch::OneRtt, &decoded.payload, now)
    }

    /// Client-side handling of a received Version Negotiation packet (spec
    /// §4.7, §6.2, mandatory scenario 2): picks the highest-priority version
    /// this endpoint also supports, skipping grease, and restarts the
    /// Initial handshake under it. The Initial secrets are keyed off the
    /// dcid alone, so they don't need rederiving; only the already-buffered
    /// first flight gets retransmitted under the new version.
    fn on_version_negotiation(&mut self, offered: &[u32]) -> QuicResult<()> {
        if self.role != Role::Client || self.state != ConnectionState::Opening {
            return Ok(()); // servers never process VN; ignore a stray/late one
        }
        let chosen = SUPPORTED_VERSIONS
            .iter()
            .copied()
            .find(|&v| !crate::packet::header::is_reserved_version(v) && offered.contains(&v));
        let Some(version) = chosen else {
            self.state = self.state.on_handshake_failed();
            return Ok(());
        };
        self.version = version;
        self.spaces.initial = PnSpace::new(PnSpaceId::Initial);
        let (client_secrets, _) = crate::packet::protection::derive_initial_secrets(self.active_dcid.as_slice())?;
        self.spaces.initial.crypto = Some(client_secrets);
        self.crypto[0].out_sent = 0;
        Ok(())
    }

    /// Derives the next key-phase generation on an unexpected flip in the
    /// peer's key-phase bit (spec §4.10).
    fn on_peer_key_update(&mut self) -> QuicResult<()> {
        let phase_in = self.spaces.application.key_phase_in;
        let current = self
            .spaces
            .application
            .one_rtt(phase_in)
            .ok_or(Error::InvalidState)?;
        let next = current.next_generation()?;
        let next_phase = phase_in ^ 1;
        *self.spaces.application.one_rtt_mut(next_phase) = Some(next);
        self.spaces.application.key_phase_in = next_phase;
        Ok(())
    }

    fn process_payload(&mut self, epoch: Epoch, payload: &[u8], now: Instant) -> QuicResult<()> {
        let mut r = Reader::new(payload);
        while !r.is_empty() {
            let frame = Frame::decode(&mut r)?;
            require(
                frame.frame_type().allowed_in(epoch),
                "frame not permitted in this epoch",
            )?;
            self.process_frame(epoch, frame, now)?;
        }
        Ok(())
    }

    fn process_frame(&mut self, epoch: Epoch, frame: Frame, now: Instant) -> QuicResult<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack {
                largest_acked,
                ack_delay,
                ranges,
                ecn,
            } => self.on_ack_received(epoch, largest_acked, ack_delay, &ranges, ecn, now)?,
            Frame::Crypto { offset, data } => self.on_crypto(epoch, offset, &data, now)?,
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => self.on_stream_data(stream_id, offset, &data, fin)?,
            Frame::ResetStream { stream_id, .. } => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.state = crate::stream::StreamState::Closed;
                }
            }
            Frame::StopSending { stream_id, .. } => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.out_fin = true;
                }
            }
            Frame::NewToken { .. } => {}
            Frame::MaxData { max } => {
                if max > self.max_data_out {
                    self.max_data_out = max;
                }
            }
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.on_max_stream_data(max);
                }
            }
            Frame::MaxStreamsBidi { max } => {
                if max > self.max_streams[0] {
                    self.max_streams[0] = max;
                }
            }
            Frame::MaxStreamsUni { max } => {
                if max > self.max_streams[1] {
                    self.max_streams[1] = max;
                }
            }
            Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlockedBidi { .. }
            | Frame::StreamsBlockedUni { .. } => {}
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                crate::cid::validate_new_connection_id(seq, retire_prior_to, cid.len() as u8)?;
                self.dcids.insert(IssuedCid {
                    seq,
                    retire_prior_to,
                    cid: ConnectionId::new(cid)?,
                    reset_token: Some(reset_token),
                    retired: false,
                })?;
            }
            Frame::RetireConnectionId { seq } => {
                self.scids.retire(seq)?;
            }
            Frame::PathChallenge { data } => {
                self.queue_control_frame(Frame::PathResponse { data });
            }
            Frame::PathResponse { .. } => {
                if let Some(addr) = self.migrating_to.take() {
                    self.peer_addr = addr; // path validated by the matching PATH_RESPONSE
                }
            }
            Frame::ConnectionClose { .. } => {
                self.state = self.state.on_peer_close();
            }
            Frame::HandshakeDone => {
                self.handshake_done_rxed = true;
            }
        }
        Ok(())
    }

    fn on_crypto(&mut self, epoch: Epoch, offset: u64, data: &[u8], now: Instant) -> QuicResult<()> {
        let stream = &mut self.crypto[crypto_idx(epoch)];
        require(offset == stream.in_offset, "out-of-order CRYPTO data is unsupported")?;
        stream.in_offset += data.len() as u64;
        let steps = self.tls.advance(epoch, data)?;
        self.apply_handshake_steps(steps, now)?;
        // Server side: the ClientHello (carried in Initial CRYPTO data) is
        // what the handshake needs to decide 0-RTT acceptance, so the keys
        // can become available as soon as it's been processed.
        if self.role == Role::Server && self.spaces.application.zero_rtt_crypto.is_none() {
            if let Some(keys) = self.tls.zero_rtt_keys() {
                let ctx = keys.into_contexts(true)?;
                self.install_keys(Epoch::ZeroRtt, ctx);
            }
        }
        Ok(())
    }

    fn on_stream_data(&mut self, stream_id: u64, offset: u64, data: &[u8], fin: bool) -> QuicResult<()> {
        let recv_limit = self.stream_recv_limit(stream_id);
        self.get_or_create_stream(stream_id, recv_limit)?;
        let end = offset + data.len() as u64;
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::StreamState(stream_id))?;
        let delta = stream.highest_offset_delta(end);
        if self.in_data_sum + delta > self.max_data_in {
            return Err(Error::FlowControl);
        }
        let grow = stream.on_data_received(offset, data, fin)?;
        stream.advance_highest_offset(end);
        self.in_data_sum += delta;
        if grow {
            let new_max = stream.grow_in_data_max();
            self.queue_control_frame(Frame::MaxStreamData {
                stream_id,
                max: new_max,
            });
        }
        if self.in_data_sum >= self.max_data_in / 2 {
            self.max_data_in *= 2;
            self.queue_control_frame(Frame::MaxData { max: self.max_data_in });
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        epoch: Epoch,
        largest_acked: u64,
        ack_delay: u64,
        ranges: &[AckRange],
        ecn: Option<(u64, u64, u64)>,
        now: Instant,
    ) -> QuicResult<()> {
        let space_id = epoch.pn_space();
        let max_ack_delay = self
            .peer_params
            .as_ref()
            .map(|p| Duration::from_millis(p.max_ack_delay_ms))
            .unwrap_or(self.config.max_ack_delay);
        let ack_delay_exponent = self.peer_params.as_ref().map(|p| p.ack_delay_exponent).unwrap_or(3);

        let mut newest_newly_acked_sent_at: Option<Instant> = None;
        let mut acked_pns = Vec::new();
        for range in ranges {
            for pn in range.smallest..=range.largest {
                if let Some(pkt) = self.spaces.get_mut(space_id).sent.remove(&pn) {
                    acked_pns.push(pn);
                    if pn == largest_acked {
                        let delay = if space_id == PnSpaceId::Application {
                            Duration::from_micros(ack_delay << ack_delay_exponent).min(max_ack_delay)
                        } else {
                            Duration::ZERO
                        };
                        let rtt_sample = now.saturating_duration_since(pkt.time_sent);
                        self.recovery.rtt.update(rtt_sample, delay);
                    }
                    newest_newly_acked_sent_at =
                        Some(newest_newly_acked_sent_at.map_or(pkt.time_sent, |t| t.max(pkt.time_sent)));
                    self.recovery.cc.on_packet_acked(pkt.size as u64);
                }
            }
        }
        self.ack_crypto(space_id, &acked_pns);
        if space_id == PnSpaceId::Application {
            for s in self.streams.values_mut() {
                s.ack(&acked_pns);
            }
        }
        {
            let space = self.spaces.get_mut(space_id);
            space.largest_acked = Some(space.largest_acked.map_or(largest_acked, |l| l.max(largest_acked)));
        }

        if let Some(sent_at) = newest_newly_acked_sent_at {
            self.recovery.cc.maybe_exit_recovery(sent_at);
        }

        if let Some((_, _, ce)) = ecn {
            let space = self.spaces.get_mut(space_id);
            if ce > space.ecn_counts.ce {
                space.ecn_counts.ce = ce;
                self.recovery.cc.on_congestion_event(now);
            }
        }

        self.recovery.pto_count = 0;
        let lost = {
            let space = self.spaces.get_mut(space_id);
            self.recovery.detect_lost_packets(space, now)
        };
        for (_, pkt) in &lost {
            self.recovery.cc.on_packet_lost(pkt.size as u64);
        }
        if !lost.is_empty() {
            let lost_pns: Vec<u64> = lost.iter().map(|(pn, _)| *pn).collect();
            self.reclaim_lost_crypto(space_id, &lost_pns);
            if space_id == PnSpaceId::Application {
                for s in self.streams.values_mut() {
                    if s.reclaim_lost(&lost_pns) {
                        self.pkts_out_lost += 1;
                        self.pkts_out_rtx += 1;
                    }
                }
            }
        }
        if let Some((_, largest_lost)) = lost.iter().max_by_key(|(pn, _)| *pn) {
            self.recovery.cc.on_congestion_event(largest_lost.time_sent);
        }
        Ok(())
    }

    // ---- stream API ----------------------------------------------------

    fn stream_recv_limit(&self, id: u64) -> u64 {
        if !stream::is_bidi(id) {
            return self.local_params.initial_max_stream_data_uni;
        }
        if stream::is_local(id, self.role) {
            self.local_params.initial_max_stream_data_bidi_local
        } else {
            self.local_params.initial_max_stream_data_bidi_remote
        }
    }

    /// The peer's advertised limit for how much *we* may send on `id` (spec
    /// §4.8; RFC 9000 §4.1's bidi-local/bidi-remote are relative to whichever
    /// endpoint sent the transport parameter, so they swap perspective here).
    fn stream_send_limit(&self, id: u64) -> u64 {
        let Some(peer) = &self.peer_params else {
            return 0;
        };
        if !stream::is_bidi(id) {
            return peer.initial_max_stream_data_uni;
        }
        if stream::is_local(id, self.role) {
            peer.initial_max_stream_data_bidi_remote
        } else {
            peer.initial_max_stream_data_bidi_local
        }
    }

    fn get_or_create_stream(&mut self, id: u64, recv_limit: u64) -> QuicResult<&mut Stream> {
        if !self.streams.contains_key(&id) {
            require(
                !stream::is_local(id, self.role),
                "peer referenced a stream id it did not open",
            )?;
            let send_limit = self.stream_send_limit(id);
            let mut s = Stream::new(id, recv_limit);
            s.out_data_max = send_limit;
            self.streams.insert(id, s);
        }
        Ok(self.streams.get_mut(&id).unwrap())
    }

    /// The peer's currently-tracked MAX_STREAMS limit for this
    /// directionality, or `None` before its transport parameters arrive (in
    /// which case `reserve_stream` does not yet enforce one).
    fn peer_stream_limit(&self, bidi: bool) -> Option<u64> {
        if self.peer_params.is_none() {
            return None;
        }
        Some(self.max_streams[stream_index(bidi)])
    }

    /// `rsv_stream` (spec §6.1, §4.8): reserves the next local stream id of
    /// the requested directionality, blocking and queuing STREAMS_BLOCKED
    /// once the peer's advertised MAX_STREAMS limit is reached.
    pub fn reserve_stream(&mut self, bidi: bool) -> QuicResult<u64> {
        let idx = stream_index(bidi);
        if let Some(limit) = self.peer_stream_limit(bidi) {
            if self.open_streams[idx] >= limit {
                self.queue_control_frame(if bidi {
                    Frame::StreamsBlockedBidi { limit }
                } else {
                    Frame::StreamsBlockedUni { limit }
                });
                return Err(Error::StreamLimit(self.next_stream_id[idx]));
            }
        }
        let id = self.next_stream_id[idx];
        self.next_stream_id[idx] += 4;
        self.open_streams[idx] += 1;
        let recv_limit = self.stream_recv_limit(id);
        let send_limit = self.stream_send_limit(id);
        let mut s = Stream::new(id, recv_limit);
        s.out_data_max = send_limit;
        self.streams.insert(id, s);
        Ok(id)
    }

    pub fn stream_write(&mut self, id: u64, data: &[u8], fin: bool) -> QuicResult<usize> {
        let conn_room = self.max_data_out.saturating_sub(self.out_data_sum);
        let allowed = (data.len() as u64).min(conn_room) as usize;
        let stream = self.streams.get_mut(&id).ok_or(Error::StreamState(id))?;
        let written = stream.queue_write(&data[..allowed], fin && allowed == data.len())?;
        self.out_data_sum += written as u64;
        if written < data.len() {
            self.queue_control_frame(Frame::DataBlocked { limit: self.max_data_out });
        }
        Ok(written)
    }

    pub fn stream_read(&mut self, id: u64) -> QuicResult<Vec<u8>> {
        let stream = self.streams.get_mut(&id).ok_or(Error::StreamState(id))?;
        Ok(std::mem::take(&mut stream.in_buf))
    }

    /// True if `id` has buffered inbound bytes, without draining them.
    pub fn stream_has_data(&self, id: u64) -> bool {
        self.streams.get(&id).map(|s| !s.in_buf.is_empty()).unwrap_or(false)
    }

    /// True if any stream has buffered inbound bytes (spec §6.1 `read`).
    pub fn any_stream_has_data(&self) -> bool {
        self.streams.values().any(|s| !s.in_buf.is_empty())
    }

    /// `read(conn, ...)` (spec §6.1): drains the first stream with buffered
    /// inbound data.
    pub fn next_readable_stream(&mut self) -> Option<(u64, Vec<u8>)> {
        let id = *self.streams.iter().find(|(_, s)| !s.in_buf.is_empty())?.0;
        let stream = self.streams.get_mut(&id)?;
        Some((id, std::mem::take(&mut stream.in_buf)))
    }

    pub fn stream_state(&self, id: u64) -> Option<stream::StreamState> {
        self.streams.get(&id).map(|s| s.state)
    }

    /// `is_stream_closed` (spec §6.1): absent or fully closed both counts.
    pub fn is_stream_closed(&self, id: u64) -> bool {
        self.streams
            .get(&id)
            .map(|s| s.state == stream::StreamState::Closed)
            .unwrap_or(true)
    }

    /// `peer_closed_stream` (spec §6.1): the remote side has sent (and we've
    /// received) its FIN.
    pub fn peer_closed_stream(&self, id: u64) -> bool {
        matches!(
            self.streams.get(&id).map(|s| s.state),
            Some(stream::StreamState::HalfClosedRemote) | Some(stream::StreamState::Closed)
        )
    }

    /// `close_stream` (spec §6.1): finishes the local send side with no
    /// further application data.
    pub fn close_stream(&mut self, id: u64) -> QuicResult<()> {
        let stream = self.streams.get_mut(&id).ok_or(Error::StreamState(id))?;
        if !stream.out_fin {
            stream.queue_write(&[], true)?;
        }
        Ok(())
    }

    /// `free_stream` (spec §6.1): drops local bookkeeping once both sides
    /// are done with it.
    pub fn free_stream(&mut self, id: u64) {
        self.streams.remove(&id);
    }

    /// `rebind_sock(conn, use_new_dcid?)` (spec §6.1): simulates a NAT
    /// rebind. With `use_new_dcid`, switches to a spare destination CID the
    /// same way a scheduled key-update migration would.
    pub fn rebind(&mut self, use_new_dcid: bool) -> QuicResult<()> {
        if use_new_dcid {
            self.maybe_migrate()?;
        }
        Ok(())
    }

    // ---- control-frame queue --------------------------------------------

    fn queue_control_frame(&mut self, frame: Frame) {
        // Control frames regenerate from live state rather than an explicit
        // RTX chain (spec §4.9 "idempotent ... need no explicit RTX").
        self.pending_control.push(frame);
    }

    // ---- send path -------------------------------------------------------

    /// Builds and protects the next outgoing packet, in Initial/Handshake/
    /// Application priority order (spec §4.4). Returns the number of bytes
    /// written and the destination address, or `None` if there is nothing
    /// to send right now.
    pub fn send(
        &mut self,
        now: Instant,
        out: &mut [u8],
        rng: &mut dyn RngCore,
    ) -> QuicResult<Option<(usize, SocketAddr)>> {
        for epoch in [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt] {
            if let Some(n) = self.send_epoch(epoch, now, out, rng)? {
                let addr = self.migrating_to.unwrap_or(self.peer_addr);
                return Ok(Some((n, addr)));
            }
        }
        Ok(None)
    }

    fn send_epoch(
        &mut self,
        epoch: Epoch,
        now: Instant,
        out: &mut [u8],
        rng: &mut dyn RngCore,
    ) -> QuicResult<Option<usize>> {
        if self.crypto_context_for_tx(epoch).is_none() {
            return Ok(None);
        }
        let space_id = epoch.pn_space();

        let mut frames = Vec::new();
        let ack_frame = self.build_ack_frame(space_id);
        let ack_included = ack_frame.is_some();
        frames.extend(ack_frame);
        let mut crypto_sent_range: Option<(u64, u64)> = None;
        {
            let stream = &mut self.crypto[crypto_idx(epoch)];
            if stream.out_sent < stream.out_buf.len() as u64 {
                let chunk_offset = stream.out_sent;
                let chunk = stream.out_buf[stream.out_sent as usize..].to_vec();
                stream.out_sent += chunk.len() as u64;
                crypto_sent_range = Some((chunk_offset, chunk.len() as u64));
                frames.push(Frame::Crypto {
                    offset: chunk_offset,
                    data: chunk,
                });
            }
        }
        let mut stream_sent: Vec<(u64, u64, usize)> = Vec::new();
        if epoch == Epoch::OneRtt {
            frames.extend(std::mem::take(&mut self.pending_control));
        }
        // 0-RTT packets may carry STREAM data (client-initiated streams
        // only, since the server never has 0-RTT keys to send with) but not
        // the rest of the control-frame vocabulary (spec §4.3).
        if epoch == Epoch::OneRtt || epoch == Epoch::ZeroRtt {
            for (&id, stream) in self.streams.iter() {
                if let Some((offset, data)) = stream.pending_send() {
                    stream_sent.push((id, offset, data.len()));
                    frames.push(Frame::Stream {
                        stream_id: id,
                        offset,
                        fin: stream.out_fin,
                        data: data.to_vec(),
                    });
                }
            }
        }

        if let ConnectionState::QueuedClose = self.state {
            if let Some(err) = &self.close_error {
                frames.push(Frame::ConnectionClose {
                    error_code: err.code,
                    frame_type: if err.is_application { None } else { Some(0) },
                    reason: err.reason.clone(),
                    is_application: err.is_application,
                });
                self.state = self.state.on_close_sent();
            }
        }

        if frames.is_empty() {
            return Ok(None);
        }

        let mut payload = vec![0u8; out.len()];
        let payload_len = {
            let mut w = Writer::new(&mut payload);
            for f in &frames {
                f.encode(&mut w)?;
            }
            w.pos()
        };
        let payload = payload[..payload_len].to_vec();

        let pn = self.spaces.get_mut(space_id).alloc_pn();
        let largest_acked = self.spaces.get(space_id).largest_acked;
        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        let is_crypto = frames.iter().any(|f| matches!(f, Frame::Crypto { .. }));
        let crypto = self.crypto_context_for_tx(epoch).unwrap();

        let written = match epoch {
            Epoch::Initial | Epoch::Handshake | Epoch::ZeroRtt => {
                let ty = match epoch {
                    Epoch::Initial => PacketType::Initial,
                    Epoch::Handshake => PacketType::Handshake,
                    Epoch::ZeroRtt => PacketType::ZeroRtt,
                    Epoch::OneRtt => unreachable!(),
                };
                let header = LongHeader {
                    ty,
                    version: self.version,
                    dcid: self.active_dcid.clone(),
                    scid: self.scids.active().map(|c| c.cid.clone()).unwrap_or_else(ConnectionId::empty),
                    token: Vec::new(),
                    odcid: None,
                };
                packet::encode_long(&header, pn, largest_acked, &payload, crypto, rng, out)?
            }
            Epoch::OneRtt => {
                let header = ShortHeader {
                    dcid: self.active_dcid.clone(),
                    spin: self.spin,
                    key_phase: self.spaces.application.key_phase_out != 0,
                };
                packet::encode_short(&header, pn, largest_acked, &payload, crypto, out)?
            }
        };

        self.spaces.get_mut(space_id).on_pkt_sent(
            pn,
            SentPacket {
                time_sent: now,
                size: written,
                ack_eliciting,
                in_flight: true,
                is_crypto,
                rtx_of: None,
            },
        );
        if let Some((offset, len)) = crypto_sent_range {
            self.crypto[crypto_idx(epoch)].in_flight.push((pn, offset, len));
        }
        for (id, _offset, len) in stream_sent {
            if let Some(s) = self.streams.get_mut(&id) {
                s.mark_sent(pn, len);
            }
        }
        if ack_included {
            let space = self.spaces.get_mut(space_id);
            space.recv_since_last_ack = crate::interval_set::IntervalSet::new();
            space.on_ack_tx();
        }
        self.recovery.cc.on_packet_sent(written as u64);
        self.pkts_out += 1;
        Ok(Some(written))
    }

    /// Rewinds a CRYPTO stream's `out_sent` so a lost byte range gets
    /// resent, dropping (or keeping, if still unacked) in-flight entries
    /// for `space_id` whose packet number is in `lost_pns`.
    fn reclaim_lost_crypto(&mut self, space_id: PnSpaceId, lost_pns: &[u64]) {
        let stream = &mut self.crypto[crypto_idx_for_space(space_id)];
        let mut rewind_to = None;
        stream.in_flight.retain(|(pn, offset, _len)| {
            if lost_pns.contains(pn) {
                rewind_to = Some(rewind_to.map_or(*offset, |r: u64| r.min(*offset)));
                false
            } else {
                true
            }
        });
        if let Some(offset) = rewind_to {
            stream.out_sent = stream.out_sent.min(offset);
            self.pkts_out_lost += 1;
            self.pkts_out_rtx += 1;
        }
    }

    /// Drops in-flight CRYPTO bookkeeping for newly-acked packet numbers.
    fn ack_crypto(&mut self, space_id: PnSpaceId, acked_pns: &[u64]) {
        let stream = &mut self.crypto[crypto_idx_for_space(space_id)];
        stream.in_flight.retain(|(pn, _, _)| !acked_pns.contains(pn));
    }

    /// Builds an ACK frame for every packet-number range received since the
    /// last ACK was sent in this space (spec §4.5 step 10), or `None` if
    /// there is nothing to acknowledge.
    fn build_ack_frame(&self, space_id: PnSpaceId) -> Option<Frame> {
        let space = self.spaces.get(space_id);
        if space.recv_since_last_ack.is_empty() {
            return None;
        }
        let largest_acked = space.recv_since_last_ack.largest()?;
        let mut ranges = Vec::new();
        for (lo, hi) in space.recv_since_last_ack.ranges_newest_first() {
            ranges.push(AckRange { smallest: lo, largest: hi });
        }
        Some(Frame::Ack {
            largest_acked,
            ack_delay: 0,
            ranges,
            ecn: None,
        })
    }

    // ---- timers ------------------------------------------------------

    pub fn next_timeout(&self) -> Option<Instant> {
        let spaces = self.spaces.all();
        let has_1rtt = self
            .spaces
            .application
            .one_rtt(self.spaces.application.key_phase_out)
            .is_some();
        let max_ack_delay = self
            .peer_params
            .as_ref()
            .map(|p| Duration::from_millis(p.max_ack_delay_ms))
            .unwrap_or(self.config.max_ack_delay);
        let crypto_unacked = self.crypto.iter().any(|c| c.out_sent < c.out_buf.len() as u64);
        let loss_timer = self
            .recovery
            .loss_detection_timer(&spaces, has_1rtt, crypto_unacked, max_ack_delay);
        [loss_timer, self.idle_deadline, self.key_phase_flip_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Drives whichever timer fired (spec §4.7 "closing-alarm", §4.9 PTO,
    /// §4.10 key-flip).
    pub fn on_timeout(&mut self, now: Instant) -> QuicResult<()> {
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                self.state = self.state.on_local_close();
                self.state = self.state.on_closing_alarm();
                return Ok(());
            }
        }
        if let Some(deadline) = self.key_phase_flip_deadline {
            if now >= deadline && !self.config.disable_migration && self.config.enable_tls_key_updates {
                self.maybe_migrate()?;
                self.key_phase_flip_deadline = Some(now + self.config.tls_key_update_frequency);
            }
        }
        for space_id in PnSpaceId::ALL {
            let lost = {
                let space = self.spaces.get_mut(space_id);
                self.recovery.detect_lost_packets(space, now)
            };
            for (_, pkt) in &lost {
                self.recovery.cc.on_packet_lost(pkt.size as u64);
            }
            if !lost.is_empty() {
                let lost_pns: Vec<u64> = lost.iter().map(|(pn, _)| *pn).collect();
                self.reclaim_lost_crypto(space_id, &lost_pns);
                if space_id == PnSpaceId::Application {
                    for s in self.streams.values_mut() {
                        if s.reclaim_lost(&lost_pns) {
                            self.pkts_out_lost += 1;
                            self.pkts_out_rtx += 1;
                        }
                    }
                }
            }
            if let Some((_, largest_lost)) = lost.iter().max_by_key(|(pn, _)| *pn) {
                self.recovery.cc.on_congestion_event(largest_lost.time_sent);
                if self.recovery.is_persistent_congestion(&lost, self.config.max_ack_delay) {
                    warn!(?space_id, "persistent congestion detected, collapsing to the minimum window");
                    self.recovery.cc.collapse_to_minimum_window();
                }
            }
        }
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining) {
            self.state = self.state.on_closing_alarm();
        }
        Ok(())
    }

    /// Switches the active destination CID to a fresh one and retires the
    /// old one (spec §4.7 "Migration"), if a spare DCID is available.
    fn maybe_migrate(&mut self) -> QuicResult<()> {
        let current_seq = self.dcids.active_seq().unwrap_or(0);
        let next = self
            .dcids
            .iter()
            .filter(|c| !c.retired && c.seq > current_seq)
            .min_by_key(|c| c.seq)
            .map(|c| c.seq);
        if let Some(seq) = next {
            if let Some(entry) = self.dcids.get(seq) {
                self.active_dcid = entry.cid.clone();
            }
            if let Some(retired) = self.dcids.retire(current_seq)? {
                self.queue_control_frame(Frame::RetireConnectionId { seq: retired.seq });
            }
            self.spin = false;
        }
        Ok(())
    }

    /// Every stateless-reset token the peer has told us about for this
    /// connection: the one carried in its transport parameters (its seq-0
    /// CID) plus any issued via NEW_CONNECTION_ID (spec §4.5 step 4).
    pub fn peer_reset_tokens(&self) -> Vec<[u8; 16]> {
        let mut tokens: Vec<[u8; 16]> = self
            .peer_params
            .as_ref()
            .and_then(|p| p.stateless_reset_token)
            .into_iter()
            .collect();
        tokens.extend(self.dcids.iter().filter_map(|c| c.reset_token));
        tokens
    }

    /// Transitions into draining on a matched stateless reset (spec §4.5
    /// step 4): the peer has lost state for this connection, so treat it
    /// like any other peer-initiated close rather than keep retransmitting.
    pub fn on_stateless_reset(&mut self) {
        self.state = self.state.on_peer_close();
    }

    /// Primes provisional send-side limits from a previous session's
    /// remembered transport parameters (spec §6.4), so 0-RTT stream data has
    /// flow-control room to leave before this handshake's real parameters
    /// arrive. `apply_handshake_steps` overwrites these the moment the
    /// peer's actual transport parameters are processed.
    /// The peer's transport parameters, once the handshake has delivered
    /// them (spec §6.3), for persisting alongside a new session ticket.
    pub fn peer_transport_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    pub fn prime_zero_rtt_limits(&mut self, remembered: &TransportParameters) {
        self.max_data_out = remembered.initial_max_data;
        self.max_streams[0] = remembered.initial_max_streams_bidi;
        self.max_streams[1] = remembered.initial_max_streams_uni;
        self.peer_params = Some(remembered.clone());
    }

    /// `close(conn, code, reason)` (spec §6.1): queues a CONNECTION_CLOSE
    /// for the next outgoing packet.
    pub fn close(&mut self, code: u64, is_application: bool, reason: Vec<u8>) {
        self.close_error = Some(CloseError {
            code,
            is_application,
            reason,
        });
        self.state = self.state.on_local_close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tls::EpochKeys;

    struct NoopTls;
    impl TlsEngine for NoopTls {
        fn advance(&mut self, _epoch: Epoch, _data: &[u8]) -> QuicResult<Vec<HandshakeStep>> {
            Ok(Vec::new())
        }
        fn start(&mut self) -> QuicResult<Vec<HandshakeStep>> {
            Ok(Vec::new())
        }
        fn alpn_protocol(&self) -> Option<&[u8]> {
            None
        }
        fn server_name(&self) -> Option<&str> {
            None
        }
        fn is_handshaking(&self) -> bool {
            true
        }
        fn zero_rtt_keys(&self) -> Option<EpochKeys> {
            None
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn client_connect_starts_in_opening_state_with_initial_keys() {
        let mut rng = rand::thread_rng();
        let conn = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        assert_eq!(conn.state, ConnectionState::Opening);
        assert!(conn.spaces.initial.crypto.is_some());
    }

    #[test]
    fn reserved_stream_ids_step_by_four() {
        let mut rng = rand::thread_rng();
        let mut conn = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        let first = conn.reserve_stream(true).unwrap();
        let second = conn.reserve_stream(true).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 4);
    }

    #[test]
    fn handshake_complete_transitions_to_established_and_queues_handshake_done() {
        let mut rng = rand::thread_rng();
        let mut conn = Connection::accept(
            addr(),
            &[1, 2, 3, 4, 5, 6, 7, 8],
            ConnectionId::new(vec![9; 8]).unwrap(),
            Config::default(),
            Box::new(NoopTls),
            &mut rng,
        )
        .unwrap();
        conn.apply_handshake_steps(vec![HandshakeStep::Complete], Instant::now()).unwrap();
        assert_eq!(conn.state, ConnectionState::Established);
        assert!(conn.pending_control.iter().any(|f| matches!(f, Frame::HandshakeDone)));
    }

    #[test]
    fn local_close_queues_connection_close_on_next_send() {
        let mut rng = rand::thread_rng();
        let mut conn = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        conn.state = ConnectionState::Established;
        conn.close(0, true, b"done".to_vec());
        assert_eq!(conn.state, ConnectionState::QueuedClose);
        assert!(conn.close_error.is_some());
    }

    #[test]
    fn stream_send_limit_is_zero_before_peer_params_arrive() {
        let mut rng = rand::thread_rng();
        let conn = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        assert_eq!(conn.stream_send_limit(0), 0);
    }

    #[test]
    fn connection_level_flow_control_rejects_exceeding_max_data() {
        let mut rng = rand::thread_rng();
        let mut conn = Connection::accept(
            addr(),
            &[1, 2, 3, 4, 5, 6, 7, 8],
            ConnectionId::new(vec![9; 8]).unwrap(),
            Config::default(),
            Box::new(NoopTls),
            &mut rng,
        )
        .unwrap();
        conn.max_data_in = 10;
        assert!(conn.on_stream_data(0, 0, &[0u8; 5], false).is_ok());
        assert_eq!(conn.in_data_sum, 5);
        assert!(conn.on_stream_data(4, 0, &[0u8; 10], false).is_err());
    }

    #[test]
    fn reserve_stream_blocks_at_peer_advertised_limit() {
        let mut rng = rand::thread_rng();
        let mut conn = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        conn.peer_params = Some(TransportParameters::default());
        conn.max_streams[0] = 1;
        assert!(conn.reserve_stream(true).is_ok());
        assert!(conn.reserve_stream(true).is_err());
        assert!(conn
            .pending_control
            .iter()
            .any(|f| matches!(f, Frame::StreamsBlockedBidi { .. })));
    }
}
