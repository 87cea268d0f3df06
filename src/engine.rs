//! Process-wide cooperative event loop and public API (spec §5, §6.1).
//!
//! `Engine` owns one UDP socket and every [`Connection`] multiplexed over
//! it: a slab of live connections, a `by_dcid` lookup table keyed on
//! whatever connection id the peer will echo back to us, an accept queue
//! for the server role, and a [`BufferPool`]-backed receive path. Every
//! public method below is a spec §5 "API call": it drives the same loop
//! (non-blocking UDP receive batch, per-connection packet processing,
//! scheduled TX, timer firing) until its own sentinel condition is met,
//! then returns. The `&mut self` receiver is what "only one API call may be
//! active at a time" compiles down to -- there is no reentrant access.
//!
//! The loop itself runs on a single-threaded Tokio runtime (already a
//! dependency for its `UdpSocket`); every blocking API call drives that
//! runtime with `block_on` rather than spawning tasks, so the cooperative,
//! one-call-at-a-time model holds regardless of Tokio's own scheduler.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::runtime::{Builder, Runtime};
use tracing::trace;

use crate::buffer::{BufferPool, MAX_DATAGRAM_SIZE};
use crate::codec::{Reader, Writer};
use crate::config::Config;
use crate::connection::{is_supported_version, ConnInfo, Connection, SUPPORTED_VERSIONS};
use crate::packet::header::{decode_invariant_prefix, decode_long_prefix, decode_short_prefix, VersionNegotiationPacket};
use crate::packet::types::PacketType;
use crate::result::{require, Error, QuicResult};
use crate::stream::StreamState;
use crate::ticket_store::{Ticket, TicketStore, TicketStoreSessionCache};
use crate::tls::{RustlsClientEngine, RustlsServerEngine};
use crate::transport_params::TransportParameters;

/// Opaque handle into the engine's connection slab (spec §3 "conn").
pub type ConnHandle = usize;

struct ConnSlot {
    conn: Connection,
    is_new_server_conn: bool,
}

pub struct Engine {
    interface: String,
    socket: Option<UdpSocket>,
    runtime: Runtime,

    conns: slab::Slab<ConnSlot>,
    /// Keyed on every connection id a peer might address a packet to us
    /// with: our own local scid once chosen, plus (for a server's not-yet-
    /// acknowledged accept) the client's original dcid, so a retransmitted
    /// first Initial still finds the connection it already created.
    by_dcid: HashMap<Vec<u8>, ConnHandle>,
    by_addr: HashMap<SocketAddr, ConnHandle>,
    /// Every stateless reset token a peer has advertised to us, across every
    /// live connection (spec §4.5 step 4): a datagram from an unknown dcid
    /// whose trailing 16 bytes match one tells us that peer has lost its
    /// connection state and we should stop retransmitting to it.
    by_reset_token: HashMap<[u8; 16], ConnHandle>,
    accept_queue: VecDeque<ConnHandle>,

    recv_pool: BufferPool,
    config: Config,
    local_cid_len: usize,

    server_tls_config: Option<Arc<rustls::ServerConfig>>,
    /// Shared (not per-connection) so a [`TicketStoreSessionCache`] handed to
    /// rustls for one `connect` call persists what it learns back here.
    ticket_store: Option<Arc<Mutex<TicketStore>>>,
}

impl Engine {
    /// `init(interface_name, conf)` (spec §6.1). The UDP socket itself isn't
    /// opened until [`Engine::bind`] or the first [`Engine::connect`].
    pub fn init(interface_name: &str, config: Config) -> QuicResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let ticket_store = match &config.ticket_store_path {
            Some(path) => Some(Arc::new(Mutex::new(TicketStore::open(path.clone())?))),
            None => None,
        };
        let local_cid_len = config.server_scid_len.max(config.client_scid_len);
        Ok(Self {
            interface: interface_name.to_string(),
            socket: None,
            runtime,
            conns: slab::Slab::new(),
            by_dcid: HashMap::new(),
            by_addr: HashMap::new(),
            by_reset_token: HashMap::new(),
            accept_queue: VecDeque::new(),
            recv_pool: BufferPool::new(config.num_bufs),
            local_cid_len,
            config,
            server_tls_config: None,
            ticket_store,
        })
    }

    fn ensure_socket(&mut self, explicit_port: Option<u16>) -> QuicResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.interface, explicit_port.unwrap_or(0));
        let socket = self.runtime.block_on(UdpSocket::bind(addr))?;
        self.socket = Some(socket);
        Ok(())
    }

    // ---- connection lifecycle --------------------------------------------

    /// `bind(engine, port)` (spec §6.1): opens the listening socket and
    /// stores the server's TLS configuration for future accepts.
    pub fn bind(&mut self, port: u16, server_config: Arc<rustls::ServerConfig>) -> QuicResult<()> {
        self.ensure_socket(Some(port))?;
        self.server_tls_config = Some(server_config);
        Ok(())
    }

    /// `connect(engine, peer_addr, peer_name, early_data?, fin?, alpn?,
    /// conf?)` (spec §6.1): blocks until the handshake completes or fails.
    /// A cached ticket for `(peer_name, alpn)` (spec §6.4) is looked up and
    /// wired into the TLS engine's session cache before the handshake
    /// starts; if one exists and `early_data` is non-empty, it is queued for
    /// 0-RTT delivery using that ticket's remembered transport parameters
    /// (spec §4.3 "0-RTT acceptance", mandatory scenario 4).
    pub fn connect(
        &mut self,
        peer_addr: SocketAddr,
        server_name: rustls::ServerName,
        mut client_config: rustls::ClientConfig,
        config: Config,
        alpn: &[u8],
        early_data: Option<&[u8]>,
        fin: bool,
    ) -> QuicResult<ConnHandle> {
        self.ensure_socket(None)?;
        let sni = format!("{server_name:?}");
        if !alpn.is_empty() {
            client_config.alpn_protocols = vec![alpn.to_vec()];
        }
        let remembered = self.ticket_store.as_ref().and_then(|store| {
            let guard = store.lock().ok()?;
            let ticket = guard.find(&sni, alpn)?;
            TransportParameters::decode(&ticket.transport_params).ok()
        });
        if let Some(store) = &self.ticket_store {
            client_config.session_storage = Arc::new(TicketStoreSessionCache::new(store.clone(), sni.clone(), alpn.to_vec()));
        }
        let client_config = Arc::new(client_config);

        let local_params = config.local_transport_params();
        let tls = Box::new(RustlsClientEngine::new(client_config, server_name, local_params)?);
        let mut rng = rand::thread_rng();
        let mut conn = Connection::connect(peer_addr, config, tls, &mut rng)?;
        if let Some(remembered) = &remembered {
            conn.prime_zero_rtt_limits(remembered);
        }
        conn.drive_tls(Instant::now())?;
        if let Some(data) = early_data {
            let stream_id = conn.reserve_stream(true)?;
            conn.stream_write(stream_id, data, fin)?;
        }

        let cid = conn.local_cid().map(|c| c.as_slice().to_vec()).unwrap_or_default();
        let handle = self.conns.insert(ConnSlot {
            conn,
            is_new_server_conn: false,
        });
        self.by_dcid.insert(cid, handle);
        self.by_addr.insert(peer_addr, handle);

        self.drive_until(None, |eng| {
            eng.conns
                .get(handle)
                .map(|s| s.conn.is_established() || s.conn.is_closed())
                .unwrap_or(true)
        })?;

        if !self.conns.get(handle).map(|s| s.conn.is_established()).unwrap_or(false) {
            self.drop_connection(handle);
            return Err(Error::InvalidState);
        }
        self.save_ticket_transport_params(handle, &sni, alpn)?;
        Ok(handle)
    }

    /// Backfills the just-established peer transport parameters onto
    /// whatever ticket rustls's session cache callback already saved for
    /// this `(sni, alpn)` pair, so the next [`Engine::connect`] attempt can
    /// prime 0-RTT limits from them (spec §6.4).
    fn save_ticket_transport_params(&mut self, handle: ConnHandle, sni: &str, alpn: &[u8]) -> QuicResult<()> {
        let Some(store) = self.ticket_store.clone() else {
            return Ok(());
        };
        let Some(params) = self.conns.get(handle).and_then(|s| s.conn.peer_transport_params()) else {
            return Ok(());
        };
        let encoded = params.encode()?;
        let mut guard = store.lock().map_err(|_| Error::InvalidState)?;
        if let Some(ticket) = guard.find(sni, alpn).cloned() {
            guard.save(Ticket {
                transport_params: encoded,
                ..ticket
            })?;
        }
        Ok(())
    }

    /// `accept(engine, conf?)` (spec §6.1): blocks until a new inbound
    /// connection has produced a valid Initial.
    pub fn accept(&mut self) -> QuicResult<ConnHandle> {
        require(self.server_tls_config.is_some(), "engine is not bound as a server")?;
        self.drive_until(None, |eng| !eng.accept_queue.is_empty())?;
        self.accept_queue.pop_front().ok_or(Error::WouldBlock)
    }

    /// `close(conn, code, reason?)` (spec §6.1): queues CONNECTION_CLOSE,
    /// drives the closing handshake for a bounded linger, then frees the
    /// connection regardless of whether the peer acknowledged it.
    pub fn close(&mut self, handle: ConnHandle, code: u64, is_application: bool, reason: Vec<u8>) -> QuicResult<()> {
        {
            let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
            slot.conn.close(code, is_application, reason);
        }
        let deadline = Instant::now() + Duration::from_secs(3);
        self.drive_until(Some(deadline), |eng| {
            eng.conns.get(handle).map(|s| s.conn.is_closed()).unwrap_or(true)
        })?;
        self.drop_connection(handle);
        Ok(())
    }

    fn drop_connection(&mut self, handle: ConnHandle) {
        if let Some(slot) = self.conns.try_remove(handle) {
            if let Some(cid) = slot.conn.local_cid() {
                self.by_dcid.remove(cid.as_slice());
            }
            self.by_addr.retain(|_, h| *h != handle);
            self.by_reset_token.retain(|_, h| *h != handle);
        }
    }

    pub fn is_conn_closed(&self, handle: ConnHandle) -> bool {
        self.conns.get(handle).map(|s| s.conn.is_closed()).unwrap_or(true)
    }

    pub fn is_new_serv_conn(&self, handle: ConnHandle) -> bool {
        self.conns.get(handle).map(|s| s.is_new_server_conn).unwrap_or(false)
    }

    /// `rebind_sock(conn, use_new_dcid?)` (spec §6.1).
    pub fn rebind_sock(&mut self, handle: ConnHandle, use_new_dcid: bool) -> QuicResult<()> {
        let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
        slot.conn.rebind(use_new_dcid)
    }

    pub fn info(&self, handle: ConnHandle) -> QuicResult<ConnInfo> {
        self.conns.get(handle).map(|s| s.conn.info()).ok_or(Error::InvalidState)
    }

    /// `cid(conn, buf)` (spec §6.1): the hex form is returned directly
    /// rather than written through a caller buffer.
    pub fn cid(&self, handle: ConnHandle) -> QuicResult<String> {
        self.conns
            .get(handle)
            .map(|s| s.conn.local_cid_hex())
            .ok_or(Error::InvalidState)
    }

    /// `sid(stream)` (spec §6.1): stream handles already are their id.
    pub fn sid(&self, stream_id: u64) -> u64 {
        stream_id
    }

    // ---- streams -----------------------------------------------------------

    pub fn rsv_stream(&mut self, handle: ConnHandle, bidi: bool) -> QuicResult<u64> {
        let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
        slot.conn.reserve_stream(bidi)
    }

    /// `write(stream, buffer_list, fin?)` (spec §6.1): also drives one
    /// send pass so the data reaches the wire without a separate tick.
    pub fn write(&mut self, handle: ConnHandle, stream_id: u64, data: &[u8], fin: bool) -> QuicResult<usize> {
        let n = {
            let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
            slot.conn.stream_write(stream_id, data, fin)?
        };
        self.flush_sends(Instant::now())?;
        Ok(n)
    }

    /// `read_stream(stream, out_list, block_all?)` (spec §6.1).
    pub fn read_stream(&mut self, handle: ConnHandle, stream_id: u64, block_all: bool) -> QuicResult<Vec<u8>> {
        if block_all {
            self.drive_until(None, |eng| {
                eng.conns
                    .get(handle)
                    .map(|s| s.conn.stream_has_data(stream_id) || s.conn.is_closed())
                    .unwrap_or(true)
            })?;
        } else {
            self.drive_once()?;
        }
        let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
        slot.conn.stream_read(stream_id)
    }

    /// `read(conn, out_list, block_all?)` (spec §6.1): yields whichever
    /// stream has buffered data first.
    pub fn read(&mut self, handle: ConnHandle, block_all: bool) -> QuicResult<Option<(u64, Vec<u8>)>> {
        if block_all {
            self.drive_until(None, |eng| {
                eng.conns
                    .get(handle)
                    .map(|s| s.conn.any_stream_has_data() || s.conn.is_closed())
                    .unwrap_or(true)
            })?;
        } else {
            self.drive_once()?;
        }
        let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
        Ok(slot.conn.next_readable_stream())
    }

    pub fn close_stream(&mut self, handle: ConnHandle, stream_id: u64) -> QuicResult<()> {
        {
            let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
            slot.conn.close_stream(stream_id)?;
        }
        self.flush_sends(Instant::now())
    }

    pub fn free_stream(&mut self, handle: ConnHandle, stream_id: u64) -> QuicResult<()> {
        let slot = self.conns.get_mut(handle).ok_or(Error::InvalidState)?;
        slot.conn.free_stream(stream_id);
        Ok(())
    }

    pub fn is_stream_closed(&self, handle: ConnHandle, stream_id: u64) -> bool {
        self.conns
            .get(handle)
            .map(|s| s.conn.stream_state(stream_id).map(|st| st == StreamState::Closed).unwrap_or(true))
            .unwrap_or(true)
    }

    pub fn peer_closed_stream(&self, handle: ConnHandle, stream_id: u64) -> bool {
        self.conns
            .get(handle)
            .map(|s| s.conn.peer_closed_stream(stream_id))
            .unwrap_or(false)
    }

    /// `ready(engine, timeout_ns, out_conn?)` (spec §6.1): yields the next
    /// connection with new data, a new accept, or a state change.
    pub fn ready(&mut self, timeout: Duration) -> QuicResult<Option<ConnHandle>> {
        let deadline = Instant::now() + timeout;
        let found = self.drive_until(Some(deadline), |eng| {
            !eng.accept_queue.is_empty()
                || eng.conns.iter().any(|(_, s)| s.conn.any_stream_has_data() || s.conn.is_closed())
        })?;
        if !found {
            return Ok(None);
        }
        if let Some(&handle) = self.accept_queue.front() {
            return Ok(Some(handle));
        }
        Ok(self
            .conns
            .iter()
            .find(|(_, s)| s.conn.any_stream_has_data() || s.conn.is_closed())
            .map(|(h, _)| h))
    }

    // ---- the cooperative loop itself --------------------------------------

    /// Runs one non-blocking receive batch, fires due timers, then flushes
    /// whatever each connection has queued to send (spec §5 steps 2-4).
    fn drive_once(&mut self) -> QuicResult<()> {
        let now = Instant::now();
        self.recv_batch(now)?;
        self.process_timeouts(now)?;
        self.flush_sends(now)
    }

    /// Repeats [`Engine::drive_once`] until `sentinel` is true or
    /// `deadline` passes (spec §5 "transfer control into the loop until a
    /// sentinel condition is met"). Sleeps in small bounded steps between
    /// iterations rather than busy-spinning; this approximates firing a
    /// hierarchical timer wheel without implementing one.
    fn drive_until(&mut self, deadline: Option<Instant>, mut sentinel: impl FnMut(&Self) -> bool) -> QuicResult<bool> {
        loop {
            if sentinel(self) {
                return Ok(true);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(false);
                }
            }
            self.drive_once()?;
            if sentinel(self) {
                return Ok(true);
            }
            let mut sleep_for = self
                .next_wakeup()
                .map(|w| w.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(5))
                .min(Duration::from_millis(5))
                .max(Duration::from_millis(1));
            if let Some(d) = deadline {
                sleep_for = sleep_for.min(d.saturating_duration_since(Instant::now()));
            }
            self.runtime.block_on(tokio::time::sleep(sleep_for));
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.conns.iter().filter_map(|(_, s)| s.conn.next_timeout()).min()
    }

    fn recv_batch(&mut self, now: Instant) -> QuicResult<()> {
        if self.socket.is_none() {
            return Ok(());
        }
        loop {
            let idx = match self.recv_pool.alloc() {
                Ok(i) => i,
                Err(_) => break, // pool exhausted this round, drains next poll
            };
            let socket = self.socket.as_ref().expect("checked above");
            let buf = self.recv_pool.get_mut(idx).full_capacity_mut();
            let outcome = self
                .runtime
                .block_on(tokio::time::timeout(Duration::from_millis(0), socket.recv_from(buf)));
            match outcome {
                Ok(Ok((len, from))) => {
                    self.recv_pool.get_mut(idx).set_len(len);
                    self.route_datagram(idx, from, now);
                    self.recv_pool.free(idx);
                }
                Ok(Err(e)) => {
                    self.recv_pool.free(idx);
                    return Err(Error::Io(e));
                }
                Err(_elapsed) => {
                    self.recv_pool.free(idx);
                    break;
                }
            }
        }
        Ok(())
    }

    fn lookup_connection(&self, data: &[u8]) -> Option<ConnHandle> {
        let first = *data.first()?;
        let mut reader = Reader::new(data);
        let dcid = if first & 0b1000_0000 != 0 {
            decode_long_prefix(&mut reader).ok()?.header.dcid
        } else {
            decode_short_prefix(&mut reader, self.local_cid_len).ok()?.dcid
        };
        self.by_dcid.get(dcid.as_slice()).copied()
    }

    /// Accepts a brand-new server connection off an unrouted Initial packet
    /// (spec §4.5 step 4, §4.7 "idle -> opening on server reception").
    fn try_accept_new(&mut self, idx: usize, from: SocketAddr) -> Option<ConnHandle> {
        let server_config = self.server_tls_config.clone()?;
        let data = self.recv_pool.get(idx).as_slice();
        if *data.first()? & 0b1000_0000 == 0 {
            return None; // short header can't start a connection
        }
        let mut reader = Reader::new(data);
        let prefix = decode_long_prefix(&mut reader).ok()?;
        if prefix.header.ty != PacketType::Initial {
            return None;
        }

        let local_params = self.config.local_transport_params();
        let tls = Box::new(RustlsServerEngine::new(server_config, local_params).ok()?);
        let mut rng = rand::thread_rng();
        let conn = Connection::accept(
            from,
            prefix.header.dcid.as_slice(),
            prefix.header.scid.clone(),
            self.config.clone(),
            tls,
            &mut rng,
        )
        .ok()?;

        let local_cid = conn.local_cid().map(|c| c.as_slice().to_vec());
        let client_odcid = prefix.header.dcid.as_slice().to_vec();
        let handle = self.conns.insert(ConnSlot {
            conn,
            is_new_server_conn: true,
        });
        if let Some(cid) = local_cid {
            self.by_dcid.insert(cid, handle);
        }
        // Alias the client's original dcid too, so a retransmitted first
        // Initial (sent before our reply arrived) still finds this slot.
        self.by_dcid.insert(client_odcid, handle);
        self.by_addr.insert(from, handle);
        self.accept_queue.push_back(handle);
        Some(handle)
    }

    /// Sends a Version Negotiation packet when an unrouted long-header
    /// datagram names a version this endpoint doesn't speak (spec §4.7,
    /// §6.2, mandatory scenario 2), rather than silently handing it to
    /// [`Engine::try_accept_new`] where it would just fail to parse.
    fn maybe_send_version_negotiation(&mut self, idx: usize, from: SocketAddr) -> bool {
        let data = self.recv_pool.get(idx).as_slice();
        if data.first().map(|b| b & 0b1000_0000 == 0).unwrap_or(true) {
            return false; // short header: not a connection-establishing packet
        }
        let invariant = {
            let mut r = Reader::new(data);
            match decode_invariant_prefix(&mut r) {
                Ok(p) => p,
                Err(_) => return false,
            }
        };
        if invariant.version == 0 || is_supported_version(invariant.version) {
            return false;
        }
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };
        let vn = VersionNegotiationPacket {
            dcid: invariant.scid,
            scid: invariant.dcid,
            versions: SUPPORTED_VERSIONS.to_vec(),
        };
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        let mut w = Writer::new(&mut out);
        let mut rng = rand::thread_rng();
        if vn.encode(&mut rng, &mut w).is_err() {
            return false;
        }
        let n = w.pos();
        let _ = self.runtime.block_on(socket.send_to(&out[..n], from));
        true
    }

    /// Matches a datagram's trailing 16 bytes against every stateless reset
    /// token a peer has advertised to us (spec §4.5 step 4). Only checked
    /// once a connection lookup and Initial-packet parse both fail, per the
    /// usual "this can't be confused with a valid packet" stateless reset
    /// design.
    fn try_stateless_reset(&self, data: &[u8]) -> Option<ConnHandle> {
        if data.len() < 16 {
            return None;
        }
        let token: [u8; 16] = data[data.len() - 16..].try_into().ok()?;
        self.by_reset_token.get(&token).copied()
    }

    fn route_datagram(&mut self, idx: usize, from: SocketAddr, now: Instant) {
        let handle = {
            let data = self.recv_pool.get(idx).as_slice();
            self.lookup_connection(data)
        };
        let handle = match handle {
            Some(h) => Some(h),
            None => {
                if self.maybe_send_version_negotiation(idx, from) {
                    return;
                }
                let reset = {
                    let data = self.recv_pool.get(idx).as_slice();
                    self.try_stateless_reset(data)
                };
                if let Some(h) = reset {
                    if let Some(slot) = self.conns.get_mut(h) {
                        slot.conn.on_stateless_reset();
                    }
                    return;
                }
                self.try_accept_new(idx, from)
            }
        };
        let handle = match handle {
            Some(h) => h,
            None => {
                trace!(%from, "dropping datagram for unknown connection");
                return;
            }
        };
        let data = self.recv_pool.get_mut(idx).as_mut_slice();
        if let Some(slot) = self.conns.get_mut(handle) {
            if let Err(e) = slot.conn.receive(data, from, now) {
                trace!(error = %e, %from, "datagram rejected");
            }
            for token in slot.conn.peer_reset_tokens() {
                self.by_reset_token.entry(token).or_insert(handle);
            }
        }
        self.by_addr.insert(from, handle);
    }

    fn process_timeouts(&mut self, now: Instant) -> QuicResult<()> {
        let mut to_drop = Vec::new();
        for (handle, slot) in self.conns.iter_mut() {
            if slot.conn.next_timeout().map(|d| now >= d).unwrap_or(false) {
                slot.conn.on_timeout(now)?;
            }
            if slot.conn.is_closed() {
                to_drop.push(handle);
            }
        }
        for handle in to_drop {
            self.drop_connection(handle);
        }
        Ok(())
    }

    fn flush_sends(&mut self, now: Instant) -> QuicResult<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        let handles: Vec<ConnHandle> = self.conns.iter().map(|(h, _)| h).collect();
        let mut rng = rand::thread_rng();
        for handle in handles {
            loop {
                let mut out = [0u8; MAX_DATAGRAM_SIZE];
                let sent = match self.conns.get_mut(handle) {
                    Some(slot) => slot.conn.send(now, &mut out, &mut rng)?,
                    None => break,
                };
                let Some((n, addr)) = sent else { break };
                self.runtime.block_on(socket.send_to(&out[..n], addr))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::types::Epoch;
    use crate::tls::{EpochKeys, HandshakeStep, TlsEngine};

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
    fn fresh_engine_has_no_connections_or_pending_accepts() {
        let engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        assert!(engine.conns.is_empty());
        assert!(engine.accept_queue.is_empty());
        assert!(engine.socket.is_none());
    }

    #[test]
    fn unknown_handle_reports_closed_and_errors_on_lookup() {
        let engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        assert!(engine.is_conn_closed(0));
        assert!(!engine.is_new_serv_conn(0));
        assert!(engine.info(0).is_err());
        assert!(engine.cid(0).is_err());
    }

    #[test]
    fn lookup_connection_rejects_truncated_datagrams() {
        let engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        assert!(engine.lookup_connection(&[]).is_none());
        assert!(engine.lookup_connection(&[0x40]).is_none());
    }

    #[test]
    fn drop_connection_is_a_noop_for_an_already_removed_handle() {
        let mut engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        engine.drop_connection(0);
        assert!(engine.conns.is_empty());
    }

    #[test]
    fn try_stateless_reset_matches_a_registered_token() {
        let mut engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        let token = [7u8; 16];
        engine.by_reset_token.insert(token, 3);
        let mut datagram = vec![0u8; 40];
        datagram[24..].copy_from_slice(&token);
        assert_eq!(engine.try_stateless_reset(&datagram), Some(3));
        assert!(engine.try_stateless_reset(&[0u8; 8]).is_none());
    }

    #[test]
    fn drop_connection_purges_its_reset_tokens() {
        let mut engine = Engine::init("127.0.0.1", Config::default()).unwrap();
        let mut rng = rand::thread_rng();
        let conn_a = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        let conn_b = Connection::connect(addr(), Config::default(), Box::new(NoopTls), &mut rng).unwrap();
        let handle_a = engine.conns.insert(ConnSlot {
            conn: conn_a,
            is_new_server_conn: false,
        });
        let handle_b = engine.conns.insert(ConnSlot {
            conn: conn_b,
            is_new_server_conn: false,
        });
        engine.by_reset_token.insert([1u8; 16], handle_a);
        engine.by_reset_token.insert([2u8; 16], handle_b);
        engine.drop_connection(handle_a);
        assert!(!engine.by_reset_token.values().any(|h| *h == handle_a));
        assert!(engine.by_reset_token.values().any(|h| *h == handle_b));
    }
}
