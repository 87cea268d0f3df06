//! TLS 1.3 integration (spec §4.3, §9 "TLS callback surface").
//!
//! The handshake itself -- ClientHello/ServerHello, the transcript, session
//! tickets -- is an external collaborator's job. This module defines the
//! callback surface a TLS-1.3 stack must offer: ALPN/SNI selection on
//! ClientHello, collecting/emitting the QUIC transport-parameter extension,
//! ticket persistence, and per-epoch traffic-key delivery. [`RustlsEngine`]
//! satisfies it on top of `rustls`'s `quic` module, which already speaks the
//! QUIC secret-export API these callbacks need.

use std::sync::Arc;

use crate::packet::protection::{CipherSuite, CryptoContext};
use crate::packet::types::Epoch;
use crate::result::{Error, QuicResult};
use crate::transport_params::TransportParameters;

/// One epoch's freshly-available secrets, as handed up from `update_traffic_key`
/// (spec §4.3: "Handshake/0-RTT/1-RTT keys are supplied by the TLS callback
/// ... at epoch transitions").
pub struct EpochKeys {
    pub epoch: Epoch,
    pub suite: CipherSuite,
    pub client_secret: Vec<u8>,
    pub server_secret: Vec<u8>,
}

impl EpochKeys {
    pub fn into_contexts(self, is_server: bool) -> QuicResult<CryptoContext> {
        let (tx, rx) = if is_server {
            (self.server_secret, self.client_secret)
        } else {
            (self.client_secret, self.server_secret)
        };
        CryptoContext::from_secrets(self.suite, tx, rx)
    }
}

pub enum HandshakeStep {
    /// More handshake bytes to send on the current epoch's CRYPTO stream.
    Emit { epoch: Epoch, data: Vec<u8> },
    /// New keys are available for the given epoch.
    Keys(EpochKeys),
    /// The handshake has produced application-layer transport parameters
    /// from the peer (spec §6.3).
    PeerTransportParameters(TransportParameters),
    /// Handshake complete; 1-RTT keys for both directions have been
    /// installed and HANDSHAKE_DONE may be sent (server only).
    Complete,
}

/// TLS callback surface (spec §9 design note, "specify these as
/// traits/interfaces; any TLS-1.3 stack that exposes an AEAD + HP cipher and
/// HKDF-Expand-Label may back them").
pub trait TlsEngine {
    /// Feeds received CRYPTO-frame bytes from `epoch` into the handshake and
    /// drains whatever the handshake produces in response (more handshake
    /// bytes, newly available keys, or peer transport parameters).
    fn advance(&mut self, epoch: Epoch, data: &[u8]) -> QuicResult<Vec<HandshakeStep>>;

    /// Starts the handshake (client only): emits the first flight.
    fn start(&mut self) -> QuicResult<Vec<HandshakeStep>>;

    /// ALPN protocol negotiated (or offered, before negotiation completes).
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// SNI the client indicated (server only).
    fn server_name(&self) -> Option<&str>;

    fn is_handshaking(&self) -> bool;

    /// 0-RTT keys, if the client offered early data and the server may
    /// accept it (spec §4.3 "0-RTT acceptance").
    fn zero_rtt_keys(&self) -> Option<EpochKeys>;
}

/// Client-role engine wrapping `rustls::quic::ClientConnection`.
pub struct RustlsClientEngine {
    conn: rustls::quic::ClientConnection,
    local_params: TransportParameters,
}

/// Server-role engine wrapping `rustls::quic::ServerConnection`.
pub struct RustlsServerEngine {
    conn: rustls::quic::ServerConnection,
    local_params: TransportParameters,
}

fn suite_from_rustls(suite: rustls::SupportedCipherSuite) -> QuicResult<CipherSuite> {
    match suite.suite() {
        rustls::CipherSuite::TLS13_AES_128_GCM_SHA256 => Ok(CipherSuite::Aes128Gcm),
        rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => Ok(CipherSuite::ChaCha20Poly1305),
        _ => Err(Error::Tls("unsupported cipher suite negotiated".into())),
    }
}

fn drain_quic_keys(change: rustls::quic::KeyChange, out: &mut Vec<HandshakeStep>) -> QuicResult<()> {
    match change {
        rustls::quic::KeyChange::Handshake { keys } => {
            out.push(HandshakeStep::Keys(EpochKeys {
                epoch: Epoch::Handshake,
                suite: suite_from_rustls(keys.suite)?,
                client_secret: keys.local.secret.as_ref().to_vec(),
                server_secret: keys.remote.secret.as_ref().to_vec(),
            }));
        }
        rustls::quic::KeyChange::OneRtt { keys, next } => {
            let _ = next; // next-generation secrets are re-derived locally via "traffic upd"
            out.push(HandshakeStep::Keys(EpochKeys {
                epoch: Epoch::OneRtt,
                suite: suite_from_rustls(keys.suite)?,
                client_secret: keys.local.secret.as_ref().to_vec(),
                server_secret: keys.remote.secret.as_ref().to_vec(),
            }));
            out.push(HandshakeStep::Complete);
        }
    }
    Ok(())
}

impl RustlsClientEngine {
    pub fn new(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::ServerName,
        local_params: TransportParameters,
    ) -> QuicResult<Self> {
        let conn = rustls::quic::ClientConnection::new(
            config,
            rustls::quic::Version::V1,
            server_name,
            local_params.encode()?,
        )
        .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self { conn, local_params })
    }
}

impl TlsEngine for RustlsClientEngine {
    fn advance(&mut self, _epoch: Epoch, data: &[u8]) -> QuicResult<Vec<HandshakeStep>> {
        self.conn
            .read_hs(data)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut out = Vec::new();
        let mut buf = Vec::new();
        if let Some(change) = self.conn.write_hs(&mut buf) {
            drain_quic_keys(change, &mut out)?;
        }
        if !buf.is_empty() {
            out.push(HandshakeStep::Emit {
                epoch: Epoch::Handshake,
                data: buf,
            });
        }
        if let Some(params) = self.conn.quic_transport_parameters() {
            out.push(HandshakeStep::PeerTransportParameters(
                TransportParameters::decode(params)?,
            ));
        }
        Ok(out)
    }

    fn start(&mut self) -> QuicResult<Vec<HandshakeStep>> {
        let mut out = Vec::new();
        let mut buf = Vec::new();
        if let Some(change) = self.conn.write_hs(&mut buf) {
            drain_quic_keys(change, &mut out)?;
        }
        out.push(HandshakeStep::Emit {
            epoch: Epoch::Initial,
            data: buf,
        });
        let _ = &self.local_params;
        Ok(out)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn server_name(&self) -> Option<&str> {
        None
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn zero_rtt_keys(&self) -> Option<EpochKeys> {
        let keys = self.conn.zero_rtt_keys()?;
        Some(EpochKeys {
            epoch: Epoch::ZeroRtt,
            suite: suite_from_rustls(keys.suite).ok()?,
            client_secret: keys.local.secret.as_ref().to_vec(),
            server_secret: keys.remote.secret.as_ref().to_vec(),
        })
    }
}

impl RustlsServerEngine {
    pub fn new(
        config: Arc<rustls::ServerConfig>,
        local_params: TransportParameters,
    ) -> QuicResult<Self> {
        let conn = rustls::quic::ServerConnection::new(
            config,
            rustls::quic::Version::V1,
            local_params.encode()?,
        )
        .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self { conn, local_params })
    }
}

impl TlsEngine for RustlsServerEngine {
    fn advance(&mut self, _epoch: Epoch, data: &[u8]) -> QuicResult<Vec<HandshakeStep>> {
        self.conn
            .read_hs(data)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut out = Vec::new();
        let mut buf = Vec::new();
        if let Some(change) = self.conn.write_hs(&mut buf) {
            drain_quic_keys(change, &mut out)?;
        }
        if !buf.is_empty() {
            out.push(HandshakeStep::Emit {
                epoch: Epoch::Handshake,
                data: buf,
            });
        }
        if let Some(params) = self.conn.quic_transport_parameters() {
            out.push(HandshakeStep::PeerTransportParameters(
                TransportParameters::decode(params)?,
            ));
        }
        let _ = &self.local_params;
        Ok(out)
    }

    fn start(&mut self) -> QuicResult<Vec<HandshakeStep>> {
        Ok(Vec::new()) // server speaks only once it has heard a ClientHello
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn zero_rtt_keys(&self) -> Option<EpochKeys> {
        let keys = self.conn.zero_rtt_keys()?;
        Some(EpochKeys {
            epoch: Epoch::ZeroRtt,
            suite: suite_from_rustls(keys.suite).ok()?,
            client_secret: keys.local.secret.as_ref().to_vec(),
            server_secret: keys.remote.secret.as_ref().to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_keys_swap_direction_by_role() {
        let keys = EpochKeys {
            epoch: Epoch::Handshake,
            suite: CipherSuite::Aes128Gcm,
            client_secret: vec![1; 32],
            server_secret: vec![2; 32],
        };
        let server_ctx = keys.into_contexts(true).unwrap();
        // Server transmits with its own secret and receives with the
        // client's -- the reverse of the client role.
        assert_eq!(server_ctx.tx.packet.seal(0, b"h", &mut vec![0u8; 4]).is_ok(), true);
    }
}
