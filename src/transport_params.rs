//! QUIC transport parameters (spec §6.3), exchanged as TLS extension type
//! `0xffa5`. Each parameter is `id (2) | length (2) | value`, not the varint
//! id/length IETF later settled on -- this matches the draft-22-era wire
//! format the rest of the header/version code targets.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::cid::ConnectionId;
use crate::codec::{Reader, Writer};
use crate::result::{require, Error, QuicResult};

pub const TLS_EXTENSION_TYPE: u16 = 0xffa5;

const ID_ORIGINAL_CONNECTION_ID: u16 = 0x00;
const ID_IDLE_TIMEOUT: u16 = 0x01;
const ID_STATELESS_RESET_TOKEN: u16 = 0x02;
const ID_MAX_PACKET_SIZE: u16 = 0x03;
const ID_INITIAL_MAX_DATA: u16 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u16 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u16 = 0x09;
const ID_ACK_DELAY_EXPONENT: u16 = 0x0a;
const ID_MAX_ACK_DELAY: u16 = 0x0b;
const ID_DISABLE_MIGRATION: u16 = 0x0c;
const ID_PREFERRED_ADDRESS: u16 = 0x0d;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u16 = 0x0e;

#[derive(Debug, Clone)]
pub struct PreferredAddress {
    pub ipv4: Option<SocketAddrV4>,
    pub cid: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

/// A connection's negotiated transport parameters (spec §3 "two transport
/// parameter records" -- local-sent and peer-received share this type).
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub original_connection_id: Option<ConnectionId>,
    pub idle_timeout_ms: Option<u64>,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay_ms: u64,
    pub disable_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_connection_id: None,
            idle_timeout_ms: None,
            stateless_reset_token: None,
            max_packet_size: 1200,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            disable_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
        }
    }
}

fn put_param(w: &mut Writer, id: u16, body: &[u8]) -> QuicResult<()> {
    w.put_u16(id)?;
    w.put_u16(body.len() as u16)?;
    w.put_bytes(body)
}

fn varint_body(v: u64) -> QuicResult<Vec<u8>> {
    Ok(crate::varint::VarInt::new_u64(v)?.encode())
}

impl TransportParameters {
    pub fn encode(&self) -> QuicResult<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        let mut w = Writer::new(&mut buf);

        if let Some(cid) = &self.original_connection_id {
            put_param(&mut w, ID_ORIGINAL_CONNECTION_ID, cid.as_slice())?;
        }
        if let Some(ms) = self.idle_timeout_ms {
            put_param(&mut w, ID_IDLE_TIMEOUT, &varint_body(ms)?)?;
        }
        if let Some(token) = &self.stateless_reset_token {
            put_param(&mut w, ID_STATELESS_RESET_TOKEN, token)?;
        }
        put_param(&mut w, ID_MAX_PACKET_SIZE, &varint_body(self.max_packet_size)?)?;
        put_param(&mut w, ID_INITIAL_MAX_DATA, &varint_body(self.initial_max_data)?)?;
        put_param(
            &mut w,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            &varint_body(self.initial_max_stream_data_bidi_local)?,
        )?;
        put_param(
            &mut w,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            &varint_body(self.initial_max_stream_data_bidi_remote)?,
        )?;
        put_param(
            &mut w,
            ID_INITIAL_MAX_STREAM_DATA_UNI,
            &varint_body(self.initial_max_stream_data_uni)?,
        )?;
        put_param(
            &mut w,
            ID_INITIAL_MAX_STREAMS_BIDI,
            &varint_body(self.initial_max_streams_bidi)?,
        )?;
        put_param(
            &mut w,
            ID_INITIAL_MAX_STREAMS_UNI,
            &varint_body(self.initial_max_streams_uni)?,
        )?;
        put_param(&mut w, ID_ACK_DELAY_EXPONENT, &[self.ack_delay_exponent])?;
        put_param(&mut w, ID_MAX_ACK_DELAY, &varint_body(self.max_ack_delay_ms)?)?;
        if self.disable_migration {
            put_param(&mut w, ID_DISABLE_MIGRATION, &[])?;
        }
        if let Some(pa) = &self.preferred_address {
            let mut body = Vec::new();
            if let Some(addr) = pa.ipv4 {
                body.extend_from_slice(&addr.ip().octets());
                body.extend_from_slice(&addr.port().to_be_bytes());
            } else {
                body.extend_from_slice(&[0u8; 6]);
            }
            body.push(pa.cid.len() as u8);
            body.extend_from_slice(pa.cid.as_slice());
            body.extend_from_slice(&pa.stateless_reset_token);
            put_param(&mut w, ID_PREFERRED_ADDRESS, &body)?;
        }
        put_param(
            &mut w,
            ID_ACTIVE_CONNECTION_ID_LIMIT,
            &varint_body(self.active_connection_id_limit)?,
        )?;

        let len = w.pos();
        buf.truncate(len);
        Ok(buf)
    }

    /// Decodes the extension body. Unknown ids in `0xff00..=0xffff` are
    /// grease and are skipped; any other unknown id or a duplicate id is a
    /// protocol violation (spec §6.3).
    pub fn decode(data: &[u8]) -> QuicResult<Self> {
        let mut r = Reader::new(data);
        let mut out = TransportParameters::default();
        let mut seen = BTreeSet::new();

        while !r.is_empty() {
            let id = r.get_u16()?;
            let len = r.get_u16()? as usize;
            let body = r.get_bytes(len)?;
            if id >= 0xff00 {
                continue;
            }
            require(seen.insert(id), "duplicate transport parameter")?;

            let mut br = Reader::new(body);
            match id {
                ID_ORIGINAL_CONNECTION_ID => {
                    out.original_connection_id = Some(ConnectionId::new(body.to_vec())?);
                }
                ID_IDLE_TIMEOUT => out.idle_timeout_ms = Some(br.get_varint()?.into_inner()),
                ID_STATELESS_RESET_TOKEN => {
                    require(len == 16, "stateless_reset_token must be 16 bytes")?;
                    let mut token = [0u8; 16];
                    token.copy_from_slice(body);
                    out.stateless_reset_token = Some(token);
                }
                ID_MAX_PACKET_SIZE => {
                    let v = br.get_varint()?.into_inner();
                    require(v >= 1200, "max_packet_size below minimum")?;
                    out.max_packet_size = v;
                }
                ID_INITIAL_MAX_DATA => out.initial_max_data = br.get_varint()?.into_inner(),
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    out.initial_max_stream_data_bidi_local = br.get_varint()?.into_inner()
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    out.initial_max_stream_data_bidi_remote = br.get_varint()?.into_inner()
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    out.initial_max_stream_data_uni = br.get_varint()?.into_inner()
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    out.initial_max_streams_bidi = br.get_varint()?.into_inner()
                }
                ID_INITIAL_MAX_STREAMS_UNI => {
                    out.initial_max_streams_uni = br.get_varint()?.into_inner()
                }
                ID_ACK_DELAY_EXPONENT => {
                    require(len == 1, "ack_delay_exponent must be 1 byte")?;
                    require(body[0] <= 20, "ack_delay_exponent exceeds maximum")?;
                    out.ack_delay_exponent = body[0];
                }
                ID_MAX_ACK_DELAY => {
                    let v = br.get_varint()?.into_inner();
                    require(v < (1 << 14), "max_ack_delay exceeds maximum")?;
                    out.max_ack_delay_ms = v;
                }
                ID_DISABLE_MIGRATION => {
                    require(len == 0, "disable_migration must be empty")?;
                    out.disable_migration = true;
                }
                ID_PREFERRED_ADDRESS => {
                    require(body.len() >= 6 + 1 + 16, "preferred_address too short")?;
                    let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                    let port = u16::from_be_bytes([body[4], body[5]]);
                    let ipv4 = if ip.is_unspecified() && port == 0 {
                        None
                    } else {
                        Some(SocketAddrV4::new(ip, port))
                    };
                    let cid_len = body[6] as usize;
                    require(body.len() == 7 + cid_len + 16, "preferred_address length mismatch")?;
                    let cid = ConnectionId::new(body[7..7 + cid_len].to_vec())?;
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&body[7 + cid_len..7 + cid_len + 16]);
                    out.preferred_address = Some(PreferredAddress {
                        ipv4,
                        cid,
                        stateless_reset_token: token,
                    });
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    out.active_connection_id_limit = br.get_varint()?.into_inner()
                }
                _ => return Err(Error::TransportParameter("unrecognized transport parameter id")),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_wire_format() {
        let mut params = TransportParameters::default();
        params.initial_max_data = 1_000_000;
        params.initial_max_streams_bidi = 16;
        params.idle_timeout_ms = Some(10_000);

        let encoded = params.encode().unwrap();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(decoded.initial_max_data, 1_000_000);
        assert_eq!(decoded.initial_max_streams_bidi, 16);
        assert_eq!(decoded.idle_timeout_ms, Some(10_000));
    }

    #[test]
    fn grease_ids_are_skipped() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_u16(0xff2a).unwrap();
        w.put_u16(0).unwrap();
        let encoded = w.as_slice().to_vec();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(decoded.initial_max_data, 0);
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        w.put_u16(ID_INITIAL_MAX_DATA).unwrap();
        w.put_u16(1).unwrap();
        w.put_u8(5).unwrap();
        w.put_u16(ID_INITIAL_MAX_DATA).unwrap();
        w.put_u16(1).unwrap();
        w.put_u8(6).unwrap();
        let encoded = w.as_slice().to_vec();
        assert!(TransportParameters::decode(&encoded).is_err());
    }

    #[test]
    fn unknown_non_grease_id_is_protocol_violation() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_u16(0x99).unwrap();
        w.put_u16(0).unwrap();
        let encoded = w.as_slice().to_vec();
        assert!(TransportParameters::decode(&encoded).is_err());
    }
}
