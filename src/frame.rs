//! Frame codec (spec §4.6): every wire frame this endpoint understands,
//! parsed into its fields rather than kept as an opaque type+blob pair.

use crate::codec::{Reader, Writer};
use crate::packet::types::Epoch;
use crate::result::{require, Error, QuicResult};
use crate::varint::VarInt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    AckEcn,
    ResetStream,
    StopSending,
    Crypto,
    NewToken,
    Stream,
    MaxData,
    MaxStreamData,
    MaxStreamsBidi,
    MaxStreamsUni,
    DataBlocked,
    StreamDataBlocked,
    StreamsBlockedBidi,
    StreamsBlockedUni,
    NewConnectionId,
    RetireConnectionId,
    PathChallenge,
    PathResponse,
    ConnectionCloseTransport,
    ConnectionCloseApplication,
    HandshakeDone,
}

impl FrameType {
    /// Is this frame legal in `epoch` (spec §4.6: "frames outside their
    /// permitted epoch ... trigger PROTOCOL_VIOLATION")?
    pub fn allowed_in(self, epoch: Epoch) -> bool {
        use Epoch::*;
        use FrameType::*;
        match self {
            Padding | Ping => true,
            Ack | AckEcn => epoch != ZeroRtt,
            // CONNECTION_CLOSE(transport) may appear in any epoch (RFC 9000
            // §12.5); CONNECTION_CLOSE(application) only once app data flows.
            ConnectionCloseTransport => true,
            Crypto => epoch != ZeroRtt,
            HandshakeDone => matches!(epoch, OneRtt),
            NewToken
            | ResetStream
            | StopSending
            | Stream
            | MaxData
            | MaxStreamData
            | MaxStreamsBidi
            | MaxStreamsUni
            | DataBlocked
            | StreamDataBlocked
            | StreamsBlockedBidi
            | StreamsBlockedUni
            | NewConnectionId
            | RetireConnectionId
            | PathChallenge
            | PathResponse
            | ConnectionCloseApplication => epoch.allows_app_frames(),
        }
    }
}

/// One decoded ACK range, newest-first (spec §4.6 "iterate ranges
/// newest-first").
#[derive(Debug, Clone, Copy)]
pub struct AckRange {
    pub smallest: u64,
    pub largest: u64,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding {
        len: usize,
    },
    Ping,
    Ack {
        largest_acked: u64,
        ack_delay: u64,
        ranges: Vec<AckRange>,
        ecn: Option<(u64, u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },
    MaxData {
        max: u64,
    },
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreamsBidi {
        max: u64,
    },
    MaxStreamsUni {
        max: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlockedBidi {
        limit: u64,
    },
    StreamsBlockedUni {
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: Vec<u8>,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason: Vec<u8>,
        is_application: bool,
    },
    HandshakeDone,
}

const TY_PADDING: u64 = 0x00;
const TY_PING: u64 = 0x01;
const TY_ACK: u64 = 0x02;
const TY_ACK_ECN: u64 = 0x03;
const TY_RESET_STREAM: u64 = 0x04;
const TY_STOP_SENDING: u64 = 0x05;
const TY_CRYPTO: u64 = 0x06;
const TY_NEW_TOKEN: u64 = 0x07;
const TY_STREAM_LO: u64 = 0x08;
const TY_STREAM_HI: u64 = 0x0f;
const TY_MAX_DATA: u64 = 0x10;
const TY_MAX_STREAM_DATA: u64 = 0x11;
const TY_MAX_STREAMS_BIDI: u64 = 0x12;
const TY_MAX_STREAMS_UNI: u64 = 0x13;
const TY_DATA_BLOCKED: u64 = 0x14;
const TY_STREAM_DATA_BLOCKED: u64 = 0x15;
const TY_STREAMS_BLOCKED_BIDI: u64 = 0x16;
const TY_STREAMS_BLOCKED_UNI: u64 = 0x17;
const TY_NEW_CONNECTION_ID: u64 = 0x18;
const TY_RETIRE_CONNECTION_ID: u64 = 0x19;
const TY_PATH_CHALLENGE: u64 = 0x1a;
const TY_PATH_RESPONSE: u64 = 0x1b;
const TY_CONNECTION_CLOSE_TRANSPORT: u64 = 0x1c;
const TY_CONNECTION_CLOSE_APPLICATION: u64 = 0x1d;
const TY_HANDSHAKE_DONE: u64 = 0x1e;

/// STREAM frame type bits: 0b00001OLF (OFF, LEN, FIN).
const STREAM_OFF_BIT: u64 = 0x04;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_FIN_BIT: u64 = 0x01;

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding { .. } => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack { ecn: None, .. } => FrameType::Ack,
            Frame::Ack { ecn: Some(_), .. } => FrameType::AckEcn,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::StopSending { .. } => FrameType::StopSending,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::NewToken { .. } => FrameType::NewToken,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::MaxData { .. } => FrameType::MaxData,
            Frame::MaxStreamData { .. } => FrameType::MaxStreamData,
            Frame::MaxStreamsBidi { .. } => FrameType::MaxStreamsBidi,
            Frame::MaxStreamsUni { .. } => FrameType::MaxStreamsUni,
            Frame::DataBlocked { .. } => FrameType::DataBlocked,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Frame::StreamsBlockedBidi { .. } => FrameType::StreamsBlockedBidi,
            Frame::StreamsBlockedUni { .. } => FrameType::StreamsBlockedUni,
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge { .. } => FrameType::PathChallenge,
            Frame::PathResponse { .. } => FrameType::PathResponse,
            Frame::ConnectionClose {
                is_application: false,
                ..
            } => FrameType::ConnectionCloseTransport,
            Frame::ConnectionClose {
                is_application: true,
                ..
            } => FrameType::ConnectionCloseApplication,
            Frame::HandshakeDone => FrameType::HandshakeDone,
        }
    }

    /// Is this frame ack-eliciting (spec GLOSSARY: any frame other than ACK
    /// and PADDING)?
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding { .. } | Frame::Ack { .. })
    }

    pub fn encode(&self, w: &mut Writer) -> QuicResult<()> {
        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    w.put_varint(VarInt::from_u32(TY_PADDING as u32))?;
                }
            }
            Frame::Ping => {
                w.put_varint(VarInt::from_u32(TY_PING as u32))?;
            }
            Frame::Ack {
                largest_acked,
                ack_delay,
                ranges,
                ecn,
            } => {
                w.put_varint(VarInt::try_from(if ecn.is_some() { TY_ACK_ECN } else { TY_ACK })?)?;
                w.put_varint(VarInt::try_from(*largest_acked)?)?;
                w.put_varint(VarInt::try_from(*ack_delay)?)?;
                require(!ranges.is_empty(), "ACK frame must have at least one range")?;
                w.put_varint(VarInt::try_from(ranges.len() as u64 - 1)?)?;
                w.put_varint(VarInt::try_from(ranges[0].largest - ranges[0].smallest)?)?;
                for pair in ranges.windows(2) {
                    let (prev, cur) = (pair[0], pair[1]);
                    let gap = prev.smallest - cur.largest - 2;
                    w.put_varint(VarInt::try_from(gap)?)?;
                    w.put_varint(VarInt::try_from(cur.largest - cur.smallest)?)?;
                }
                if let Some((ect0, ect1, ce)) = ecn {
                    w.put_varint(VarInt::try_from(*ect0)?)?;
                    w.put_varint(VarInt::try_from(*ect1)?)?;
                    w.put_varint(VarInt::try_from(*ce)?)?;
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                w.put_varint(VarInt::from_u32(TY_RESET_STREAM as u32))?;
                w.put_varint(VarInt::try_from(*stream_id)?)?;
                w.put_varint(VarInt::try_from(*error_code)?)?;
                w.put_varint(VarInt::try_from(*final_size)?)?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                w.put_varint(VarInt::from_u32(TY_STOP_SENDING as u32))?;
                w.put_varint(VarInt::try_from(*stream_id)?)?;
                w.put_varint(VarInt::try_from(*error_code)?)?;
            }
            Frame::Crypto { offset, data } => {
                w.put_varint(VarInt::from_u32(TY_CRYPTO as u32))?;
                w.put_varint(VarInt::try_from(*offset)?)?;
                w.put_varint(VarInt::try_from(data.len())?)?;
                w.put_bytes(data)?;
            }
            Frame::NewToken { token } => {
                w.put_varint(VarInt::from_u32(TY_NEW_TOKEN as u32))?;
                w.put_varint(VarInt::try_from(token.len())?)?;
                w.put_bytes(token)?;
            }
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                let mut ty = TY_STREAM_LO | STREAM_LEN_BIT;
                if *offset > 0 {
                    ty |= STREAM_OFF_BIT;
                }
                if *fin {
                    ty |= STREAM_FIN_BIT;
                }
                w.put_varint(VarInt::try_from(ty)?)?;
                w.put_varint(VarInt::try_from(*stream_id)?)?;
                if *offset > 0 {
                    w.put_varint(VarInt::try_from(*offset)?)?;
                }
                w.put_varint(VarInt::try_from(data.len())?)?;
                w.put_bytes(data)?;
            }
            Frame::MaxData { max } => {
                w.put_varint(VarInt::from_u32(TY_MAX_DATA as u32))?;
                w.put_varint(VarInt::try_from(*max)?)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                w.put_varint(VarInt::from_u32(TY_MAX_STREAM_DATA as u32))?;
                w.put_varint(VarInt::try_from(*stream_id)?)?;
                w.put_varint(VarInt::try_from(*max)?)?;
            }
            Frame::MaxStreamsBidi { max } => {
                w.put_varint(VarInt::from_u32(TY_MAX_STREAMS_BIDI as u32))?;
                w.put_varint(VarInt::try_from(*max)?)?;
            }
            Frame::MaxStreamsUni { max } => {
                w.put_varint(VarInt::from_u32(TY_MAX_STREAMS_UNI as u32))?;
                w.put_varint(VarInt::try_from(*max)?)?;
            }
            Frame::DataBlocked { limit } => {
                w.put_varint(VarInt::from_u32(TY_DATA_BLOCKED as u32))?;
                w.put_varint(VarInt::try_from(*limit)?)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                w.put_varint(VarInt::from_u32(TY_STREAM_DATA_BLOCKED as u32))?;
                w.put_varint(VarInt::try_from(*stream_id)?)?;
                w.put_varint(VarInt::try_from(*limit)?)?;
            }
            Frame::StreamsBlockedBidi { limit } => {
                w.put_varint(VarInt::from_u32(TY_STREAMS_BLOCKED_BIDI as u32))?;
                w.put_varint(VarInt::try_from(*limit)?)?;
            }
            Frame::StreamsBlockedUni { limit } => {
                w.put_varint(VarInt::from_u32(TY_STREAMS_BLOCKED_UNI as u32))?;
                w.put_varint(VarInt::try_from(*limit)?)?;
            }
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                w.put_varint(VarInt::from_u32(TY_NEW_CONNECTION_ID as u32))?;
                w.put_varint(VarInt::try_from(*seq)?)?;
                w.put_varint(VarInt::try_from(*retire_prior_to)?)?;
                w.put_u8(cid.len() as u8)?;
                w.put_bytes(cid)?;
                w.put_bytes(reset_token)?;
            }
            Frame::RetireConnectionId { seq } => {
                w.put_varint(VarInt::from_u32(TY_RETIRE_CONNECTION_ID as u32))?;
                w.put_varint(VarInt::try_from(*seq)?)?;
            }
            Frame::PathChallenge { data } => {
                w.put_varint(VarInt::from_u32(TY_PATH_CHALLENGE as u32))?;
                w.put_bytes(data)?;
            }
            Frame::PathResponse { data } => {
                w.put_varint(VarInt::from_u32(TY_PATH_RESPONSE as u32))?;
                w.put_bytes(data)?;
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
                is_application,
            } => {
                let ty = if *is_application {
                    TY_CONNECTION_CLOSE_APPLICATION
                } else {
                    TY_CONNECTION_CLOSE_TRANSPORT
                };
                w.put_varint(VarInt::from_u32(ty as u32))?;
                w.put_varint(VarInt::try_from(*error_code)?)?;
                if !*is_application {
                    w.put_varint(VarInt::try_from(frame_type.unwrap_or(0))?)?;
                }
                w.put_varint(VarInt::try_from(reason.len())?)?;
                w.put_bytes(reason)?;
            }
            Frame::HandshakeDone => {
                w.put_varint(VarInt::from_u32(TY_HANDSHAKE_DONE as u32))?;
            }
        }
        Ok(())
    }

    /// Decodes one frame. PADDING is coalesced: all contiguous 0x00 bytes
    /// are folded into a single `Frame::Padding`.
    pub fn decode(r: &mut Reader) -> QuicResult<Self> {
        let ty = r.get_varint()?.into_inner();
        match ty {
            // One PADDING byte decodes to one `Frame::Padding { len: 1 }`;
            // a run of padding bytes simply produces that many consecutive
            // frames, which callers iterating a frame list treat uniformly.
            TY_PADDING => Ok(Frame::Padding { len: 1 }),
            TY_PING => Ok(Frame::Ping),
            TY_ACK | TY_ACK_ECN => {
                let largest_acked = r.get_varint()?.into_inner();
                let ack_delay = r.get_varint()?.into_inner();
                let range_count = r.get_varint()?.into_inner();
                let first_range = r.get_varint()?.into_inner();
                require(first_range <= largest_acked, "ACK first range underflows pn space")?;
                let mut ranges = vec![AckRange {
                    smallest: largest_acked - first_range,
                    largest: largest_acked,
                }];
                for _ in 0..range_count {
                    let gap = r.get_varint()?.into_inner();
                    let len = r.get_varint()?.into_inner();
                    let prev_smallest = ranges.last().unwrap().smallest;
                    require(prev_smallest >= gap + 2, "ACK range gap underflows pn space")?;
                    let largest = prev_smallest - gap - 2;
                    require(len <= largest, "ACK range length underflows pn space")?;
                    ranges.push(AckRange {
                        smallest: largest - len,
                        largest,
                    });
                }
                let ecn = if ty == TY_ACK_ECN {
                    let ect0 = r.get_varint()?.into_inner();
                    let ect1 = r.get_varint()?.into_inner();
                    let ce = r.get_varint()?.into_inner();
                    Some((ect0, ect1, ce))
                } else {
                    None
                };
                Ok(Frame::Ack {
                    largest_acked,
                    ack_delay,
                    ranges,
                    ecn,
                })
            }
            TY_RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: r.get_varint()?.into_inner(),
                error_code: r.get_varint()?.into_inner(),
                final_size: r.get_varint()?.into_inner(),
            }),
            TY_STOP_SENDING => Ok(Frame::StopSending {
                stream_id: r.get_varint()?.into_inner(),
                error_code: r.get_varint()?.into_inner(),
            }),
            TY_CRYPTO => {
                let offset = r.get_varint()?.into_inner();
                let len = r.get_varint()?.usize()?;
                let data = r.get_bytes(len)?.to_vec();
                Ok(Frame::Crypto { offset, data })
            }
            TY_NEW_TOKEN => {
                let len = r.get_varint()?.usize()?;
                require(len > 0, "NEW_TOKEN token must not be empty")?;
                Ok(Frame::NewToken {
                    token: r.get_bytes(len)?.to_vec(),
                })
            }
            TY_STREAM_LO..=TY_STREAM_HI => {
                let stream_id = r.get_varint()?.into_inner();
                let offset = if ty & STREAM_OFF_BIT != 0 {
                    r.get_varint()?.into_inner()
                } else {
                    0
                };
                let data = if ty & STREAM_LEN_BIT != 0 {
                    let len = r.get_varint()?.usize()?;
                    r.get_bytes(len)?.to_vec()
                } else {
                    r.get_rest().to_vec()
                };
                let fin = ty & STREAM_FIN_BIT != 0;
                Ok(Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data,
                })
            }
            TY_MAX_DATA => Ok(Frame::MaxData {
                max: r.get_varint()?.into_inner(),
            }),
            TY_MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: r.get_varint()?.into_inner(),
                max: r.get_varint()?.into_inner(),
            }),
            TY_MAX_STREAMS_BIDI => Ok(Frame::MaxStreamsBidi {
                max: r.get_varint()?.into_inner(),
            }),
            TY_MAX_STREAMS_UNI => Ok(Frame::MaxStreamsUni {
                max: r.get_varint()?.into_inner(),
            }),
            TY_DATA_BLOCKED => Ok(Frame::DataBlocked {
                limit: r.get_varint()?.into_inner(),
            }),
            TY_STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: r.get_varint()?.into_inner(),
                limit: r.get_varint()?.into_inner(),
            }),
            TY_STREAMS_BLOCKED_BIDI => Ok(Frame::StreamsBlockedBidi {
                limit: r.get_varint()?.into_inner(),
            }),
            TY_STREAMS_BLOCKED_UNI => Ok(Frame::StreamsBlockedUni {
                limit: r.get_varint()?.into_inner(),
            }),
            TY_NEW_CONNECTION_ID => {
                let seq = r.get_varint()?.into_inner();
                let retire_prior_to = r.get_varint()?.into_inner();
                let len = r.get_u8()? as usize;
                require((1..=20).contains(&len), "NEW_CONNECTION_ID length out of range")?;
                let cid = r.get_bytes(len)?.to_vec();
                let token_bytes = r.get_bytes(16)?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(token_bytes);
                Ok(Frame::NewConnectionId {
                    seq,
                    retire_prior_to,
                    cid,
                    reset_token,
                })
            }
            TY_RETIRE_CONNECTION_ID => Ok(Frame::RetireConnectionId {
                seq: r.get_varint()?.into_inner(),
            }),
            TY_PATH_CHALLENGE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.get_bytes(8)?);
                Ok(Frame::PathChallenge { data })
            }
            TY_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.get_bytes(8)?);
                Ok(Frame::PathResponse { data })
            }
            TY_CONNECTION_CLOSE_TRANSPORT | TY_CONNECTION_CLOSE_APPLICATION => {
                let is_application = ty == TY_CONNECTION_CLOSE_APPLICATION;
                let error_code = r.get_varint()?.into_inner();
                let frame_type = if is_application {
                    None
                } else {
                    Some(r.get_varint()?.into_inner())
                };
                let reason_len = r.get_varint()?.usize()?;
                let reason = r.get_bytes(reason_len)?.to_vec();
                Ok(Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                    is_application,
                })
            }
            TY_HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            other => Err(Error::UnknownFrame(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = [0u8; 512];
        let mut w = Writer::new(&mut buf);
        frame.encode(&mut w).unwrap();
        let mut r = Reader::new(&buf[..w.pos()]);
        Frame::decode(&mut r).unwrap()
    }

    #[test]
    fn stream_frame_round_trips_with_offset_and_fin() {
        let frame = Frame::Stream {
            stream_id: 4,
            offset: 128,
            fin: true,
            data: vec![1, 2, 3, 4, 5],
        };
        match round_trip(frame) {
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                assert_eq!(stream_id, 4);
                assert_eq!(offset, 128);
                assert!(fin);
                assert_eq!(data, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ack_frame_round_trips_multiple_ranges() {
        let frame = Frame::Ack {
            largest_acked: 100,
            ack_delay: 50,
            ranges: vec![
                AckRange {
                    smallest: 90,
                    largest: 100,
                },
                AckRange {
                    smallest: 50,
                    largest: 80,
                },
            ],
            ecn: None,
        };
        match round_trip(frame) {
            Frame::Ack {
                largest_acked,
                ranges,
                ..
            } => {
                assert_eq!(largest_acked, 100);
                assert_eq!(ranges.len(), 2);
                assert_eq!(ranges[0].smallest, 90);
                assert_eq!(ranges[1].largest, 80);
                assert_eq!(ranges[1].smallest, 50);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn new_connection_id_round_trips() {
        let frame = Frame::NewConnectionId {
            seq: 3,
            retire_prior_to: 1,
            cid: vec![9, 9, 9, 9],
            reset_token: [7u8; 16],
        };
        match round_trip(frame) {
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                assert_eq!(seq, 3);
                assert_eq!(retire_prior_to, 1);
                assert_eq!(cid, vec![9, 9, 9, 9]);
                assert_eq!(reset_token, [7u8; 16]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ack_range_underflow_is_protocol_violation() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.put_varint(VarInt::from_u32(TY_ACK as u32)).unwrap();
        w.put_varint(VarInt::from_u32(5)).unwrap(); // largest_acked
        w.put_varint(VarInt::from_u32(0)).unwrap(); // ack_delay
        w.put_varint(VarInt::from_u32(0)).unwrap(); // range_count
        w.put_varint(VarInt::from_u32(10)).unwrap(); // first_range > largest_acked
        let mut r = Reader::new(&buf[..w.pos()]);
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn unknown_frame_type_is_reported() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        w.put_varint(VarInt::from_u32(0x3f)).unwrap();
        let mut r = Reader::new(&buf[..w.pos()]);
        assert!(matches!(Frame::decode(&mut r), Err(Error::UnknownFrame(0x3f))));
    }
}
