use std::fmt;

/// Wire-visible transport error codes (spec §7 / RFC 9000 §20.1).
///
/// `TLS(alert)` is encoded as `0x100 | alert` per the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    None,
    Internal,
    ConnectionRefused,
    FlowControl,
    StreamLimit,
    StreamState,
    FinalSize,
    FrameEncoding,
    TransportParameter,
    ConnectionIdLimit,
    ProtocolViolation,
    InvalidToken,
    Application,
    CryptoBufferExceeded,
    KeyUpdate,
    AeadLimitReached,
    NoViablePath,
    Crypto(u8),
}

impl TransportError {
    pub fn code(self) -> u64 {
        match self {
            TransportError::None => 0x00,
            TransportError::Internal => 0x01,
            TransportError::ConnectionRefused => 0x02,
            TransportError::FlowControl => 0x03,
            TransportError::StreamLimit => 0x04,
            TransportError::StreamState => 0x05,
            TransportError::FinalSize => 0x06,
            TransportError::FrameEncoding => 0x07,
            TransportError::TransportParameter => 0x08,
            TransportError::ConnectionIdLimit => 0x09,
            TransportError::ProtocolViolation => 0x0a,
            TransportError::InvalidToken => 0x0b,
            TransportError::Application => 0x0c,
            TransportError::CryptoBufferExceeded => 0x0d,
            TransportError::KeyUpdate => 0x0e,
            TransportError::AeadLimitReached => 0x0f,
            TransportError::NoViablePath => 0x10,
            TransportError::Crypto(alert) => 0x100 | alert as u64,
        }
    }

    pub fn from_code(value: u64) -> Self {
        match value {
            0x00 => TransportError::None,
            0x01 => TransportError::Internal,
            0x02 => TransportError::ConnectionRefused,
            0x03 => TransportError::FlowControl,
            0x04 => TransportError::StreamLimit,
            0x05 => TransportError::StreamState,
            0x06 => TransportError::FinalSize,
            0x07 => TransportError::FrameEncoding,
            0x08 => TransportError::TransportParameter,
            0x09 => TransportError::ConnectionIdLimit,
            0x0a => TransportError::ProtocolViolation,
            0x0b => TransportError::InvalidToken,
            0x0c => TransportError::Application,
            0x0d => TransportError::CryptoBufferExceeded,
            0x0e => TransportError::KeyUpdate,
            0x0f => TransportError::AeadLimitReached,
            0x100..=0x1ff => TransportError::Crypto((value & 0xff) as u8),
            _ => TransportError::Internal,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:x})", self, self.code())
    }
}

/// Crate-wide error type. Every decode/validation path returns `Result<T>`
/// rather than panicking; only the connection-close machinery translates a
/// given variant into the wire-visible [`TransportError`] it corresponds to.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("varint value exceeds maximum")]
    InvalidVarint,
    #[error("unknown long-header packet type")]
    UnknownPacketType,
    #[error("unknown frame type 0x{0:x}")]
    UnknownFrame(u64),
    #[error("frame encoding error: {0}")]
    FrameEncoding(&'static str),
    #[error("transport parameter error: {0}")]
    TransportParameter(&'static str),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("flow control violation")]
    FlowControl,
    #[error("stream {0} in invalid state")]
    StreamState(u64),
    #[error("stream {0} id exceeds peer-advertised limit")]
    StreamLimit(u64),
    #[error("final size error")]
    FinalSize,
    #[error("crypto/AEAD verification failed")]
    CryptoFail,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("connection id limit exceeded")]
    ConnectionIdLimit,
    #[error("invalid token")]
    InvalidToken,
    #[error("packet or connection processing done, nothing more to do")]
    Done,
    #[error("would block")]
    WouldBlock,
    #[error("buffer pool exhausted")]
    BufferPoolExhausted,
    #[error("operation invalid in current connection state")]
    InvalidState,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type QuicResult<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps an internal error to the wire-visible code a CONNECTION_CLOSE
    /// frame should carry (spec §7 propagation policy).
    pub fn transport_code(&self) -> TransportError {
        match self {
            Error::FlowControl => TransportError::FlowControl,
            Error::StreamState(_) => TransportError::StreamState,
            Error::StreamLimit(_) => TransportError::StreamLimit,
            Error::FinalSize => TransportError::FinalSize,
            Error::FrameEncoding(_) | Error::UnknownFrame(_) => TransportError::FrameEncoding,
            Error::TransportParameter(_) => TransportError::TransportParameter,
            Error::ProtocolViolation(_) | Error::UnknownPacketType => {
                TransportError::ProtocolViolation
            }
            Error::ConnectionIdLimit => TransportError::ConnectionIdLimit,
            Error::InvalidToken => TransportError::InvalidToken,
            Error::Tls(_) | Error::CryptoFail => TransportError::Crypto(0),
            _ => TransportError::Internal,
        }
    }
}

/// Asserts `cond`, returning a [`ProtocolViolation`](Error::ProtocolViolation)
/// carrying `msg` otherwise. Mirrors the teacher's `require` helper.
pub fn require(cond: bool, msg: &'static str) -> QuicResult<()> {
    if !cond {
        return Err(Error::ProtocolViolation(msg));
    }
    Ok(())
}
