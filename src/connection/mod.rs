//! One endpoint's state for a single QUIC connection (spec §3, §4).

mod connection;
mod types;

pub use connection::{is_supported_version, ConnInfo, Connection, SUPPORTED_VERSIONS, VERSION_CURRENT};
pub use types::ConnectionState;
