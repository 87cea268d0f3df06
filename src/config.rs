//! Engine and connection configuration (spec §6.1, §6.5).
//!
//! `Config` mirrors the `conf` map accepted by `init`/`connect`/`bind`/
//! `accept`: every field has the documented default, and a handful of
//! builder setters override them before the engine or connection is created.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport_params::TransportParameters;

#[derive(Debug, Clone)]
pub struct Config {
    pub idle_timeout: Duration,
    pub tls_key_update_frequency: Duration,
    pub enable_spinbit: bool,
    pub enable_udp_zero_checksums: bool,
    pub enable_tls_key_updates: bool,
    pub disable_migration: bool,
    pub enable_zero_len_cid: bool,
    pub num_bufs: usize,
    pub client_scid_len: usize,
    pub server_scid_len: usize,
    pub init_max_streams_bidi: u64,
    pub init_max_streams_uni: u64,
    pub init_max_stream_data_bidi: u64,
    pub init_max_stream_data_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,

    pub ticket_store_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_log_path: Option<PathBuf>,
    pub qlog_path: Option<PathBuf>,
    pub enable_tls_cert_verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            tls_key_update_frequency: Duration::from_secs(3),
            enable_spinbit: true,
            enable_udp_zero_checksums: true,
            enable_tls_key_updates: true,
            disable_migration: false,
            enable_zero_len_cid: false,
            num_bufs: 10_000,
            client_scid_len: 4,
            server_scid_len: 8,
            // spec §6.5: 16/32 -- client-initiated/server-initiated bidi limits.
            init_max_streams_bidi: 16,
            init_max_streams_uni: 32,
            // spec §6.5: 512KB/256KB -- bidi-local/bidi-remote per-stream FC.
            init_max_stream_data_bidi: 512 * 1024,
            init_max_stream_data_uni: 256 * 1024,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),

            ticket_store_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_log_path: None,
            qlog_path: None,
            enable_tls_cert_verify: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_timeout_s(mut self, secs: u64) -> Self {
        self.idle_timeout = Duration::from_secs(secs);
        self
    }

    pub fn tls_key_update_frequency_s(mut self, secs: u64) -> Self {
        self.tls_key_update_frequency = Duration::from_secs(secs);
        self
    }

    pub fn enable_spinbit(mut self, on: bool) -> Self {
        self.enable_spinbit = on;
        self
    }

    pub fn enable_udp_zero_checksums(mut self, on: bool) -> Self {
        self.enable_udp_zero_checksums = on;
        self
    }

    pub fn enable_tls_key_updates(mut self, on: bool) -> Self {
        self.enable_tls_key_updates = on;
        self
    }

    pub fn disable_migration(mut self, on: bool) -> Self {
        self.disable_migration = on;
        self
    }

    pub fn enable_zero_len_cid(mut self, on: bool) -> Self {
        self.enable_zero_len_cid = on;
        self
    }

    pub fn num_buffers(mut self, n: usize) -> Self {
        self.num_bufs = n;
        self
    }

    pub fn ticket_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ticket_store_path = Some(path.into());
        self
    }

    pub fn tls_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_cert_path = Some(path.into());
        self
    }

    pub fn tls_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_key_path = Some(path.into());
        self
    }

    pub fn tls_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_log_path = Some(path.into());
        self
    }

    pub fn qlog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.qlog_path = Some(path.into());
        self
    }

    pub fn enable_tls_cert_verify(mut self, on: bool) -> Self {
        self.enable_tls_cert_verify = on;
        self
    }

    /// Builds the local transport parameters this config implies (spec
    /// §6.3), to be sent in the TLS extension.
    pub fn local_transport_params(&self) -> TransportParameters {
        let mut params = TransportParameters::default();
        params.idle_timeout_ms = Some(self.idle_timeout.as_millis() as u64);
        params.initial_max_data = self.init_max_stream_data_bidi * (self.init_max_streams_bidi + 1);
        params.initial_max_stream_data_bidi_local = self.init_max_stream_data_bidi;
        params.initial_max_stream_data_bidi_remote = self.init_max_stream_data_bidi;
        params.initial_max_stream_data_uni = self.init_max_stream_data_uni;
        params.initial_max_streams_bidi = self.init_max_streams_bidi;
        params.initial_max_streams_uni = self.init_max_streams_uni;
        params.ack_delay_exponent = self.ack_delay_exponent;
        params.max_ack_delay_ms = self.max_ack_delay.as_millis() as u64;
        params.disable_migration = self.disable_migration;
        params
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(10));
        assert_eq!(cfg.client_scid_len, 4);
        assert_eq!(cfg.server_scid_len, 8);
        assert_eq!(cfg.init_max_streams_bidi, 16);
        assert_eq!(cfg.init_max_streams_uni, 32);
    }

    #[test]
    fn builder_overrides_compose() {
        let cfg = Config::new().idle_timeout_s(30).disable_migration(true);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert!(cfg.disable_migration);
    }
}
