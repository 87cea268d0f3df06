//! Session ticket cache file (spec §6.4).
//!
//! Format: a header giving this binary's build identifier, then zero or
//! more records of `{sni, alpn, transport_params, version, ticket}`. A file
//! whose header doesn't match the running binary is unlinked on open --
//! tickets are only ever replayed against the build that issued them.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::result::{Error, QuicResult};

/// Stand-in for "git commit hash" in environments without a build-time VCS
/// hook: the crate version, which changes on every release.
pub const BUILD_ID: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Ticket {
    pub sni: String,
    pub alpn: Vec<u8>,
    pub transport_params: Vec<u8>,
    pub version: u32,
    pub ticket: Vec<u8>,
}

fn write_record(out: &mut impl Write, t: &Ticket) -> io::Result<()> {
    write_blob(out, t.sni.as_bytes())?;
    write_blob(out, &t.alpn)?;
    write_blob(out, &t.transport_params)?;
    out.write_all(&t.version.to_be_bytes())?;
    write_blob(out, &t.ticket)
}

fn write_blob(out: &mut impl Write, data: &[u8]) -> io::Result<()> {
    out.write_all(&(data.len() as u32).to_be_bytes())?;
    out.write_all(data)
}

fn read_blob(input: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    input.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_record(input: &mut impl Read) -> io::Result<Ticket> {
    let sni = String::from_utf8(read_blob(input)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let alpn = read_blob(input)?;
    let transport_params = read_blob(input)?;
    let mut version_bytes = [0u8; 4];
    input.read_exact(&mut version_bytes)?;
    let version = u32::from_be_bytes(version_bytes);
    let ticket = read_blob(input)?;
    Ok(Ticket {
        sni,
        alpn,
        transport_params,
        version,
        ticket,
    })
}

/// Session tickets held in memory, backed by an on-disk cache file.
pub struct TicketStore {
    path: PathBuf,
    tickets: Vec<Ticket>,
}

impl TicketStore {
    /// Opens (or starts fresh) the cache at `path`. A mismatched build
    /// header causes the stale file to be unlinked rather than parsed.
    pub fn open(path: impl Into<PathBuf>) -> QuicResult<Self> {
        let path = path.into();
        let tickets = match Self::load(&path) {
            Ok(tickets) => tickets,
            Err(_) => {
                let _ = fs::remove_file(&path);
                Vec::new()
            }
        };
        Ok(Self { path, tickets })
    }

    fn load(path: &Path) -> io::Result<Vec<Ticket>> {
        let mut f = File::open(path)?;
        let header = read_blob(&mut f)?;
        if header != BUILD_ID.as_bytes() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "build id mismatch"));
        }
        let mut tickets = Vec::new();
        loop {
            match read_record(&mut f) {
                Ok(t) => tickets.push(t),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(tickets)
    }

    /// Persists every cached ticket back to disk, overwriting the file.
    pub fn flush(&self) -> QuicResult<()> {
        let mut buf = Vec::new();
        write_blob(&mut buf, BUILD_ID.as_bytes()).map_err(Error::Io)?;
        for t in &self.tickets {
            write_record(&mut buf, t).map_err(Error::Io)?;
        }
        fs::write(&self.path, buf).map_err(Error::Io)
    }

    /// Saves a freshly issued ticket (TLS callback "save-ticket", spec §9),
    /// evicting any earlier ticket for the same SNI/ALPN pair.
    pub fn save(&mut self, ticket: Ticket) -> QuicResult<()> {
        self.tickets
            .retain(|t| t.sni != ticket.sni || t.alpn != ticket.alpn);
        self.tickets.push(ticket);
        self.flush()
    }

    /// Looks up a resumable ticket for 0-RTT (spec §4.3 "0-RTT acceptance").
    pub fn find(&self, sni: &str, alpn: &[u8]) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.sni == sni && t.alpn == alpn)
    }
}

/// Bridges this file-backed store into rustls's client session-resumption
/// hook (spec §6.4, mandatory scenario 4). Rustls's own cache key bytes are
/// an internal implementation detail that varies release to release, so
/// rather than try to persist them verbatim this adapter is constructed
/// fresh per connection attempt, already scoped to one sni/alpn pair, and
/// stores just the opaque resumption value under that pair; the
/// `transport_params` field gets backfilled separately once the handshake
/// that follows resumption has told us the peer's real limits.
pub struct TicketStoreSessionCache {
    store: Arc<Mutex<TicketStore>>,
    sni: String,
    alpn: Vec<u8>,
}

impl TicketStoreSessionCache {
    pub fn new(store: Arc<Mutex<TicketStore>>, sni: String, alpn: Vec<u8>) -> Self {
        Self { store, sni, alpn }
    }
}

impl rustls::client::StoresClientSessions for TicketStoreSessionCache {
    fn put(&self, _key: Vec<u8>, value: Vec<u8>) -> bool {
        let ticket = Ticket {
            sni: self.sni.clone(),
            alpn: self.alpn.clone(),
            transport_params: Vec::new(),
            version: crate::connection::VERSION_CURRENT,
            ticket: value,
        };
        match self.store.lock() {
            Ok(mut guard) => guard.save(ticket).is_ok(),
            Err(_) => false,
        }
    }

    fn get(&self, _key: &[u8]) -> Option<Vec<u8>> {
        let guard = self.store.lock().ok()?;
        guard.find(&self.sni, &self.alpn).map(|t| t.ticket.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mini-quiche-ticket-store-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn round_trips_through_disk() {
        let path = tmp_path("roundtrip");
        let _ = fs::remove_file(&path);
        let mut store = TicketStore::open(&path).unwrap();
        store
            .save(Ticket {
                sni: "example.com".into(),
                alpn: b"h3".to_vec(),
                transport_params: vec![1, 2, 3],
                version: 1,
                ticket: vec![9, 9, 9],
            })
            .unwrap();

        let reopened = TicketStore::open(&path).unwrap();
        let found = reopened.find("example.com", b"h3").unwrap();
        assert_eq!(found.ticket, vec![9, 9, 9]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn mismatched_build_id_discards_file() {
        let path = tmp_path("mismatch");
        let mut buf = Vec::new();
        write_blob(&mut buf, b"not-a-real-version").unwrap();
        fs::write(&path, buf).unwrap();

        let store = TicketStore::open(&path).unwrap();
        assert!(store.tickets.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn session_cache_put_then_get_round_trips_through_the_file_store() {
        use rustls::client::StoresClientSessions;

        let path = tmp_path("session-cache");
        let _ = fs::remove_file(&path);
        let store = Arc::new(Mutex::new(TicketStore::open(&path).unwrap()));
        let cache = TicketStoreSessionCache::new(store, "example.com".into(), b"h3".to_vec());

        assert!(cache.get(b"anything").is_none());
        assert!(cache.put(b"rustls-internal-key".to_vec(), vec![5, 5, 5]));
        assert_eq!(cache.get(b"a-different-key"), Some(vec![5, 5, 5]));
        fs::remove_file(&path).unwrap();
    }
}
