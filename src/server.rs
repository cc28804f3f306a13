//! Runtime state shared by all connections.

use std::time::{Duration, SystemTime};

use crate::encoder::EncoderTable;
use crate::iocache::IoCache;
use crate::mime::MimeMap;
use crate::nonce::NonceTable;
use crate::util::HttpDate;
use crate::vserver::VirtualServer;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_MAX: u32 = 500;
pub const DEFAULT_MAX_HEADER_LEN: usize = 8 * 1024;
pub const DEFAULT_MAX_POST_LEN: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MMAP_MAX: u64 = 1 << 20;

pub struct Server {
    /// Index 0 is the default virtual server.
    pub vservers: Vec<VirtualServer>,
    pub nonces: NonceTable,
    pub encoders: EncoderTable,
    pub iocache: Option<IoCache>,
    pub mime: MimeMap,
    /// Value of the `Server:` header. Empty leaves the header out.
    pub server_string: String,
    pub timeout: Duration,
    /// Precomputed `Keep-Alive:` line sent with keep-alive responses.
    pub timeout_header: String,
    pub keepalive: bool,
    pub keepalive_max: u32,
    pub tls_enabled: bool,
    pub max_header_len: usize,
    /// Largest request body accepted, in bytes.
    pub max_post_len: u64,
}

impl Server {
    pub fn new(default_vserver: VirtualServer) -> Self {
        let mut server = Self {
            vservers: vec![default_vserver],
            nonces: NonceTable::new(),
            encoders: EncoderTable::with_defaults(),
            iocache: Some(IoCache::new(DEFAULT_MMAP_MAX)),
            mime: MimeMap::default(),
            server_string: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            timeout: DEFAULT_TIMEOUT,
            timeout_header: String::new(),
            keepalive: true,
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            tls_enabled: false,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_post_len: DEFAULT_MAX_POST_LEN,
        };
        server.set_timeout(DEFAULT_TIMEOUT);
        server
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.timeout_header = format!(
            "Keep-Alive: timeout={}, max={}\r\n",
            timeout.as_secs(),
            self.keepalive_max
        );
    }

    pub fn set_keepalive_max(&mut self, max: u32) {
        self.keepalive_max = max;
        self.set_timeout(self.timeout);
    }

    /// Index of the virtual server for `host`, falling back to the default one.
    pub fn get_vserver(&self, host: &[u8]) -> usize {
        self.vservers
            .iter()
            .position(|vsrv| vsrv.matches_host(host))
            .unwrap_or(0)
    }

    pub fn vserver(&self, index: usize) -> &VirtualServer {
        self.vservers.get(index).unwrap_or(&self.vservers[0])
    }

    /// Total bytes received and sent over all virtual servers.
    pub fn traffic(&self) -> (u64, u64) {
        self.vservers.iter().fold((0, 0), |(rx, tx), vsrv| {
            let (vrx, vtx) = vsrv.traffic();
            (rx + vrx, tx + vtx)
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(VirtualServer::new("default", "."))
    }
}

/// Wall-clock snapshot taken once per worker iteration.
#[derive(Clone, Debug)]
pub struct Clock {
    pub now: SystemTime,
    /// `now` in RFC 1123 format, for `Date:` headers.
    pub date: String,
}

impl Clock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now,
            date: HttpDate(now).to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_hosts_get_the_default_vserver() {
        let mut srv = Server::for_tests();
        srv.vservers.push(VirtualServer::new("example.com", "/srv/example"));
        assert_eq!(srv.get_vserver(b"example.com"), 1);
        assert_eq!(srv.get_vserver(b"other.org"), 0);
        assert_eq!(srv.vserver(42).name, "default");
    }

    #[test]
    fn timeout_header_follows_settings() {
        let mut srv = Server::for_tests();
        srv.set_timeout(Duration::from_secs(15));
        srv.set_keepalive_max(20);
        assert_eq!(srv.timeout_header, "Keep-Alive: timeout=15, max=20\r\n");
    }

    #[test]
    fn clock_formats_date() {
        let clock = Clock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000));
        assert_eq!(clock.date, "Sun, 09 Sep 2001 01:46:40 GMT");
    }
}
