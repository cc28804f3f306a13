//! Virtual hosts, their directory rules and the configuration entries rules resolve to.

use std::collections::HashSet;
use std::ffi::OsString;
use std::net::IpAddr;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::{Connection, Resolution};
use crate::handler::HandlerFactory;
use crate::handler_file::FileFactory;
use crate::http::{AuthType, MethodSet, Status};
use crate::logger::Logger;
use crate::validator::ValidatorFactory;

/// Client addresses allowed to reach an entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessList {
    networks: Vec<(IpAddr, u8)>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `addr` or `addr/prefix`.
    pub fn add(&mut self, spec: &str) -> Result<(), std::net::AddrParseError> {
        let (addr, prefix) = match spec.find('/') {
            Some(slash) => (&spec[..slash], spec[slash + 1..].parse::<u8>().ok()),
            None => (spec, None),
        };
        let addr = IpAddr::from_str(addr)?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        self.networks
            .push((addr, prefix.map_or(max, |prefix| prefix.min(max))));
        Ok(())
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.networks
            .iter()
            .any(|&(network, prefix)| same_network(network, ip, prefix))
    }
}

fn same_network(network: IpAddr, ip: IpAddr, prefix: u8) -> bool {
    match (network, ip) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(network) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(network) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// What a matched rule says about a request.
#[derive(Clone)]
pub struct ConfigEntry {
    pub methods: MethodSet,
    /// Schemes clients may authenticate with.
    pub authentication: AuthType,
    pub realm: Option<Arc<str>>,
    /// If set, only these users get in, whatever the validator says.
    pub users: Option<HashSet<String>>,
    pub access: Option<AccessList>,
    pub only_secure: bool,
    pub handler: Option<Arc<dyn HandlerFactory>>,
    pub validator: Option<Arc<dyn ValidatorFactory>>,
    pub document_root: Option<PathBuf>,
}

impl Default for ConfigEntry {
    fn default() -> Self {
        Self {
            methods: MethodSet::common(),
            authentication: AuthType::NONE,
            realm: None,
            users: None,
            access: None,
            only_secure: false,
            handler: None,
            validator: None,
            document_root: None,
        }
    }
}

/// Maps a web directory to a configuration entry.
#[derive(Clone)]
pub struct Rule {
    directory: Vec<u8>,
    pub entry: Arc<ConfigEntry>,
}

impl Rule {
    pub fn new(directory: &str, entry: ConfigEntry) -> Self {
        let mut directory = directory.as_bytes().to_vec();
        if directory.first() != Some(&b'/') {
            directory.insert(0, b'/');
        }
        while directory.len() > 1 && directory.ends_with(b"/") {
            directory.pop();
        }
        Self {
            directory,
            entry: Arc::new(entry),
        }
    }

    pub fn directory(&self) -> &[u8] {
        &self.directory
    }

    /// True if `request` is the rule's directory or lies below it.
    fn matches(&self, request: &[u8]) -> bool {
        if !request.starts_with(&self.directory) {
            return false;
        }
        self.directory == b"/"
            || request.len() == self.directory.len()
            || request[self.directory.len()] == b'/'
    }
}

pub struct VirtualServer {
    pub name: String,
    pub aliases: Vec<String>,
    pub root: PathBuf,
    /// Directory inside a user's home served for `/~user/` requests. Empty disables userdirs.
    pub userdir: String,
    pub index_list: Vec<String>,
    pub rules: Vec<Rule>,
    pub default_entry: Arc<ConfigEntry>,
    pub error_handler: Option<Arc<dyn HandlerFactory>>,
    pub logger: Option<Arc<dyn Logger>>,
    rx: AtomicU64,
    tx: AtomicU64,
}

impl VirtualServer {
    /// A host serving files from `root` with the default rule set.
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        // Requests start with a slash, so the root must not end with one.
        let root: PathBuf = root.into();
        let mut root = root.into_os_string().into_vec();
        while root.len() > 1 && root.ends_with(b"/") {
            root.pop();
        }
        let root = PathBuf::from(OsString::from_vec(root));
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            root,
            userdir: String::new(),
            index_list: vec!["index.html".to_string()],
            rules: Vec::new(),
            default_entry: Arc::new(ConfigEntry {
                handler: Some(Arc::new(FileFactory::default())),
                ..ConfigEntry::default()
            }),
            error_handler: None,
            logger: None,
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
        }
    }

    /// Whether `host` names this virtual server. `*.example.com` style names match subdomains.
    pub fn matches_host(&self, host: &[u8]) -> bool {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .any(|name| match name.strip_prefix('*') {
                Some(suffix) => {
                    host.len() > suffix.len()
                        && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
                }
                None => host.eq_ignore_ascii_case(name.as_bytes()),
            })
    }

    /// Find the entry for the connection's request: the longest matching rule, or the default
    /// entry. Sets `web_directory`; a request naming a rule directory without the trailing slash
    /// is redirected.
    pub fn resolve(&self, conn: &mut Connection) -> Resolution<Arc<ConfigEntry>> {
        let request = conn.request.as_bytes();
        let rule = self
            .rules
            .iter()
            .filter(|rule| rule.matches(request))
            .max_by_key(|rule| rule.directory.len());

        let rule = match rule {
            Some(rule) => rule,
            None => {
                conn.web_directory.add_char(b'/');
                return Resolution::Continue(Arc::clone(&self.default_entry));
            }
        };

        conn.web_directory.add(&rule.directory);
        if request.len() > 1 && request == rule.directory.as_slice() {
            conn.redirect.add(request);
            conn.redirect.add_char(b'/');
            tracing::trace!("redirecting to {}", conn.redirect.to_string_lossy());
            return Resolution::Failed(Status::MovedPermanently);
        }
        Resolution::Continue(Arc::clone(&rule.entry))
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes received and sent, as flushed by connections so far.
    pub fn traffic(&self) -> (u64, u64) {
        (self.rx.load(Ordering::Relaxed), self.tx.load(Ordering::Relaxed))
    }
}
