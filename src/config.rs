//! Command line configuration and construction of the runtime `Server`.

use std::collections::HashSet;
use std::net::{AddrParseError, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::getuid;

use crate::encoder::EncoderTable;
use crate::handler::HandlerFactory;
use crate::handler_file::FileFactory;
use crate::http::AuthType;
use crate::logger::{AccessLog, LogSink, Logger};
use crate::mime::DEFAULT_MIME_TYPE;
use crate::server::{
    Server, DEFAULT_KEEPALIVE_MAX, DEFAULT_MAX_HEADER_LEN, DEFAULT_MAX_POST_LEN, DEFAULT_TIMEOUT,
};
use crate::validator::{PlainUsers, ValidatorFactory};
use crate::vserver::{AccessList, ConfigEntry, Rule, VirtualServer};

const DEFAULT_INDEX_NAME: &str = "index.html";
const DEFAULT_REALM: &str = "corehttpd";

#[derive(Debug)]
pub struct Config {
    pub wwwroot: PathBuf,
    pub bindaddr: Option<String>,
    pub bindport: u16,
    pub inet6: bool,
    pub max_connections: Option<usize>,
    pub log_file: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub syslog: bool,
    pub index_names: Vec<String>,
    pub mimetypes: Option<PathBuf>,
    pub default_mimetype: Option<String>,
    pub no_keepalive: bool,
    pub keepalive_max: u32,
    pub timeout: Duration,
    pub no_server_id: bool,
    pub userdir: Option<String>,
    pub users: Vec<(String, String)>,
    pub digest: bool,
    pub realm: String,
    pub protect: Vec<String>,
    pub allow: Vec<String>,
    pub docroots: Vec<(String, PathBuf)>,
    pub vhosts: Vec<(String, PathBuf)>,
    pub pathinfo: bool,
    pub no_compression: bool,
    pub no_mmap: bool,
    pub max_header: usize,
    pub max_post: u64,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wwwroot: PathBuf::new(),
            bindaddr: None,
            bindport: if getuid().is_root() { 80 } else { 8080 },
            inet6: false,
            max_connections: None,
            log_file: None,
            error_log: None,
            syslog: false,
            index_names: Vec::new(),
            mimetypes: None,
            default_mimetype: None,
            no_keepalive: false,
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            timeout: DEFAULT_TIMEOUT,
            no_server_id: false,
            userdir: None,
            users: Vec::new(),
            digest: false,
            realm: DEFAULT_REALM.to_string(),
            protect: Vec::new(),
            allow: Vec::new(),
            docroots: Vec::new(),
            vhosts: Vec::new(),
            pathinfo: false,
            no_compression: false,
            no_mmap: false,
            max_header: DEFAULT_MAX_HEADER_LEN,
            max_post: DEFAULT_MAX_POST_LEN,
            verbose: false,
        }
    }
}

/// Split `name=value`.
fn pair(arg: &str, flag: &str) -> Result<(String, String)> {
    arg.split_once('=')
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .with_context(|| format!("expected name=value after {}, got `{}'", flag, arg))
}

impl Config {
    pub fn from_command_line() -> Result<Self> {
        Self::from_args(std::env::args())
    }

    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut config = Self::default();
        let mut args = args.into_iter();
        let name = args.next().context("expected at least one argument")?;
        match args.next().as_deref() {
            None | Some("--help") => {
                config.usage(&name); // no wwwroot given
                std::process::exit(0);
            }
            Some(wwwroot) => config.wwwroot = PathBuf::from(wwwroot),
        };

        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    config.bindport = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--addr" => {
                    config.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--ipv6" => config.inet6 = true,
                "--maxconn" => {
                    let number = args.next().context("missing number after --maxconn")?;
                    config.max_connections = Some(
                        number
                            .parse()
                            .with_context(|| format!("maxconn number {} is invalid", number))?,
                    );
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    config.log_file = Some(PathBuf::from(filename));
                }
                "--error-log" => {
                    let filename = args.next().context("missing filename after --error-log")?;
                    config.error_log = Some(PathBuf::from(filename));
                }
                "--syslog" => config.syslog = true,
                "--index" => {
                    let filename = args.next().context("missing filename after --index")?;
                    config.index_names.push(filename);
                }
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    config.mimetypes = Some(PathBuf::from(filename));
                }
                "--default-mimetype" => {
                    config.default_mimetype = Some(
                        args.next()
                            .context("missing string after --default-mimetype")?,
                    );
                }
                "--no-keepalive" => config.no_keepalive = true,
                "--keepalive-max" => {
                    let number = args.next().context("missing number after --keepalive-max")?;
                    config.keepalive_max = number
                        .parse()
                        .with_context(|| format!("keepalive-max number {} is invalid", number))?;
                }
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let timeout_secs = number
                        .parse::<u64>()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    if timeout_secs == 0 {
                        return Err(anyhow!("timeout must be at least one second"));
                    }
                    config.timeout = Duration::from_secs(timeout_secs);
                }
                "--no-server-id" => config.no_server_id = true,
                "--userdir" => {
                    config.userdir = Some(args.next().context("missing name after --userdir")?);
                }
                "--auth" => {
                    let user_pass = args.next().context("missing user:pass after --auth")?;
                    let (user, pass) = user_pass
                        .split_once(':')
                        .context("expected user:pass after --auth")?;
                    config.users.push((user.to_string(), pass.to_string()));
                }
                "--auth-digest" => config.digest = true,
                "--realm" => {
                    config.realm = args.next().context("missing string after --realm")?;
                }
                "--protect" => {
                    config
                        .protect
                        .push(args.next().context("missing directory after --protect")?);
                }
                "--allow" => {
                    config
                        .allow
                        .push(args.next().context("missing ip after --allow")?);
                }
                "--docroot" => {
                    let arg = args.next().context("missing dir=path after --docroot")?;
                    let (dir, path) = pair(&arg, "--docroot")?;
                    config.docroots.push((dir, PathBuf::from(path)));
                }
                "--vhost" => {
                    let arg = args.next().context("missing name=path after --vhost")?;
                    let (name, path) = pair(&arg, "--vhost")?;
                    config.vhosts.push((name, PathBuf::from(path)));
                }
                "--pathinfo" => config.pathinfo = true,
                "--no-compression" => config.no_compression = true,
                "--no-mmap" => config.no_mmap = true,
                "--max-header" => {
                    let number = args.next().context("missing number after --max-header")?;
                    config.max_header = number
                        .parse()
                        .with_context(|| format!("max-header number {} is invalid", number))?;
                }
                "--max-post" => {
                    let number = args.next().context("missing number after --max-post")?;
                    config.max_post = number
                        .parse()
                        .with_context(|| format!("max-post number {} is invalid", number))?;
                }
                "-v" | "--verbose" => config.verbose = true,
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }

        if !config.protect.is_empty() && config.users.is_empty() {
            return Err(anyhow!("--protect needs at least one --auth user"));
        }
        if config.index_names.is_empty() {
            config.index_names.push(DEFAULT_INDEX_NAME.to_string());
        }
        Ok(config)
    }

    pub fn usage(&self, argv0: &str) {
        print!(
            "usage:\t{} /path/to/wwwroot [flags]\n\n\
            flags:\t--port number (default: {}, or 80 if running as root)\n\
            \t\tSpecifies which port to listen on for connections.\n\
            \t\tPass 0 to let the system choose any free port for you.\n\n\
            \t--addr ip (default: all)\n\
            \t\tIf multiple interfaces are present, specifies\n\
            \t\twhich one to bind the listening port to.\n\n\
            \t--ipv6\n\
            \t\tListen on IPv6 address.\n\n\
            \t--maxconn number (default: system maximum)\n\
            \t\tSpecifies how many concurrent connections to accept.\n\n\
            \t--log filename (default: stdout)\n\
            \t\tSpecifies which file to append the request log to.\n\n\
            \t--error-log filename (default: same as --log)\n\
            \t\tAppend entries for failed requests to this file instead.\n\n\
            \t--syslog\n\
            \t\tUse syslog for request log.\n\n\
            \t--index filename (default: {})\n\
            \t\tFile to serve when a directory is requested.\n\
            \t\tMay be given several times; the first existing file wins.\n\
            \t\tA leading slash names a file below the server root.\n\n\
            \t--mimetypes filename (optional)\n\
            \t\tParses specified file for extension-MIME associations.\n\n\
            \t--default-mimetype string (optional, default: {})\n\
            \t\tFiles with unknown extensions are served as this mimetype.\n\n\
            \t--no-keepalive\n\
            \t\tDisables HTTP Keep-Alive functionality.\n\n\
            \t--keepalive-max number (default: {})\n\
            \t\tRequests served on one connection before it is closed.\n\n\
            \t--timeout secs (default: {})\n\
            \t\tIf a connection is idle for more than this many seconds,\n\
            \t\tit will be closed.\n\n\
            \t--no-server-id\n\
            \t\tDon't identify the server type in headers or error pages.\n\n\
            \t--userdir name (default: disabled)\n\
            \t\tServe /~user/ requests from this directory in the user's home.\n\n\
            \t--auth username:password\n\
            \t\tAdd a user. Without --protect, everything requires a login.\n\n\
            \t--auth-digest\n\
            \t\tAccept Digest as well as Basic authentication.\n\n\
            \t--realm string (default: {})\n\
            \t\tAuthentication realm.\n\n\
            \t--protect dir\n\
            \t\tRequire a login below dir only.\n\n\
            \t--allow ip[/prefix]\n\
            \t\tOnly serve clients from these networks.\n\n\
            \t--docroot dir=path\n\
            \t\tServe requests below dir from path.\n\n\
            \t--vhost name=path\n\
            \t\tServe Host: name from path. *.domain matches subdomains.\n\n\
            \t--pathinfo\n\
            \t\tPass trailing path components after a file as path info.\n\n\
            \t--no-compression\n\
            \t\tNever compress responses.\n\n\
            \t--no-mmap\n\
            \t\tRead files instead of mapping them.\n\n\
            \t--max-header bytes (default: {})\n\
            \t\tLargest request header accepted.\n\n\
            \t--max-post bytes (default: {})\n\
            \t\tLargest request body accepted.\n\n\
            \t-v, --verbose\n\
            \t\tTrace connection handling on stderr.\n\n",
            argv0,
            self.bindport,
            DEFAULT_INDEX_NAME,
            DEFAULT_MIME_TYPE,
            DEFAULT_KEEPALIVE_MAX,
            DEFAULT_TIMEOUT.as_secs(),
            DEFAULT_REALM,
            DEFAULT_MAX_HEADER_LEN,
            DEFAULT_MAX_POST_LEN,
        );
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        Ok(if self.inet6 {
            let addr = Ipv6Addr::from_str(self.bindaddr.as_deref().unwrap_or("::"))?;
            SocketAddr::V6(SocketAddrV6::new(addr, self.bindport, 0, 0))
        } else {
            let addr = Ipv4Addr::from_str(self.bindaddr.as_deref().unwrap_or("0.0.0.0"))?;
            SocketAddr::V4(SocketAddrV4::new(addr, self.bindport))
        })
    }

    /// Initialize the TcpListener. This is the socket that we accept connections from.
    pub fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr().context("malformed --addr argument")?;
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        println!("listening on: http://{}/", listener.local_addr().unwrap_or(socket_addr));
        Ok(listener)
    }

    fn logger(&self) -> Result<Arc<dyn Logger>> {
        let sink = match &self.log_file {
            _ if self.syslog => LogSink::Syslog,
            Some(path) => LogSink::file(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
            None => LogSink::Stdout,
        };
        let mut log = AccessLog::new(sink);
        if let Some(path) = &self.error_log {
            let sink = LogSink::file(path)
                .with_context(|| format!("failed to open error log file {}", path.display()))?;
            log = log.with_error_sink(sink);
        }
        Ok(Arc::new(log))
    }

    fn access_list(&self) -> Result<Option<AccessList>> {
        if self.allow.is_empty() {
            return Ok(None);
        }
        let mut access = AccessList::new();
        for spec in &self.allow {
            access
                .add(spec)
                .with_context(|| format!("malformed --allow argument {}", spec))?;
        }
        Ok(Some(access))
    }

    fn vserver(&self, name: &str, root: &Path, logger: &Arc<dyn Logger>) -> Result<VirtualServer> {
        let mut vsrv = VirtualServer::new(name, root);
        vsrv.index_list = self.index_names.clone();
        vsrv.userdir = self.userdir.clone().unwrap_or_default();
        vsrv.logger = Some(Arc::clone(logger));

        let files: Arc<dyn HandlerFactory> = Arc::new(FileFactory {
            allow_pathinfo: self.pathinfo,
        });
        let open = ConfigEntry {
            handler: Some(files),
            access: self.access_list()?,
            ..ConfigEntry::default()
        };
        let protected = if self.users.is_empty() {
            None
        } else {
            let authentication = if self.digest {
                AuthType::BASIC | AuthType::DIGEST
            } else {
                AuthType::BASIC
            };
            let mut users = PlainUsers::new(authentication);
            for (user, pass) in &self.users {
                users.add(user, pass);
            }
            let validator: Arc<dyn ValidatorFactory> = Arc::new(users);
            Some(ConfigEntry {
                authentication,
                realm: Some(Arc::from(self.realm.as_str())),
                users: Some(self.users.iter().map(|(user, _)| user.clone()).collect::<HashSet<_>>()),
                validator: Some(validator),
                ..open.clone()
            })
        };

        // Without --protect a login guards the whole host.
        let base = match &protected {
            Some(protected) if self.protect.is_empty() => protected.clone(),
            _ => open,
        };
        if let Some(protected) = &protected {
            for dir in &self.protect {
                vsrv.rules.push(Rule::new(dir, protected.clone()));
            }
        }
        for (dir, path) in &self.docroots {
            vsrv.rules.push(Rule::new(
                dir,
                ConfigEntry {
                    document_root: Some(path.clone()),
                    ..base.clone()
                },
            ));
        }
        vsrv.default_entry = Arc::new(base);
        Ok(vsrv)
    }

    /// Build the runtime state the worker serves from.
    pub fn build_server(&self) -> Result<Server> {
        let logger = self.logger()?;
        let mut srv = Server::new(self.vserver("default", &self.wwwroot, &logger)?);
        for (name, root) in &self.vhosts {
            srv.vservers.push(self.vserver(name, root, &logger)?);
        }

        srv.keepalive = !self.no_keepalive;
        srv.set_keepalive_max(self.keepalive_max);
        srv.set_timeout(self.timeout);
        srv.max_header_len = self.max_header;
        srv.max_post_len = self.max_post;
        if self.no_server_id {
            srv.server_string.clear();
        }
        if self.no_compression {
            srv.encoders = EncoderTable::new();
        }
        if self.no_mmap {
            srv.iocache = None;
        }
        if let Some(path) = &self.mimetypes {
            srv.mime.parse_file(path)?;
        }
        if let Some(mimetype) = &self.default_mimetype {
            srv.mime.default_type = mimetype.clone();
        }
        Ok(srv)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        Config::from_args(
            ["corehttpd", "/srv/www"]
                .iter()
                .chain(args)
                .map(|arg| arg.to_string()),
        )
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.wwwroot, PathBuf::from("/srv/www"));
        assert_eq!(config.index_names, vec![DEFAULT_INDEX_NAME.to_string()]);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(!config.no_keepalive);
    }

    #[test]
    fn parses_flags() {
        let config = parse(&[
            "--port", "0", "--addr", "127.0.0.1", "--maxconn", "10", "--timeout", "5",
            "--keepalive-max", "3", "--auth", "user:pa:ss", "--auth-digest", "--protect",
            "/private", "--vhost", "example.com=/srv/example", "--docroot", "/static=/srv/static",
            "--index", "index.htm", "--no-compression", "--max-post", "1024", "-v",
        ])
        .unwrap();
        assert_eq!(config.bindport, 0);
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive_max, 3);
        assert_eq!(config.users, vec![("user".to_string(), "pa:ss".to_string())]);
        assert!(config.digest);
        assert_eq!(config.vhosts, vec![("example.com".to_string(), PathBuf::from("/srv/example"))]);
        assert_eq!(config.docroots, vec![("/static".to_string(), PathBuf::from("/srv/static"))]);
        assert_eq!(config.index_names, vec!["index.htm".to_string()]);
        assert!(config.no_compression);
        assert_eq!(config.max_post, 1024);
        assert!(config.verbose);
        assert_eq!(
            config.socket_addr().unwrap(),
            "127.0.0.1:0".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--port"]).is_err());
        assert!(parse(&["--port", "http"]).is_err());
        assert!(parse(&["--auth", "nopassword"]).is_err());
        assert!(parse(&["--protect", "/private"]).is_err());
        assert!(parse(&["--vhost", "example.com"]).is_err());
        assert!(parse(&["--timeout", "0"]).is_err());
        assert!(parse(&["--max-post", "-1"]).is_err());
    }

    #[test]
    fn builds_server() {
        let log = tempfile::NamedTempFile::new().unwrap();
        let config = parse(&[
            "--log",
            log.path().to_str().unwrap(),
            "--no-server-id",
            "--no-keepalive",
            "--no-mmap",
            "--auth",
            "user:pass",
            "--protect",
            "/private/",
            "--vhost",
            "*.example.com=/srv/example",
            "--allow",
            "10.0.0.0/8",
            "--max-post",
            "4096",
        ])
        .unwrap();
        let srv = config.build_server().unwrap();
        assert_eq!(srv.max_post_len, 4096);
        assert_eq!(srv.vservers.len(), 2);
        assert_eq!(srv.get_vserver(b"www.example.com"), 1);
        assert!(srv.server_string.is_empty());
        assert!(!srv.keepalive);
        assert!(srv.iocache.is_none());

        let vsrv = srv.vserver(0);
        assert!(vsrv.default_entry.validator.is_none());
        assert!(vsrv.default_entry.access.is_some());
        assert_eq!(vsrv.rules.len(), 1);
        assert_eq!(vsrv.rules[0].directory(), b"/private");
        assert_eq!(vsrv.rules[0].entry.authentication, AuthType::BASIC);
        assert_eq!(vsrv.rules[0].entry.realm.as_deref(), Some(DEFAULT_REALM));
    }

    #[test]
    fn auth_without_protect_guards_everything() {
        let config = parse(&["--auth", "user:pass", "--no-mmap"]).unwrap();
        let srv = config.build_server().unwrap();
        assert!(srv.vserver(0).default_entry.validator.is_some());
    }

    #[test]
    fn bad_allow_list_fails_to_build() {
        let config = parse(&["--allow", "not-an-ip"]).unwrap();
        assert!(config.build_server().is_err());
    }
}
