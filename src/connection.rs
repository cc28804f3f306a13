//! Per-client connection: request parsing, negotiation and non-blocking response I/O.
//!
//! A `Connection` lives as long as its socket and is reused for every request that arrives on it.
//! The worker drives it through its phases; everything here returns immediately with
//! `Ret::Again` when the transport is not ready, leaving buffers exactly as they need to be for
//! the retry.

use std::collections::HashMap;
use std::fmt::Write;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::unistd::User;

use crate::buffer::Buffer;
use crate::encoder::{Encoder, EncoderTable};
use crate::handler::{ErrorHandler, Handler, Step, Support};
use crate::header::{find_end, Header, Known};
use crate::http::{AuthType, Method, Status, Upgrade, Version};
use crate::iocache::IoEntryRef;
use crate::logger::Logger;
use crate::nonce::NonceTable;
use crate::server::{Clock, Server};
use crate::transport::{Io, Transport};
use crate::util::{make_safe_url, url_decode};
use crate::validator::Validator;
use crate::vserver::ConfigEntry;

/// Trailing CRLFs after a request that are swallowed on reset.
pub const MAX_HEADER_CRLF: usize = 8;
/// Resolution restarts allowed per request.
pub const MAX_RESPINS: u32 = 8;
pub const TRAFFIC_UPDATE: Duration = Duration::from_secs(10);
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(3);
const LINGER_RETRIES: u32 = 2;
const DEFAULT_RECV_SIZE: usize = 4096;
const DEFAULT_READ_SIZE: usize = 8192;
const MAX_CONTENT_LENGTH_DIGITS: usize = 64;

/// Outcome of a connection operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ret {
    Ok,
    /// Not finished; call again once the transport is ready.
    Again,
    Eof,
    Error,
}

/// Outcome of a resolution step.
#[derive(Debug)]
pub enum Resolution<T> {
    Continue(T),
    /// The request was rewritten; resolve it again from the start.
    Restart,
    Failed(Status),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    ReadingHeader,
    ResolvingRequest,
    SwitchingProtocol,
    /// Waiting for the transport to finish a protocol switch.
    SettingUp,
    ReadingPost,
    Initializing,
    AddingHeaders,
    SendingHeader,
    StreamingBody,
    /// The handler is done; what is left in the buffer still has to go out.
    Flushing,
    Done,
    Closing,
    Lingering,
    Closed,
}

/// Request body accumulator.
#[derive(Debug, Default)]
pub struct Post {
    len: u64,
    body: Buffer,
}

impl Post {
    pub fn set_len(&mut self, len: u64) {
        self.len = len;
    }

    /// Declared Content-Length.
    pub fn expected(&self) -> u64 {
        self.len
    }

    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.body.len() as u64)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.body.add(data);
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn mrproper(&mut self) {
        self.len = 0;
        self.body.mrproper();
    }
}

/// The part of a cached file mapping that still has to be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mmaped {
    pub entry: IoEntryRef,
    pub offset: usize,
    pub len: usize,
}

pub struct Connection {
    pub phase: Phase,
    /// Phase to resume once a suspended one completes.
    pub phase_return: Option<Phase>,
    pub transport: Box<dyn Transport>,

    /// Raw bytes read so far. May hold the start of the next pipelined request.
    pub incoming_header: Buffer,
    pub header: Header,

    pub request: Buffer,
    pub request_original: Buffer,
    pub query_string: Buffer,
    pub query_string_original: Buffer,
    pub pathinfo: Buffer,
    pub host: Buffer,
    pub userdir: Buffer,
    pub redirect: Buffer,

    pub local_directory: Buffer,
    pub web_directory: Buffer,
    pub effective_directory: Buffer,

    /// Outgoing bytes: the response header, then successive content chunks.
    pub buffer: Buffer,
    pub header_buffer: Buffer,
    pub encoder_buffer: Buffer,

    pub handler: Option<Box<dyn Handler>>,
    /// Capabilities of the current handler, as adjusted for this request.
    pub support: Support,
    pub encoder: Option<Box<dyn Encoder>>,
    pub validator: Option<Box<dyn Validator>>,
    arguments: Option<HashMap<String, String>>,
    pub post: Post,
    pub mmaped: Option<Mmaped>,

    pub error_code: Status,
    pub range_start: u64,
    /// Zero means "to the end". Handlers without a known length count sent bytes here.
    pub range_end: u64,
    /// Schemes the matched entry accepts.
    pub auth_type: AuthType,
    /// Scheme the client tried.
    pub req_auth_type: AuthType,
    pub upgrade: Upgrade,
    /// Requests still allowed on this transport; 0 closes after the current response.
    pub keepalive: u32,

    pub rx: u64,
    pub tx: u64,
    pub rx_partial: u64,
    pub tx_partial: u64,
    pub traffic_next: Option<SystemTime>,
    pub timeout: Option<SystemTime>,

    /// Index into `Server::vservers`.
    pub vserver: usize,
    pub realm: Option<Arc<str>>,
    pub logger: Option<Arc<dyn Logger>>,
    pub entry: Option<Arc<ConfigEntry>>,

    pub respins: u32,
    pub tcp_cork: bool,
    pub log_at_end: bool,
    pub uses_document_root: bool,

    closed: bool,
    fallback: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, srv: &Server) -> Self {
        Self {
            phase: Phase::ReadingHeader,
            phase_return: None,
            transport,
            incoming_header: Buffer::new(),
            header: Header::new(),
            request: Buffer::new(),
            request_original: Buffer::new(),
            query_string: Buffer::new(),
            query_string_original: Buffer::new(),
            pathinfo: Buffer::new(),
            host: Buffer::new(),
            userdir: Buffer::new(),
            redirect: Buffer::new(),
            local_directory: Buffer::new(),
            web_directory: Buffer::new(),
            effective_directory: Buffer::new(),
            buffer: Buffer::new(),
            header_buffer: Buffer::new(),
            encoder_buffer: Buffer::new(),
            handler: None,
            support: Support::NOTHING,
            encoder: None,
            validator: None,
            arguments: None,
            post: Post::default(),
            mmaped: None,
            error_code: Status::Ok,
            range_start: 0,
            range_end: 0,
            auth_type: AuthType::NONE,
            req_auth_type: AuthType::NONE,
            upgrade: Upgrade::Nothing,
            keepalive: if srv.keepalive { srv.keepalive_max } else { 0 },
            rx: 0,
            tx: 0,
            rx_partial: 0,
            tx_partial: 0,
            traffic_next: None,
            timeout: None,
            vserver: 0,
            realm: None,
            logger: None,
            entry: None,
            respins: 0,
            tcp_cork: false,
            log_at_end: true,
            uses_document_root: false,
            closed: false,
            fallback: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the built-in or virtual host error handler has replaced the resolved one.
    pub fn has_fallen_back(&self) -> bool {
        self.fallback
    }

    /// Prepare for the next request on the same transport. Traffic is flushed to the virtual
    /// host first. Returns true if a pipelined request is already buffered.
    pub fn reset_for_reuse(&mut self, srv: &Server) -> bool {
        self.flush_traffic(srv);
        self.release_mmaped(srv);
        if self.tcp_cork {
            self.set_cork(false);
        }

        self.phase = Phase::ReadingHeader;
        self.phase_return = None;
        self.handler = None;
        self.support = Support::NOTHING;
        self.encoder = None;
        self.validator = None;
        self.arguments = None;
        self.entry = None;

        self.error_code = Status::Ok;
        self.range_start = 0;
        self.range_end = 0;
        self.auth_type = AuthType::NONE;
        self.req_auth_type = AuthType::NONE;
        self.upgrade = Upgrade::Nothing;
        self.rx = 0;
        self.tx = 0;
        self.traffic_next = None;
        self.timeout = None;
        self.vserver = 0;
        self.realm = None;
        self.logger = None;
        self.respins = 0;
        self.log_at_end = true;
        self.uses_document_root = false;
        self.fallback = false;

        self.post.mrproper();
        self.encoder_buffer.mrproper();
        for buf in [
            &mut self.request,
            &mut self.request_original,
            &mut self.query_string,
            &mut self.query_string_original,
            &mut self.pathinfo,
            &mut self.host,
            &mut self.userdir,
            &mut self.redirect,
            &mut self.local_directory,
            &mut self.web_directory,
            &mut self.effective_directory,
            &mut self.buffer,
            &mut self.header_buffer,
        ] {
            buf.clear();
        }

        // Drop the finished request. A few trailing CRLFs go with it; a longer run is left for
        // the next parse to skip.
        let mut consumed = self.header.length();
        let crlf = self.incoming_header.cnt_spn(consumed, b"\r\n");
        if crlf <= MAX_HEADER_CRLF {
            consumed += crlf;
        }
        self.header.clean();
        self.incoming_header.move_to_begin(consumed);

        let pipelined = !self.incoming_header.is_empty();
        tracing::trace!("connection reset, pipelined request: {}", pipelined);
        pipelined
    }

    /// Reset and close the transport; nothing buffered survives.
    pub fn discard_and_close(&mut self, srv: &Server) {
        self.keepalive = 0;
        self.reset_for_reuse(srv);
        self.incoming_header.mrproper();
        if !self.closed {
            self.transport.close();
            self.closed = true;
        }
        self.phase = Phase::Closed;
    }

    /// Tear the connection down for good.
    pub fn destroy(mut self, srv: &Server) {
        self.discard_and_close(srv);
    }

    fn release_mmaped(&mut self, srv: &Server) {
        if let Some(mmaped) = self.mmaped.take() {
            if let Some(cache) = &srv.iocache {
                cache.release(mmaped.entry);
            }
        }
    }

    /// Replace whatever handler the request had with an error page for `error_code`.
    pub fn setup_error_handler(&mut self, srv: &Server) {
        self.keepalive = 0;
        self.handler = None;
        self.encoder = None;
        self.encoder_buffer.clear();
        self.release_mmaped(srv);
        self.attach_logger(srv);

        let mut handler = None;
        if let Some(factory) = srv.vserver(self.vserver).error_handler.clone() {
            if let Resolution::Continue(custom) = factory.new_handler(self, srv) {
                handler = Some(custom);
            }
        }
        let handler = handler.unwrap_or_else(|| Box::new(ErrorHandler::new(self, srv)));
        tracing::trace!("error handler {} for {}", handler.name(), self.error_code);
        self.support = handler.support();
        self.handler = Some(handler);
        self.fallback = true;
    }

    /// Pick up the virtual host's logger unless one is set already.
    pub fn attach_logger(&mut self, srv: &Server) {
        if self.logger.is_none() {
            self.logger = srv.vserver(self.vserver).logger.clone();
        }
    }

    fn add_authenticate(&self, out: &mut Buffer, realm: &str, srv: &Server, now: SystemTime) {
        if self.auth_type.contains(AuthType::BASIC) {
            let _ = write!(out, "WWW-Authenticate: Basic realm=\"{}\"\r\n", realm);
        }
        if self.auth_type.contains(AuthType::DIGEST) {
            let nonce = srv.nonces.generate(self.transport.peer_addr(), now);
            let _ = write!(
                out,
                "WWW-Authenticate: Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\", algorithm=\"MD5\"\r\n",
                realm, nonce
            );
        }
    }

    fn build_response_header(&mut self, out: &mut Buffer, srv: &Server, clock: &Clock) {
        out.clear();

        // A streamed transform invalidates any precomputed length, and the end of the body can
        // then only be signalled by closing.
        if self.encoder.is_some() {
            self.keepalive = 0;
            self.support.remove(Support::LENGTH);
        }

        let _ = write!(
            out,
            "{} {}\r\n",
            self.header.version().status_prefix(),
            self.error_code
        );
        if self.upgrade != Upgrade::Nothing {
            out.add_str("Connection: Upgrade\r\n");
        } else if self.handler.is_some() && self.keepalive > 0 {
            out.add_str("Connection: Keep-Alive\r\n");
            out.add_str(&srv.timeout_header);
        } else {
            out.add_str("Connection: close\r\n");
        }
        let _ = write!(out, "Date: {}\r\n", clock.date);
        if !srv.server_string.is_empty() {
            let _ = write!(out, "Server: {}\r\n", srv.server_string);
        }

        if self.error_code == Status::Unauthorized {
            if let Some(realm) = self.realm.clone() {
                self.add_authenticate(out, &realm, srv, clock.now);
            }
        }
        if !self.redirect.is_empty() {
            out.add_str("Location: ");
            out.add_buffer(&self.redirect);
            out.add_str("\r\n");
        }
        if let Some(encoder) = &self.encoder {
            encoder.add_headers(out);
        }
        if self.header.method() == Some(Method::Options) {
            out.add_str("Allow: GET, HEAD, POST, OPTIONS\r\n");
        }
        if self.upgrade == Upgrade::Tls10 {
            out.add_str("Upgrade: TLS/1.0, HTTP/1.1\r\n");
        }
    }

    /// Assemble the complete response header into `buffer`.
    pub fn build_header(&mut self, srv: &Server, clock: &Clock) -> Ret {
        if self.support.contains(Support::SKIP_HEADERS) {
            return Ret::Ok;
        }

        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => return Ret::Error,
        };
        self.header_buffer.clear();
        let ret = handler.add_headers(&mut self.header_buffer);
        self.handler = Some(handler);
        if ret != Ret::Ok {
            return ret;
        }

        if self.keepalive != 0
            && self.support.contains(Support::MAYBE_LENGTH)
            && !contains_ignore_case(&self.header_buffer, b"Content-Length: ")
        {
            self.keepalive = 0;
        }

        let mut out = std::mem::take(&mut self.buffer);
        self.build_response_header(&mut out, srv, clock);
        out.add_buffer(&self.header_buffer);
        out.add_str("\r\n");
        self.buffer = out;
        Ret::Ok
    }

    /// Send the header and the mapped file region together.
    pub fn send_header_and_mmaped(&mut self, srv: &Server) -> Ret {
        let mmaped = match self.mmaped {
            Some(mmaped) => mmaped,
            None => return self.send_header(),
        };
        let region = match srv.iocache.as_ref().and_then(|cache| cache.region(mmaped.entry)) {
            Some(region) => region,
            None => {
                tracing::debug!("mapped region vanished from the cache");
                self.keepalive = 0;
                return Ret::Error;
            }
        };
        let data = match region.as_bytes().get(mmaped.offset..mmaped.offset + mmaped.len) {
            Some(data) => data,
            None => {
                self.keepalive = 0;
                return Ret::Error;
            }
        };

        let io = if self.buffer.is_empty() {
            self.transport.write(data)
        } else {
            self.transport.writev(&[self.buffer.as_bytes(), data])
        };
        let sent = match io {
            Io::Done(n) => n,
            Io::WouldBlock => return Ret::Again,
            Io::Eof => {
                self.keepalive = 0;
                return Ret::Eof;
            }
            Io::Error => {
                self.keepalive = 0;
                return Ret::Error;
            }
        };
        self.tx_add(sent);

        let header_len = self.buffer.len();
        if sent < header_len {
            self.buffer.move_to_begin(sent);
            return Ret::Again;
        }
        self.buffer.clear();

        let body_sent = (sent - header_len).min(mmaped.len);
        if body_sent == mmaped.len {
            self.release_mmaped(srv);
            return Ret::Ok;
        }
        self.mmaped = Some(Mmaped {
            offset: mmaped.offset + body_sent,
            len: mmaped.len - body_sent,
            ..mmaped
        });
        Ret::Again
    }

    fn write_buffer(&mut self) -> Result<usize, Ret> {
        match self.transport.write(&self.buffer) {
            Io::Done(n) => {
                self.tx_add(n);
                Ok(n)
            }
            Io::WouldBlock => Err(Ret::Again),
            Io::Eof => {
                self.keepalive = 0;
                Err(Ret::Eof)
            }
            Io::Error => {
                self.keepalive = 0;
                Err(Ret::Error)
            }
        }
    }

    pub fn send_header(&mut self) -> Ret {
        if self.buffer.is_empty() {
            return Ret::Ok;
        }
        let sent = match self.write_buffer() {
            Ok(sent) => sent,
            Err(ret) => return ret,
        };
        if sent >= self.buffer.len() {
            self.buffer.clear();
            Ret::Ok
        } else {
            self.buffer.move_to_begin(sent);
            Ret::Again
        }
    }

    /// Send staged content.
    pub fn send(&mut self) -> Ret {
        let sent = match self.write_buffer() {
            Ok(sent) => sent,
            Err(ret) => return ret,
        };
        let ret = if sent >= self.buffer.len() {
            self.buffer.clear();
            Ret::Ok
        } else {
            self.buffer.move_to_begin(sent);
            Ret::Again
        };
        if !self.support.contains(Support::LENGTH) {
            self.range_end += sent as u64;
        }
        ret
    }

    /// Stage the next chunk of content, encoded if an encoder is active. Does nothing while
    /// previous output is still waiting in `buffer`.
    pub fn step(&mut self) -> Step {
        if !self.buffer.is_empty() {
            return Step::Ok;
        }

        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => return Step::Error,
        };
        let step = handler.step(&mut self.buffer);
        self.handler = Some(handler);
        match step {
            Step::Ok | Step::Eof | Step::EofHaveData => {}
            other => return other,
        }

        let encoder = match self.encoder.as_mut() {
            Some(encoder) => encoder,
            None => return step,
        };
        self.encoder_buffer.clear();
        let (result, step) = match step {
            Step::Eof | Step::EofHaveData => {
                let result = encoder.flush(&self.buffer, &mut self.encoder_buffer);
                let step = if self.encoder_buffer.is_empty() {
                    Step::Eof
                } else {
                    Step::EofHaveData
                };
                (result, step)
            }
            _ => (encoder.encode(&self.buffer, &mut self.encoder_buffer), step),
        };
        if let Err(e) = result {
            tracing::debug!("encoder failed: {}", e);
            return Step::Error;
        }
        self.buffer.swap(&mut self.encoder_buffer);
        self.encoder_buffer.clear();
        step
    }

    /// Read whatever is available into `incoming_header`.
    pub fn recv(&mut self) -> Ret {
        let transport = &mut self.transport;
        let mut io = Io::WouldBlock;
        self.incoming_header.append_from(DEFAULT_RECV_SIZE, |space| {
            io = transport.read(space);
            match io {
                Io::Done(n) => n,
                _ => 0,
            }
        });
        match io {
            Io::Done(n) => {
                self.rx_add(n);
                Ret::Ok
            }
            Io::WouldBlock => Ret::Again,
            Io::Eof => {
                self.keepalive = 0;
                Ret::Eof
            }
            Io::Error => {
                self.keepalive = 0;
                Ret::Error
            }
        }
    }

    /// Read until a complete request header is buffered.
    pub fn read_header(&mut self, srv: &Server) -> Ret {
        loop {
            if find_end(&self.incoming_header).is_some() {
                return Ret::Ok;
            }
            if self.reading_check(srv) != Ret::Ok {
                return Ret::Error;
            }
            match self.recv() {
                Ret::Ok => {}
                other => return other,
            }
        }
    }

    /// Read until the declared request body is complete.
    pub fn read_post(&mut self) -> Ret {
        loop {
            self.take_post_bytes();
            if self.post.is_complete() {
                return Ret::Ok;
            }
            match self.recv() {
                Ret::Ok => {}
                other => return other,
            }
        }
    }

    /// Move body bytes buffered behind the header into `post`. Bytes beyond the declared
    /// length belong to the next request and stay.
    fn take_post_bytes(&mut self) {
        let start = self.header.length();
        let available = self.incoming_header.len().saturating_sub(start) as u64;
        let take = available.min(self.post.remaining()) as usize;
        if take > 0 {
            self.post
                .append(&self.incoming_header[start..start + take]);
            self.incoming_header.remove_range(start, start + take);
        }
    }

    pub fn reading_check(&mut self, srv: &Server) -> Ret {
        if self.incoming_header.len() > srv.max_header_len {
            self.keepalive = 0;
            return self.fail(Status::RequestEntityTooLarge);
        }
        Ret::Ok
    }

    pub fn rx_add(&mut self, n: usize) {
        self.rx += n as u64;
        self.rx_partial += n as u64;
    }

    pub fn tx_add(&mut self, n: usize) {
        self.tx += n as u64;
        self.tx_partial += n as u64;
    }

    pub fn set_cork(&mut self, enable: bool) {
        self.transport.set_cork(enable);
        self.tcp_cork = enable;
    }

    /// Half-close the transport and give the peer a short while to finish sending.
    pub fn shutdown_wr(&mut self, now: SystemTime) -> Ret {
        self.transport.set_tls(false);
        self.timeout = Some(now + LINGER_TIMEOUT);
        match self.transport.shutdown_write() {
            Io::Done(_) => Ret::Ok,
            _ => Ret::Error,
        }
    }

    /// Drain and discard what the peer still sends, a bounded number of scratch buffers at a
    /// time.
    pub fn linger_read(&mut self, scratch: &mut [u8]) -> Ret {
        let mut retries = LINGER_RETRIES;
        loop {
            match self.transport.read(scratch) {
                Io::Done(n) => {
                    retries -= 1;
                    if n == scratch.len() && retries > 0 {
                        continue;
                    }
                    return Ret::Ok;
                }
                Io::WouldBlock => return Ret::Again,
                Io::Eof => return Ret::Eof,
                Io::Error => return Ret::Error,
            }
        }
    }

    fn fail(&mut self, status: Status) -> Ret {
        self.error_code = status;
        Ret::Error
    }

    /// Parse the buffered request and normalize its components. Returns `Again` with the phase
    /// set to `SwitchingProtocol` when the client asked for a TLS upgrade.
    pub fn get_request(&mut self, srv: &Server) -> Ret {
        if let Err(status) = self.header.parse(&self.incoming_header) {
            return self.fail(status);
        }

        if self.header.method().map_or(false, Method::has_input) {
            if let Err(status) = self.post_init(srv) {
                return self.fail(status);
            }
            self.take_post_bytes();
        }

        let request = url_decode(self.header.request(&self.incoming_header));
        self.request.replace(&request);
        self.query_string
            .replace(self.header.query_string(&self.incoming_header));

        if self.request.first() != Some(&b'/') {
            return self.fail(Status::BadRequest);
        }
        match make_safe_url(&self.request) {
            Some(safe) => self.request.replace(&safe),
            None => return self.fail(Status::BadRequest),
        }
        self.request.remove_dups(b'/');

        match self.header.known(Known::Host, &self.incoming_header) {
            Some(value) => match parse_host(value) {
                Some(host) => {
                    self.host.replace(host);
                    self.vserver = srv.get_vserver(host);
                }
                None => return self.fail(Status::BadRequest),
            },
            None if self.header.version() == Version::Http11 => {
                return self.fail(Status::BadRequest)
            }
            None => {}
        }

        if !srv.vserver(self.vserver).userdir.is_empty() && self.is_userdir() {
            if let Err(status) = self.parse_userdir() {
                return self.fail(status);
            }
        }

        if srv.tls_enabled && !self.transport.is_tls() && self.wants_tls_upgrade() {
            self.upgrade = Upgrade::Tls10;
            self.phase = Phase::SwitchingProtocol;
            self.phase_return = Some(Phase::SettingUp);
            return Ret::Again;
        }

        self.error_code = Status::Ok;
        Ret::Ok
    }

    fn wants_tls_upgrade(&self) -> bool {
        let upgrade = self.header.known(Known::Upgrade, &self.incoming_header);
        let connection = self.header.known(Known::Connection, &self.incoming_header);
        match (upgrade, connection) {
            (Some(upgrade), Some(connection)) => {
                starts_with_ignore_case(connection, b"Upgrade")
                    && starts_with_ignore_case(upgrade, b"TLS")
            }
            _ => false,
        }
    }

    fn post_init(&mut self, srv: &Server) -> Result<(), Status> {
        let value = self
            .header
            .known(Known::ContentLength, &self.incoming_header)
            .ok_or(Status::LengthRequired)?;
        if value.is_empty() || value.len() >= MAX_CONTENT_LENGTH_DIGITS {
            return Err(Status::BadRequest);
        }
        let len = parse_decimal(value).ok_or(Status::BadRequest)?;
        if len > srv.max_post_len {
            self.keepalive = 0;
            return Err(Status::RequestEntityTooLarge);
        }
        self.post.set_len(len);
        Ok(())
    }

    /// Send `101 Switching Protocols`.
    pub fn send_switching(&mut self, srv: &Server, clock: &Clock) -> Ret {
        if self.buffer.is_empty() {
            self.error_code = Status::SwitchingProtocols;
            let mut out = std::mem::take(&mut self.buffer);
            self.build_response_header(&mut out, srv, clock);
            out.add_str("\r\n");
            self.buffer = out;
        }
        self.send_header()
    }

    /// Keep the client's request and query string before the first rewrite.
    pub fn save_original_request(&mut self) {
        if self.request_original.is_empty() {
            self.request_original.add_buffer(&self.request);
            self.query_string_original.add_buffer(&self.query_string);
        }
    }

    pub fn is_userdir(&self) -> bool {
        self.request.len() > 3 && self.request[1] == b'~'
    }

    /// Split `/~user/rest` into `userdir` and `request`.
    fn parse_userdir(&mut self) -> Result<(), Status> {
        match self.request[2..].iter().position(|&b| b == b'/') {
            None => {
                self.redirect.add_buffer(&self.request);
                self.redirect.add_char(b'/');
                Err(Status::MovedPermanently)
            }
            Some(0) => Err(Status::BadRequest),
            Some(len) => {
                self.userdir.add(&self.request[2..2 + len]);
                self.request.move_to_begin(2 + len);
                Ok(())
            }
        }
    }

    pub fn check_only_secure(&mut self, entry: &ConfigEntry) -> Ret {
        if !entry.only_secure || self.transport.is_tls() {
            return Ret::Ok;
        }
        self.upgrade = Upgrade::Tls10;
        self.fail(Status::UpgradeRequired)
    }

    pub fn check_ip_validation(&mut self, entry: &ConfigEntry) -> Ret {
        let access = match &entry.access {
            Some(access) => access,
            None => return Ret::Ok,
        };
        match self.transport.peer_addr() {
            Some(ip) if access.matches(ip) => Ret::Ok,
            _ => self.fail(Status::Forbidden),
        }
    }

    pub fn check_http_method(&mut self, entry: &ConfigEntry) -> Ret {
        match self.header.method() {
            Some(method) if entry.methods.contains(method) => Ret::Ok,
            _ => self.fail(Status::MethodNotAllowed),
        }
    }

    /// Validate the Authorization header if the entry asks for it.
    pub fn check_authentication(&mut self, entry: &ConfigEntry, srv: &Server) -> Ret {
        if entry.validator.is_none() {
            return Ret::Ok;
        }
        self.auth_type = entry.authentication;
        self.realm = entry.realm.clone();
        match self.authenticate(entry, srv) {
            Ok(()) => Ret::Ok,
            Err(status) => {
                tracing::trace!("authentication failed: {}", status);
                self.keepalive = 0;
                self.fail(status)
            }
        }
    }

    fn authenticate(&mut self, entry: &ConfigEntry, srv: &Server) -> Result<(), Status> {
        let factory = entry.validator.as_ref().ok_or(Status::InternalError)?;
        let value = self
            .header
            .known(Known::Authorization, &self.incoming_header)
            .ok_or(Status::Unauthorized)?;
        let mut validator = factory.new_validator().ok_or(Status::InternalError)?;

        let result = match get_authorization(
            value,
            entry.authentication,
            validator.as_mut(),
            &srv.nonces,
        ) {
            Some(scheme) => {
                self.req_auth_type = scheme;
                self.verify(entry, validator.as_mut())
            }
            None => Err(Status::Unauthorized),
        };
        self.validator = Some(validator);
        result
    }

    fn verify(&self, entry: &ConfigEntry, validator: &mut dyn Validator) -> Result<(), Status> {
        if let Some(users) = &entry.users {
            let user = &validator.credentials().user;
            if user.is_empty() || !users.contains(user) {
                return Err(Status::Unauthorized);
            }
        }
        if !validator.support().intersects(self.req_auth_type) {
            return Err(Status::InternalError);
        }
        if validator.check(self) {
            Ok(())
        } else {
            Err(Status::Unauthorized)
        }
    }

    /// Ask the entry's factory for a handler.
    pub fn create_handler(&mut self, entry: &ConfigEntry, srv: &Server) -> Resolution<()> {
        let factory = match &entry.handler {
            Some(factory) => Arc::clone(factory),
            None => {
                self.error_code = Status::InternalError;
                return Resolution::Failed(Status::InternalError);
            }
        };
        match factory.new_handler(self, srv) {
            Resolution::Continue(handler) => {
                tracing::trace!("new handler {}", handler.name());
                self.support = handler.support();
                self.handler = Some(handler);
                Resolution::Continue(())
            }
            Resolution::Restart => Resolution::Restart,
            Resolution::Failed(status) => {
                self.error_code = status;
                Resolution::Failed(status)
            }
        }
    }

    /// Apply Connection, Range and Accept-Encoding once the handler is known.
    pub fn parse_header(&mut self, encoders: &EncoderTable) -> Ret {
        match self.header.known(Known::Connection, &self.incoming_header) {
            Some(value) if !starts_with_ignore_case(value, b"close") => {}
            _ => self.keepalive = 0,
        }

        if self.support.contains(Support::RANGE) {
            if let Some(value) = self.header.known(Known::Range, &self.incoming_header) {
                if value.starts_with(b"bytes=") {
                    match parse_range(&value[6..]) {
                        Some((start, end)) => {
                            self.range_start = start;
                            self.range_end = end;
                        }
                        None => return self.fail(Status::RangeNotSatisfiable),
                    }
                }
            }
        }

        let mut chosen = None;
        if let Some(value) = self.header.known(Known::AcceptEncoding, &self.incoming_header) {
            if let Some(ext) = extension(&self.request) {
                for token in value.split(|&b| b == b',' || b == b';') {
                    let mut encoder = match encoders.new_encoder(token, ext) {
                        Some(encoder) => encoder,
                        None => continue,
                    };
                    match encoder.init(self) {
                        Ok(()) => {
                            chosen = Some(encoder);
                            break;
                        }
                        Err(e) => tracing::debug!("encoder {} refused: {}", encoder.name(), e),
                    }
                }
            }
        }
        if chosen.is_some() {
            self.encoder = chosen;
            self.encoder_buffer.clear();
        }
        Ret::Ok
    }

    /// Query string arguments, parsed on first use. The first occurrence of a key wins.
    pub fn arguments(&mut self) -> &HashMap<String, String> {
        let query = &self.query_string;
        self.arguments.get_or_insert_with(|| parse_query(query))
    }

    /// Initialise the handler.
    pub fn open_request(&mut self) -> Ret {
        tracing::trace!(
            "web_directory={:?} request={:?} local_directory={:?}",
            self.web_directory,
            self.request,
            self.local_directory
        );
        if !self.support.contains(Support::LENGTH) && !self.support.contains(Support::MAYBE_LENGTH)
        {
            self.keepalive = 0;
        }
        self.header_buffer.ensure_size(384);
        self.buffer.ensure_size(DEFAULT_READ_SIZE + 1);
        Ret::Ok
    }

    /// Run the handler's init with the connection available to it.
    pub fn init_handler(&mut self, srv: &Server) -> Ret {
        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => return Ret::Error,
        };
        let ret = handler.init(self, srv);
        self.handler = Some(handler);
        ret
    }

    /// Log now if the response length is known up front, otherwise remember to do it at the end.
    pub fn log_or_delay(&mut self, now: SystemTime) -> std::io::Result<()> {
        self.log_at_end = self.handler.is_none() || !self.support.contains(Support::LENGTH);
        if self.log_at_end {
            return Ok(());
        }
        self.write_log(now)
    }

    pub fn log_delayed(&mut self, now: SystemTime) -> std::io::Result<()> {
        if !self.log_at_end {
            return Ok(());
        }
        self.log_at_end = false;
        self.write_log(now)
    }

    fn write_log(&self, now: SystemTime) -> std::io::Result<()> {
        let logger = match &self.logger {
            Some(logger) => logger,
            None => return Ok(()),
        };
        if self.error_code.is_error() {
            logger.write_error(self, now)
        } else {
            logger.write_access(self, now)
        }
    }

    /// Move the partial traffic counters into the virtual host totals.
    pub fn flush_traffic(&mut self, srv: &Server) {
        if self.rx_partial == 0 && self.tx_partial == 0 {
            return;
        }
        let vsrv = srv.vserver(self.vserver);
        vsrv.add_rx(self.rx_partial);
        vsrv.add_tx(self.tx_partial);
        self.rx_partial = 0;
        self.tx_partial = 0;
    }

    pub fn update_vhost_traffic(&mut self, srv: &Server, now: SystemTime) {
        self.flush_traffic(srv);
        self.traffic_next = Some(now + TRAFFIC_UPDATE);
    }

    pub fn clean_for_respin(&mut self) {
        self.web_directory.clear();
        self.local_directory.clear();
    }

    /// Set `local_directory` from the entry's document root or the virtual host root.
    pub fn build_local_directory(&mut self, srv: &Server, entry: &ConfigEntry) {
        if self.use_document_root(entry) {
            return;
        }
        let root = srv.vserver(self.vserver).root.as_os_str().as_bytes();
        self.local_directory.add(root);
    }

    /// Set `local_directory` for a `/~user/` request.
    pub fn build_local_directory_userdir(&mut self, srv: &Server, entry: &ConfigEntry) -> Ret {
        if self.use_document_root(entry) {
            return Ret::Ok;
        }
        let name = String::from_utf8_lossy(&self.userdir).into_owned();
        match User::from_name(&name) {
            Ok(Some(user)) => {
                self.local_directory.add(user.dir.as_os_str().as_bytes());
                self.local_directory.add_char(b'/');
                self.local_directory
                    .add_str(&srv.vserver(self.vserver).userdir);
                Ret::Ok
            }
            Ok(None) => self.fail(Status::NotFound),
            Err(e) => {
                tracing::debug!("user lookup for {:?} failed: {}", name, e);
                self.fail(Status::NotFound)
            }
        }
    }

    /// With a document root the matched web directory is cut off the request. On a respin the
    /// request has already been cut.
    fn use_document_root(&mut self, entry: &ConfigEntry) -> bool {
        let root = match &entry.document_root {
            Some(root) if !root.as_os_str().is_empty() => root,
            _ => return false,
        };
        self.local_directory.add(root.as_os_str().as_bytes());
        if self.uses_document_root {
            return true;
        }
        self.uses_document_root = true;

        self.save_original_request();
        let web_len = match self.web_directory.as_bytes() {
            b"/" => 0,
            web => web.len(),
        };
        self.request.move_to_begin(web_len);
        if self.request.starts_with(b"//") {
            self.request.move_to_begin(1);
        }
        if self.request.is_empty() {
            self.request.add_char(b'/');
        }
        true
    }
}

/// Parse the Authorization header value. Returns the scheme the client used if it is allowed
/// and its credentials parse (and, for Digest, carry an outstanding nonce).
fn get_authorization(
    value: &[u8],
    allowed: AuthType,
    validator: &mut dyn Validator,
    nonces: &NonceTable,
) -> Option<AuthType> {
    let (scheme, payload) = if value.starts_with(b"Basic ") {
        (AuthType::BASIC, &value[6..])
    } else if value.starts_with(b"Digest ") {
        (AuthType::DIGEST, &value[7..])
    } else {
        return None;
    };
    if !allowed.contains(scheme) {
        return None;
    }
    let end = payload
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(payload.len());
    let payload = &payload[..end];

    if scheme == AuthType::BASIC {
        if !validator.parse_basic(payload) {
            return None;
        }
    } else {
        if !validator.parse_digest(payload) {
            return None;
        }
        let nonce = &validator.credentials().nonce;
        if nonce.is_empty() || !nonces.remove(nonce.as_bytes()) {
            return None;
        }
    }
    Some(scheme)
}

/// Host name without port and without a trailing dot. None for names starting with a dot.
pub fn parse_host(value: &[u8]) -> Option<&[u8]> {
    let host = if value.first() == Some(&b'[') {
        let close = value.iter().position(|&b| b == b']')?;
        &value[..=close]
    } else {
        match value.iter().rposition(|&b| b == b':') {
            Some(colon) => &value[..colon],
            None => value,
        }
    };
    if host.is_empty() || host[0] == b'.' {
        return None;
    }
    Some(match host {
        [rest @ .., b'.'] => rest,
        host => host,
    })
}

/// Parse the part of a Range header after `bytes=`. An end of 0 means "to the end".
pub fn parse_range(spec: &[u8]) -> Option<(u64, u64)> {
    let dash = spec.iter().position(|&b| b == b'-')?;
    let start = match &spec[..dash] {
        [] => 0,
        digits => parse_decimal(digits)?,
    };

    let rest = &spec[dash + 1..];
    let end = match rest.first() {
        None | Some(b'\r') | Some(b'\n') | Some(b',') => 0,
        Some(_) => {
            let len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
            match parse_decimal(&rest[..len]) {
                Some(end) if end >= 1 => end,
                _ => return None,
            }
        }
    };

    if start != 0 && end != 0 && start > end {
        return None;
    }
    Some((start, end))
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Extension of the last path segment.
fn extension(request: &[u8]) -> Option<&[u8]> {
    let name = match request.iter().rposition(|&b| b == b'/') {
        Some(slash) => &request[slash + 1..],
        None => request,
    };
    name.iter()
        .rposition(|&b| b == b'.')
        .map(|dot| &name[dot + 1..])
}

fn parse_query(query: &[u8]) -> HashMap<String, String> {
    let mut arguments = HashMap::new();
    for pair in query.split(|&b| b == b'&').filter(|pair| !pair.is_empty()) {
        let (key, value) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &[][..]),
        };
        let key = String::from_utf8_lossy(&url_decode(key)).into_owned();
        arguments
            .entry(key)
            .or_insert_with(|| String::from_utf8_lossy(&url_decode(value)).into_owned());
    }
    arguments
}

fn starts_with_ignore_case(value: &[u8], prefix: &[u8]) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}
