//! The select() loop and the per-connection phase machine.

use std::mem::MaybeUninit;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

use crate::connection::{Connection, Phase, Resolution, Ret, MAX_RESPINS};
use crate::handler::Step;
use crate::http::Status;
use crate::nonce::NONCE_LIFETIME;
use crate::server::{Clock, Server};
use crate::transport::{Io, TcpTransport};
use crate::vserver::ConfigEntry;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const SCRATCH_SIZE: usize = 4096;

/// What a connection waits for after being processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    WantRead,
    WantWrite,
    /// Can make progress without waiting on the socket.
    Again,
    Close,
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests: u64,
}

impl ServerStats {
    pub fn print(&self, srv: &Server) -> std::io::Result<()> {
        let rusage = getrusage()?;
        let (rx, tx) = srv.traffic();
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!("Requests: {}", self.requests);
        println!("Bytes: {} in, {} out", rx, tx);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

/// Switch to the error handler. False if the error handler itself failed.
fn fall_back(conn: &mut Connection, srv: &Server) -> bool {
    if conn.has_fallen_back() {
        return false;
    }
    if matches!(conn.error_code, Status::Ok | Status::PartialContent) {
        conn.error_code = Status::InternalError;
    }
    conn.setup_error_handler(srv);
    conn.phase = Phase::Initializing;
    true
}

fn close(conn: &mut Connection, srv: &Server, now: SystemTime) -> Progress {
    if let Err(e) = conn.log_delayed(now) {
        tracing::warn!("failed to write log entry: {}", e);
    }
    conn.discard_and_close(srv);
    Progress::Close
}

/// Find the configuration entry, run the access checks and create the handler, restarting when
/// the handler factory rewrites the request.
fn resolve_request(conn: &mut Connection, srv: &Server) -> Ret {
    conn.attach_logger(srv);
    let mut checked: Option<Arc<ConfigEntry>> = None;
    loop {
        let entry = match conn.entry.clone() {
            Some(entry) if conn.uses_document_root => entry,
            _ => match srv.vserver(conn.vserver).resolve(conn) {
                Resolution::Continue(entry) => entry,
                Resolution::Restart => {
                    conn.error_code = Status::InternalError;
                    return Ret::Error;
                }
                Resolution::Failed(status) => {
                    conn.error_code = status;
                    return Ret::Error;
                }
            },
        };
        conn.entry = Some(Arc::clone(&entry));

        if conn.userdir.is_empty() {
            conn.build_local_directory(srv, &entry);
        } else if conn.build_local_directory_userdir(srv, &entry) != Ret::Ok {
            return Ret::Error;
        }

        // A respin that lands on the same entry has been checked already; a Digest nonce
        // cannot be used twice.
        if checked.as_ref().map_or(true, |prev| !Arc::ptr_eq(prev, &entry)) {
            if conn.check_only_secure(&entry) != Ret::Ok
                || conn.check_ip_validation(&entry) != Ret::Ok
                || conn.check_http_method(&entry) != Ret::Ok
                || conn.check_authentication(&entry, srv) != Ret::Ok
            {
                return Ret::Error;
            }
            checked = Some(Arc::clone(&entry));
        }

        match conn.create_handler(&entry, srv) {
            Resolution::Continue(()) => break,
            Resolution::Restart => {
                conn.respins += 1;
                if conn.respins > MAX_RESPINS {
                    tracing::debug!("too many respins for {:?}", conn.request);
                    conn.error_code = Status::InternalError;
                    return Ret::Error;
                }
                conn.clean_for_respin();
            }
            Resolution::Failed(_) => return Ret::Error,
        }
    }
    conn.parse_header(&srv.encoders)
}

/// Advance `conn` as far as it goes without blocking.
pub fn process(
    conn: &mut Connection,
    srv: &Server,
    clock: &Clock,
    scratch: &mut [u8],
    stats: &mut ServerStats,
) -> Progress {
    if !matches!(conn.phase, Phase::Closing | Phase::Lingering) {
        conn.timeout = Some(clock.now + srv.timeout);
    }

    loop {
        match conn.phase {
            Phase::ReadingHeader => match conn.read_header(srv) {
                Ret::Ok => conn.phase = Phase::ResolvingRequest,
                Ret::Again => return Progress::WantRead,
                Ret::Error if conn.error_code.is_error() => {
                    if !fall_back(conn, srv) {
                        return close(conn, srv, clock.now);
                    }
                }
                Ret::Eof | Ret::Error => return close(conn, srv, clock.now),
            },

            Phase::ResolvingRequest => match conn.get_request(srv) {
                Ret::Ok => conn.phase = Phase::SettingUp,
                // Protocol switch; the phase has been set.
                Ret::Again => {}
                _ => {
                    if !fall_back(conn, srv) {
                        return close(conn, srv, clock.now);
                    }
                }
            },

            Phase::SwitchingProtocol => match conn.send_switching(srv, clock) {
                Ret::Ok => match conn.transport.start_tls() {
                    Io::Done(_) => {
                        conn.upgrade = Default::default();
                        conn.error_code = Status::Ok;
                        conn.phase = conn.phase_return.take().unwrap_or(Phase::SettingUp);
                    }
                    _ => {
                        tracing::debug!("TLS handshake failed");
                        return close(conn, srv, clock.now);
                    }
                },
                Ret::Again => return Progress::WantWrite,
                _ => return close(conn, srv, clock.now),
            },

            Phase::SettingUp => match resolve_request(conn, srv) {
                Ret::Ok if conn.post.is_complete() => conn.phase = Phase::Initializing,
                Ret::Ok => conn.phase = Phase::ReadingPost,
                _ => {
                    if !fall_back(conn, srv) {
                        return close(conn, srv, clock.now);
                    }
                }
            },

            Phase::ReadingPost => match conn.read_post() {
                Ret::Ok => conn.phase = Phase::Initializing,
                Ret::Again => return Progress::WantRead,
                _ => return close(conn, srv, clock.now),
            },

            Phase::Initializing => {
                conn.open_request();
                match conn.init_handler(srv) {
                    Ret::Ok => {
                        if let Err(e) = conn.log_or_delay(clock.now) {
                            tracing::warn!("failed to write log entry: {}", e);
                        }
                        conn.phase = Phase::AddingHeaders;
                    }
                    Ret::Again => return Progress::Again,
                    _ => {
                        if !fall_back(conn, srv) {
                            return close(conn, srv, clock.now);
                        }
                    }
                }
            }

            Phase::AddingHeaders => match conn.build_header(srv, clock) {
                Ret::Ok => {
                    conn.set_cork(true);
                    conn.phase = Phase::SendingHeader;
                }
                Ret::Again => return Progress::Again,
                _ => {
                    if !fall_back(conn, srv) {
                        return close(conn, srv, clock.now);
                    }
                }
            },

            Phase::SendingHeader => {
                let (ret, next) = if conn.mmaped.is_some() {
                    (conn.send_header_and_mmaped(srv), Phase::Done)
                } else {
                    (conn.send_header(), Phase::StreamingBody)
                };
                match ret {
                    Ret::Ok => conn.phase = next,
                    Ret::Again => return Progress::WantWrite,
                    _ => return close(conn, srv, clock.now),
                }
            }

            Phase::StreamingBody => {
                if conn.buffer.is_empty() {
                    match conn.step() {
                        Step::Ok => {}
                        Step::OkAndSent => continue,
                        Step::Eof | Step::EofHaveData => {
                            conn.phase = Phase::Flushing;
                            continue;
                        }
                        Step::Again => return Progress::Again,
                        Step::Error => return close(conn, srv, clock.now),
                    }
                }
                match conn.send() {
                    Ret::Ok => {}
                    Ret::Again => return Progress::WantWrite,
                    _ => return close(conn, srv, clock.now),
                }
            }

            Phase::Flushing => {
                if conn.buffer.is_empty() {
                    conn.phase = Phase::Done;
                    continue;
                }
                match conn.send() {
                    Ret::Ok => conn.phase = Phase::Done,
                    Ret::Again => return Progress::WantWrite,
                    _ => return close(conn, srv, clock.now),
                }
            }

            Phase::Done => {
                if conn.tcp_cork {
                    conn.set_cork(false);
                }
                if let Err(e) = conn.log_delayed(clock.now) {
                    tracing::warn!("failed to write log entry: {}", e);
                }
                stats.requests += 1;
                if conn.keepalive == 0 {
                    conn.phase = Phase::Closing;
                    continue;
                }
                conn.keepalive -= 1;
                let pipelined = conn.reset_for_reuse(srv);
                conn.timeout = Some(clock.now + srv.timeout);
                if !pipelined {
                    return Progress::WantRead;
                }
                tracing::trace!("processing pipelined request");
            }

            Phase::Closing => match conn.shutdown_wr(clock.now) {
                Ret::Ok => conn.phase = Phase::Lingering,
                _ => return close(conn, srv, clock.now),
            },

            Phase::Lingering => match conn.linger_read(scratch) {
                Ret::Ok | Ret::Again => return Progress::WantRead,
                _ => return close(conn, srv, clock.now),
            },

            Phase::Closed => return Progress::Close,
        }
    }
}

struct Slot {
    conn: Connection,
    want: Progress,
}

/// Accepts connections on one listener and serves them from a single thread.
pub struct Worker {
    listener: TcpListener,
    connections: Vec<Slot>,
    max_connections: Option<usize>,
    files_exhausted: bool,
    scratch: Vec<u8>,
    pub stats: ServerStats,
    next_purge: SystemTime,
}

impl Worker {
    pub fn new(listener: TcpListener, max_connections: Option<usize>) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: Vec::new(),
            max_connections,
            files_exhausted: false,
            scratch: vec![0; SCRATCH_SIZE],
            stats: ServerStats::default(),
            next_purge: SystemTime::now() + PURGE_INTERVAL,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept a connection and try to read from it straight away rather than going through
    /// another iteration of the select() loop.
    fn accept(&mut self, srv: &Server, clock: &Clock) {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    self.files_exhausted = true;
                }
                tracing::warn!("accept() failed: {}", e);
                return;
            }
        };
        let transport = match TcpTransport::new(stream) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("failed to set up connection: {}", e);
                return;
            }
        };

        let mut conn = Connection::new(Box::new(transport), srv);
        let want = process(&mut conn, srv, clock, &mut self.scratch, &mut self.stats);
        if want == Progress::Close {
            conn.destroy(srv);
        } else {
            self.connections.push(Slot { conn, want });
        }
    }

    /// One select() round: wait for readiness, then advance every ready connection.
    pub fn poll(&mut self, srv: &Server) -> std::io::Result<()> {
        let mut recv_set = FdSet::new();
        let mut send_set = FdSet::new();
        let listener_fd = self.listener.as_raw_fd();

        let accepting = !self.files_exhausted
            && self
                .max_connections
                .map_or(true, |max| self.connections.len() < max);
        if accepting {
            recv_set.insert(listener_fd);
        }

        let mut busy = false;
        for slot in &self.connections {
            let fd = match slot.conn.transport.raw_fd() {
                Some(fd) => fd,
                None => continue,
            };
            match slot.want {
                Progress::WantRead => recv_set.insert(fd),
                Progress::WantWrite => send_set.insert(fd),
                Progress::Again => busy = true,
                Progress::Close => {}
            }
        }

        // Wake up at least once a second so deadlines are enforced.
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: if busy { 0 } else { 1 },
            tv_usec: 0,
        });
        match select(
            None,
            Some(&mut recv_set),
            Some(&mut send_set),
            None,
            Some(&mut timeout),
        ) {
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }

        let clock = Clock::new(SystemTime::now());
        if accepting && recv_set.contains(listener_fd) {
            self.accept(srv, &clock);
        }

        let mut index = 0;
        while index < self.connections.len() {
            let slot = &mut self.connections[index];
            let ready = match (slot.want, slot.conn.transport.raw_fd()) {
                (Progress::Again, _) => true,
                (Progress::WantRead, Some(fd)) => recv_set.contains(fd),
                (Progress::WantWrite, Some(fd)) => send_set.contains(fd),
                _ => false,
            };
            if ready {
                slot.want = process(
                    &mut slot.conn,
                    srv,
                    &clock,
                    &mut self.scratch,
                    &mut self.stats,
                );
            }

            if slot.want != Progress::Close {
                if let Some(deadline) = slot.conn.timeout {
                    if clock.now >= deadline {
                        tracing::debug!("connection timed out in {:?}", slot.conn.phase);
                        slot.want = close(&mut slot.conn, srv, clock.now);
                    }
                }
            }
            if slot.conn.traffic_next.map_or(true, |next| clock.now >= next) {
                slot.conn.update_vhost_traffic(srv, clock.now);
            }

            if slot.want == Progress::Close {
                let slot = self.connections.remove(index);
                slot.conn.destroy(srv);
                // Try to resume accepting if we ran out of sockets.
                self.files_exhausted = false;
            } else {
                index += 1;
            }
        }

        if clock.now >= self.next_purge {
            let purged = srv.nonces.purge(clock.now, NONCE_LIFETIME);
            if let Some(cache) = &srv.iocache {
                cache.purge(clock.now);
            }
            tracing::trace!("purged {} expired nonces", purged);
            self.next_purge = clock.now + PURGE_INTERVAL;
        }
        Ok(())
    }

    /// Close every open connection.
    pub fn shutdown(&mut self, srv: &Server) {
        for slot in self.connections.drain(..) {
            slot.conn.destroy(srv);
        }
    }
}
