//! Byte channel under a connection.

#[cfg(test)]
use std::collections::VecDeque;
use std::net::{IpAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags, Shutdown};
use nix::sys::uio::{writev, IoVec};

/// Outcome of a single non-blocking transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io {
    /// The operation moved this many bytes (possibly fewer than asked for).
    Done(usize),
    /// Nothing could be moved now; retry when the socket is ready.
    WouldBlock,
    /// The peer closed the connection.
    Eof,
    /// Unrecoverable error; the transport must not be used for writing again.
    Error,
}

pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Io;
    fn write(&mut self, buf: &[u8]) -> Io;
    fn writev(&mut self, bufs: &[&[u8]]) -> Io;
    fn shutdown_write(&mut self) -> Io;
    fn close(&mut self);

    fn is_tls(&self) -> bool;
    fn set_tls(&mut self, tls: bool);

    /// Switch the channel to TLS after a protocol upgrade.
    fn start_tls(&mut self) -> Io {
        Io::Error
    }

    /// Toggle segment coalescing. Enabling also disables immediate send, and vice versa.
    fn set_cork(&mut self, _enable: bool) {}

    fn peer_addr(&self) -> Option<IpAddr>;

    /// Descriptor to wait on for readiness, if any.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Classify a nix result the way every caller wants it.
fn classify(result: nix::Result<usize>) -> Io {
    match result {
        Ok(0) => Io::Eof,
        Ok(n) => Io::Done(n),
        Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => Io::WouldBlock,
        Err(_) => Io::Error,
    }
}

/// Plain TCP socket in non-blocking mode.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: Option<IpAddr>,
    tls: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok().map(|addr| addr.ip());
        Ok(Self {
            stream: Some(stream),
            peer,
            tls: false,
        })
    }

    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|stream| stream.as_raw_fd())
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Io {
        match self.fd() {
            Some(fd) => classify(socket::recv(fd, buf, MsgFlags::empty())),
            None => Io::Error,
        }
    }

    fn write(&mut self, buf: &[u8]) -> Io {
        if buf.is_empty() {
            return Io::Done(0);
        }
        match self.fd() {
            Some(fd) => match socket::send(fd, buf, MsgFlags::empty()) {
                Ok(0) => Io::WouldBlock,
                result => classify(result),
            },
            None => Io::Error,
        }
    }

    fn writev(&mut self, bufs: &[&[u8]]) -> Io {
        let fd = match self.fd() {
            Some(fd) => fd,
            None => return Io::Error,
        };
        let iov: Vec<IoVec<&[u8]>> = bufs
            .iter()
            .filter(|buf| !buf.is_empty())
            .map(|buf| IoVec::from_slice(buf))
            .collect();
        if iov.is_empty() {
            return Io::Done(0);
        }
        match writev(fd, &iov) {
            Ok(0) => Io::WouldBlock,
            result => classify(result),
        }
    }

    fn shutdown_write(&mut self) -> Io {
        match self.fd() {
            Some(fd) => match socket::shutdown(fd, Shutdown::Write) {
                Ok(()) => Io::Done(0),
                Err(_) => Io::Error,
            },
            None => Io::Error,
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    fn set_cork(&mut self, enable: bool) {
        if let Some(fd) = self.fd() {
            if let Err(e) = set_cork(fd, enable) {
                tracing::debug!("failed to set TCP_CORK={} on fd {}: {}", enable, fd, e);
            }
        }
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.fd()
    }
}

/// Safe wrapper for `libc::setsockopt` with an `int` option value.
fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_cork(fd: RawFd, enable: bool) -> std::io::Result<()> {
    if enable {
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 0)?;
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_CORK, 1)
    } else {
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_CORK, 0)?;
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cork(fd: RawFd, enable: bool) -> std::io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, if enable { 0 } else { 1 })
}

/// One scripted reaction of a `MockTransport` to a write.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    /// Accept at most this many bytes.
    Accept(usize),
    WouldBlock,
    Error,
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockState {
    pub input: VecDeque<Vec<u8>>,
    pub input_closed: bool,
    pub write_script: VecDeque<WriteStep>,
    pub written: Vec<u8>,
    pub write_calls: usize,
    pub shut_down: bool,
    pub closed: bool,
    pub corked: bool,
    pub tls: bool,
    pub tls_started: bool,
}

/// In-memory transport with scripted behaviour, for driving a connection without sockets.
///
/// Reads are served from queued chunks (one chunk per read call, `WouldBlock` when the queue is
/// empty, `Eof` once `close_input` was called). Writes follow the queued `WriteStep`s and accept
/// everything once the script runs out. Clones share state, so a test keeps one handle while the
/// connection owns the other.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: std::sync::Arc<std::sync::Mutex<MockState>>,
    peer: Option<IpAddr>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Default::default(),
            peer: Some(IpAddr::from([127, 0, 0, 1])),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_input(&self, data: &[u8]) {
        self.state().input.push_back(data.to_vec());
    }

    pub fn close_input(&self) {
        self.state().input_closed = true;
    }

    pub fn script_writes(&self, steps: &[WriteStep]) {
        self.state().write_script.extend(steps.iter().copied());
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().written)
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Io {
        let mut state = self.state();
        if state.closed {
            return Io::Error;
        }
        match state.input.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.input.push_front(chunk.split_off(n));
                }
                Io::Done(n)
            }
            None if state.input_closed => Io::Eof,
            None => Io::WouldBlock,
        }
    }

    fn write(&mut self, buf: &[u8]) -> Io {
        self.writev(&[buf])
    }

    fn writev(&mut self, bufs: &[&[u8]]) -> Io {
        let mut state = self.state();
        let total: usize = bufs.iter().map(|buf| buf.len()).sum();
        state.write_calls += 1;
        if state.closed || state.shut_down {
            return Io::Error;
        }
        let accepted = match state.write_script.pop_front() {
            None => total,
            Some(WriteStep::Accept(n)) => n.min(total),
            Some(WriteStep::WouldBlock) => return Io::WouldBlock,
            Some(WriteStep::Error) => return Io::Error,
        };
        if accepted == 0 && total > 0 {
            return Io::WouldBlock;
        }
        let mut left = accepted;
        for buf in bufs {
            let take = left.min(buf.len());
            state.written.extend_from_slice(&buf[..take]);
            left -= take;
        }
        Io::Done(accepted)
    }

    fn shutdown_write(&mut self) -> Io {
        self.state().shut_down = true;
        Io::Done(0)
    }

    fn close(&mut self) {
        self.state().closed = true;
    }

    fn is_tls(&self) -> bool {
        self.state().tls
    }

    fn set_tls(&mut self, tls: bool) {
        self.state().tls = tls;
    }

    fn start_tls(&mut self) -> Io {
        let mut state = self.state();
        state.tls = true;
        state.tls_started = true;
        Io::Done(0)
    }

    fn set_cork(&mut self, enable: bool) {
        self.state().corked = enable;
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mock_reads_chunks_then_blocks_then_eof() {
        let mut transport = MockTransport::new();
        transport.push_input(b"hello");
        let mut buf = [0; 3];
        assert_eq!(transport.read(&mut buf), Io::Done(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(transport.read(&mut buf), Io::Done(2));
        assert_eq!(transport.read(&mut buf), Io::WouldBlock);
        transport.close_input();
        assert_eq!(transport.read(&mut buf), Io::Eof);
    }

    #[test]
    fn mock_writev_follows_script() {
        let mut transport = MockTransport::new();
        transport.script_writes(&[WriteStep::Accept(4), WriteStep::WouldBlock]);
        assert_eq!(transport.writev(&[&b"abc"[..], &b"def"[..]]), Io::Done(4));
        assert_eq!(transport.writev(&[&b"ef"[..]]), Io::WouldBlock);
        assert_eq!(transport.writev(&[&b"ef"[..]]), Io::Done(2));
        assert_eq!(transport.written(), b"abcdef");
    }
}
