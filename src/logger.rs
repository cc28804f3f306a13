//! Access and error logs.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::connection::Connection;
use crate::header::Known;
use crate::util::{ClfDate, LogEncoded};

/// Receives one entry per finished request. The connection decides when to call, the logger
/// decides what the entry looks like.
pub trait Logger: Send + Sync {
    fn write_access(&self, conn: &Connection, now: SystemTime) -> std::io::Result<()>;
    fn write_error(&self, conn: &Connection, now: SystemTime) -> std::io::Result<()>;
}

/// Where log lines go.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Append to `path`, creating it if needed.
    pub fn file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self::File(BufWriter::new(file)))
    }

    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = std::io::stdout();
                stdout.write_all(message.as_bytes())?;
                stdout.flush()?;
            }
            Self::Syslog => {
                let message = CString::new(message.trim_end_matches('\n'))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                file.write_all(message.as_bytes())?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Common Log Format writer with an optional separate sink for failed requests.
#[derive(Debug, Default)]
pub struct AccessLog {
    sink: Mutex<LogSink>,
    errors: Option<Mutex<LogSink>>,
}

impl AccessLog {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink: Mutex::new(sink),
            errors: None,
        }
    }

    pub fn with_error_sink(mut self, sink: LogSink) -> Self {
        self.errors = Some(Mutex::new(sink));
        self
    }

    fn lock(sink: &Mutex<LogSink>) -> MutexGuard<'_, LogSink> {
        sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One CLF line (combined variant) for the request on `conn`.
pub fn format_entry(conn: &Connection, now: SystemTime) -> String {
    let peer = conn
        .transport
        .peer_addr()
        .map_or_else(|| "-".to_string(), |ip| ip.to_string());
    let user = conn
        .validator
        .as_ref()
        .map(|validator| validator.credentials().user.as_str())
        .filter(|user| !user.is_empty())
        .unwrap_or("-");
    let method = conn.header.method().map_or("-", |method| method.as_str());
    let request = if conn.request_original.is_empty() {
        conn.request.as_bytes()
    } else {
        conn.request_original.as_bytes()
    };
    let query = if conn.query_string_original.is_empty() {
        conn.query_string.as_bytes()
    } else {
        conn.query_string_original.as_bytes()
    };
    let header_field = |field| {
        conn.header
            .known(field, &conn.incoming_header)
            .unwrap_or(b"")
    };

    format!(
        "{} - {} {} \"{} {}{}{} {}\" {} {} \"{}\" \"{}\"\n",
        peer,
        LogEncoded(user.as_bytes()),
        ClfDate(now),
        method,
        LogEncoded(request),
        if query.is_empty() { "" } else { "?" },
        LogEncoded(query),
        conn.header.version().status_prefix(),
        conn.error_code.code(),
        conn.range_end.saturating_sub(conn.range_start),
        LogEncoded(header_field(Known::Referer)),
        LogEncoded(header_field(Known::UserAgent)),
    )
}

impl Logger for AccessLog {
    fn write_access(&self, conn: &Connection, now: SystemTime) -> std::io::Result<()> {
        Self::lock(&self.sink).log(&format_entry(conn, now))
    }

    fn write_error(&self, conn: &Connection, now: SystemTime) -> std::io::Result<()> {
        let sink = self.errors.as_ref().unwrap_or(&self.sink);
        Self::lock(sink).log(&format_entry(conn, now))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::http::Status;
    use crate::server::Server;
    use crate::transport::MockTransport;

    fn parsed(raw: &str) -> Connection {
        let srv = Server::for_tests();
        let mut conn = Connection::new(Box::new(MockTransport::new()), &srv);
        conn.incoming_header.add_str(raw);
        let header = &mut conn.header;
        header.parse(&conn.incoming_header).unwrap();
        conn
    }

    #[test]
    fn formats_combined_log_line() {
        let mut conn = parsed(
            "GET /docs/a.txt?x=1 HTTP/1.1\r\nHost: h\r\nReferer: http://r/\r\nUser-Agent: test \"agent\"\r\n\r\n",
        );
        conn.request.add_str("/docs/a.txt");
        conn.query_string.add_str("x=1");
        conn.error_code = Status::PartialContent;
        conn.range_start = 10;
        conn.range_end = 110;

        let line = format_entry(&conn, SystemTime::UNIX_EPOCH);
        assert!(line.starts_with("127.0.0.1 - - ["), "{}", line);
        assert!(
            line.ends_with("] \"GET /docs/a.txt?x=1 HTTP/1.1\" 206 100 \"http://r/\" \"test %22agent%22\"\n"),
            "{}",
            line
        );
    }

    #[test]
    fn errors_go_to_error_sink() {
        let access = tempfile::NamedTempFile::new().unwrap();
        let errors = tempfile::NamedTempFile::new().unwrap();
        let log = AccessLog::new(LogSink::file(access.path()).unwrap())
            .with_error_sink(LogSink::file(errors.path()).unwrap());

        let mut conn = parsed("GET /missing HTTP/1.0\r\n\r\n");
        conn.request.add_str("/missing");
        conn.error_code = Status::NotFound;
        log.write_error(&conn, SystemTime::now()).unwrap();
        conn.error_code = Status::Ok;
        log.write_access(&conn, SystemTime::now()).unwrap();

        let access = std::fs::read_to_string(access.path()).unwrap();
        let errors = std::fs::read_to_string(errors.path()).unwrap();
        assert!(access.contains("\"GET /missing HTTP/1.0\" 200 0"));
        assert!(errors.contains("\"GET /missing HTTP/1.0\" 404 0"));
        assert_eq!(errors.lines().count(), 1);
    }
}
