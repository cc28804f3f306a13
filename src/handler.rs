//! Content handler contract and the built-in error page handler.

use std::fmt::Write;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::buffer::Buffer;
use crate::connection::{Connection, Resolution, Ret};
use crate::http::{Method, Status};
use crate::server::Server;
use crate::util::HtmlEscaped;

/// Capabilities a handler advertises, as a bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Support(u8);

impl Support {
    pub const NOTHING: Support = Support(0);
    /// The handler emits Content-Length.
    pub const LENGTH: Support = Support(1);
    /// The handler may or may not emit Content-Length, depending on the request.
    pub const MAYBE_LENGTH: Support = Support(1 << 1);
    /// The handler honours `range_start`/`range_end`.
    pub const RANGE: Support = Support(1 << 2);
    /// The handler writes the whole response itself, status line included.
    pub const SKIP_HEADERS: Support = Support(1 << 3);

    pub fn contains(self, other: Support) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn remove(&mut self, other: Support) {
        self.0 &= !other.0;
    }
}

impl BitOr for Support {
    type Output = Support;

    fn bitor(self, rhs: Support) -> Support {
        Support(self.0 | rhs.0)
    }
}

impl BitOrAssign for Support {
    fn bitor_assign(&mut self, rhs: Support) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Support {
    type Output = Support;

    fn bitand(self, rhs: Support) -> Support {
        Support(self.0 & rhs.0)
    }
}

/// Outcome of asking a handler for its next chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A chunk was appended.
    Ok,
    /// The handler wrote to the client itself; nothing was appended.
    OkAndSent,
    /// End of content, nothing appended.
    Eof,
    /// End of content, a final chunk was appended.
    EofHaveData,
    /// Nothing available yet.
    Again,
    Error,
}

/// Produces the response for one request.
///
/// Handlers are created by a `HandlerFactory` once a request has been resolved, live until the
/// response is sent or the connection is reset, and are released by dropping them.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    fn support(&self) -> Support;

    /// Prepare the response. May set the connection's mapped region, range and redirect.
    fn init(&mut self, conn: &mut Connection, srv: &Server) -> Ret;

    /// Append handler specific header lines, each terminated by CRLF.
    fn add_headers(&mut self, out: &mut Buffer) -> Ret;

    /// Append the next chunk of content.
    fn step(&mut self, out: &mut Buffer) -> Step;
}

/// Creates a handler for a resolved request.
///
/// `Restart` asks the caller to resolve the request again because the factory rewrote it (for
/// example after splitting off path info, or after picking a directory index file).
pub trait HandlerFactory: Send + Sync {
    fn new_handler(&self, conn: &mut Connection, srv: &Server) -> Resolution<Box<dyn Handler>>;
}

/// HTML error page, also used for redirects.
#[derive(Debug)]
pub struct ErrorHandler {
    status: Status,
    body: Option<String>,
    sent: bool,
}

impl ErrorHandler {
    pub fn new(conn: &Connection, srv: &Server) -> Self {
        let status = conn.error_code;
        let body = if status.forbids_body() {
            None
        } else {
            Some(error_page(conn, srv, status))
        };
        Self {
            status,
            body,
            sent: conn.header.method() == Some(Method::Head),
        }
    }
}

fn error_page(conn: &Connection, srv: &Server, status: Status) -> String {
    let request = String::from_utf8_lossy(&conn.request);
    let reason = match status {
        Status::MovedPermanently => format!(
            "Moved to: <a href=\"{0}\">{0}</a>",
            HtmlEscaped(&String::from_utf8_lossy(&conn.redirect))
        ),
        Status::NotFound => format!(
            "The requested URL {} was not found.",
            HtmlEscaped(&request)
        ),
        Status::Forbidden => "You don't have permission to access this resource.".to_string(),
        Status::Unauthorized => "Access requires valid credentials.".to_string(),
        Status::MethodNotAllowed => "The requested method is not allowed here.".to_string(),
        Status::RangeNotSatisfiable => "The requested range cannot be satisfied.".to_string(),
        Status::UpgradeRequired => "This resource is only available over TLS.".to_string(),
        _ => "The request could not be completed.".to_string(),
    };

    let mut page = format!(
        "<html><head><title>{}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n",
        status,
        status.reason(),
        reason,
    );
    if !srv.server_string.is_empty() {
        let _ = writeln!(page, "Generated by {}", HtmlEscaped(&srv.server_string));
    }
    page.push_str("</body></html>\n");
    page
}

impl Handler for ErrorHandler {
    fn name(&self) -> &'static str {
        "error"
    }

    fn support(&self) -> Support {
        Support::LENGTH
    }

    fn init(&mut self, conn: &mut Connection, _srv: &Server) -> Ret {
        conn.range_start = 0;
        conn.range_end = self.body.as_ref().map_or(0, |body| body.len() as u64);
        Ret::Ok
    }

    fn add_headers(&mut self, out: &mut Buffer) -> Ret {
        if self.status.forbids_body() {
            return Ret::Ok;
        }
        let len = self.body.as_ref().map_or(0, |body| body.len());
        let _ = write!(
            out,
            "Content-Type: text/html; charset=UTF-8\r\nContent-Length: {}\r\n",
            len
        );
        Ret::Ok
    }

    fn step(&mut self, out: &mut Buffer) -> Step {
        if self.sent {
            return Step::Eof;
        }
        self.sent = true;
        match &self.body {
            Some(body) => {
                out.add_str(body);
                Step::EofHaveData
            }
            None => Step::Eof,
        }
    }
}

/// Factory for `ErrorHandler`, usable as a virtual host's error handler entry.
#[derive(Debug, Default)]
pub struct ErrorFactory;

impl HandlerFactory for ErrorFactory {
    fn new_handler(&self, conn: &mut Connection, srv: &Server) -> Resolution<Box<dyn Handler>> {
        Resolution::Continue(Box::new(ErrorHandler::new(conn, srv)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::transport::MockTransport;

    fn error_conn(status: Status) -> (Connection, Server) {
        let srv = Server::for_tests();
        let mut conn = Connection::new(Box::new(MockTransport::new()), &srv);
        conn.error_code = status;
        (conn, srv)
    }

    #[test]
    fn support_bits() {
        let mut support = Support::LENGTH | Support::RANGE;
        assert!(support.contains(Support::RANGE));
        assert!(!support.contains(Support::SKIP_HEADERS));
        support.remove(Support::LENGTH);
        assert!(!support.contains(Support::LENGTH));
        assert!(!support.contains(Support::NOTHING));
    }

    #[test]
    fn error_page_has_length_and_body() {
        let (mut conn, srv) = error_conn(Status::NotFound);
        conn.request.add_str("/missing<file>");
        let mut handler = ErrorHandler::new(&conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);

        let mut headers = Buffer::new();
        assert_eq!(handler.add_headers(&mut headers), Ret::Ok);
        let mut body = Buffer::new();
        assert_eq!(handler.step(&mut body), Step::EofHaveData);
        assert_eq!(handler.step(&mut body), Step::Eof);

        let body = body.to_string_lossy();
        assert!(body.contains("<title>404 Not Found</title>"));
        assert!(body.contains("/missing&lt;file&gt;"));
        assert!(headers
            .to_string_lossy()
            .contains(&format!("Content-Length: {}\r\n", body.len())));
        assert_eq!(conn.range_end, body.len() as u64);
    }

    #[test]
    fn not_modified_has_no_body() {
        let (mut conn, srv) = error_conn(Status::NotModified);
        let mut handler = ErrorHandler::new(&conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);
        let mut out = Buffer::new();
        handler.add_headers(&mut out);
        assert!(out.is_empty());
        assert_eq!(handler.step(&mut out), Step::Eof);
        assert!(out.is_empty());
    }

    #[test]
    fn redirect_page_links_location() {
        let (conn, srv) = error_conn(Status::MovedPermanently);
        let mut conn = conn;
        conn.redirect.add_str("/docs/");
        let mut handler = ErrorHandler::new(&conn, &srv);
        let mut out = Buffer::new();
        handler.step(&mut out);
        assert!(out
            .to_string_lossy()
            .contains("Moved to: <a href=\"/docs/\">/docs/</a>"));
    }
}
