//! Request header parser.
//!
//! The parser never copies or mutates the raw bytes: every parsed component is recorded as a
//! byte range into the buffer that was parsed, and accessors slice that same buffer again.

use std::ops::Range;

use crate::http::{Method, Status, Version};

/// Header fields the connection core looks up by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Known {
    AcceptEncoding,
    Authorization,
    Connection,
    ContentLength,
    Host,
    IfModifiedSince,
    Range,
    Referer,
    Upgrade,
    UserAgent,
}

const KNOWN_NAMES: &[(Known, &str)] = &[
    (Known::AcceptEncoding, "Accept-Encoding"),
    (Known::Authorization, "Authorization"),
    (Known::Connection, "Connection"),
    (Known::ContentLength, "Content-Length"),
    (Known::Host, "Host"),
    (Known::IfModifiedSince, "If-Modified-Since"),
    (Known::Range, "Range"),
    (Known::Referer, "Referer"),
    (Known::Upgrade, "Upgrade"),
    (Known::UserAgent, "User-Agent"),
];

const MAX_URI_LEN: usize = 8 * 1024;

type Span = Range<usize>;

#[derive(Debug, Default)]
pub struct Header {
    method: Option<Method>,
    version: Option<Version>,
    request: Span,
    query_string: Option<Span>,
    known: [Option<Span>; KNOWN_NAMES.len()],
    unknown: Vec<(Span, Span)>,
    length: usize,
}

/// Length of the request header at the start of `buf`, terminator included, or None if the
/// terminating empty line hasn't arrived yet. Leading empty lines are skipped and counted.
pub fn find_end(buf: &[u8]) -> Option<usize> {
    let start = buf
        .iter()
        .take_while(|&&b| b == b'\r' || b == b'\n')
        .count();
    for i in start..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        match (buf.get(i + 1), buf.get(i + 2)) {
            (Some(b'\n'), _) => return Some(i + 2),
            (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
            _ => {}
        }
    }
    None
}

/// Returns the end of the line starting at `from` (without its terminator) and the start of the
/// following line.
fn next_line(buf: &[u8], from: usize, limit: usize) -> (usize, usize) {
    match buf[from..limit].iter().position(|&b| b == b'\n') {
        Some(i) => {
            let newline = from + i;
            let line_end = if newline > from && buf[newline - 1] == b'\r' {
                newline - 1
            } else {
                newline
            };
            (line_end, newline + 1)
        }
        None => (limit, limit),
    }
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything parsed so far.
    pub fn clean(&mut self) {
        *self = Self::default();
    }

    pub fn is_parsed(&self) -> bool {
        self.length > 0
    }

    /// Bytes of the buffer consumed by the header, terminator included. Zero until parsed.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version.unwrap_or(Version::Http11)
    }

    pub fn request<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.request.clone()).unwrap_or(&[])
    }

    pub fn query_string<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        self.query_string
            .clone()
            .and_then(|span| buf.get(span))
            .unwrap_or(&[])
    }

    pub fn known<'a>(&self, field: Known, buf: &'a [u8]) -> Option<&'a [u8]> {
        let index = KNOWN_NAMES.iter().position(|(k, _)| *k == field)?;
        self.known[index].clone().and_then(|span| buf.get(span))
    }

    /// Look up a header without a dedicated slot, case-insensitively.
    pub fn unknown<'a>(&self, name: &str, buf: &'a [u8]) -> Option<&'a [u8]> {
        self.unknown
            .iter()
            .find(|(n, _)| buf[n.clone()].eq_ignore_ascii_case(name.as_bytes()))
            .and_then(|(_, value)| buf.get(value.clone()))
    }

    /// Parse the header at the start of `buf`. On failure the status describes what was wrong.
    pub fn parse(&mut self, buf: &[u8]) -> Result<(), Status> {
        self.clean();
        let end = find_end(buf).ok_or(Status::BadRequest)?;

        let mut pos = buf[..end]
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        let (line_end, next) = next_line(buf, pos, end);
        self.parse_request_line(buf, pos, line_end)?;
        pos = next;

        while pos < end {
            let (line_end, next) = next_line(buf, pos, end);
            if line_end == pos {
                break;
            }
            self.parse_field(buf, pos, line_end)?;
            pos = next;
        }

        self.length = end;
        Ok(())
    }

    fn parse_request_line(&mut self, buf: &[u8], start: usize, end: usize) -> Result<(), Status> {
        let line = &buf[start..end];

        let method_len = line
            .iter()
            .position(|&b| b == b' ')
            .ok_or(Status::BadRequest)?;
        self.method = Some(Method::from_bytes(&line[..method_len]).ok_or(Status::NotImplemented)?);

        let uri_start = method_len
            + 1
            + line[method_len + 1..]
                .iter()
                .take_while(|&&b| b == b' ')
                .count();
        let uri_len = line[uri_start..]
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or(line.len() - uri_start);
        if uri_len == 0 {
            return Err(Status::BadRequest);
        }
        if uri_len > MAX_URI_LEN {
            return Err(Status::RequestUriTooLong);
        }

        let uri = start + uri_start..start + uri_start + uri_len;
        match buf[uri.clone()].iter().position(|&b| b == b'?') {
            Some(q) => {
                self.request = uri.start..uri.start + q;
                self.query_string = Some(uri.start + q + 1..uri.end);
            }
            None => self.request = uri,
        }

        let rest = &line[uri_start + uri_len..];
        let protocol = &rest[rest.iter().take_while(|&&b| b == b' ').count()..];
        self.version = Some(match protocol {
            b"" => Version::Http09,
            b"HTTP/1.0" => Version::Http10,
            b"HTTP/1.1" => Version::Http11,
            p if p.starts_with(b"HTTP/") => return Err(Status::VersionNotSupported),
            _ => return Err(Status::BadRequest),
        });
        Ok(())
    }

    fn parse_field(&mut self, buf: &[u8], start: usize, end: usize) -> Result<(), Status> {
        let line = &buf[start..end];
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(Status::BadRequest)?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|&b| b == b' ' || b == b'\t') {
            return Err(Status::BadRequest);
        }

        let mut value_start = start + colon + 1;
        while value_start < end && matches!(buf[value_start], b' ' | b'\t') {
            value_start += 1;
        }
        let mut value_end = end;
        while value_end > value_start && matches!(buf[value_end - 1], b' ' | b'\t') {
            value_end -= 1;
        }
        let value = value_start..value_end;

        match KNOWN_NAMES
            .iter()
            .position(|(_, n)| n.as_bytes().eq_ignore_ascii_case(name))
        {
            // First occurrence wins.
            Some(index) => {
                if self.known[index].is_none() {
                    self.known[index] = Some(value);
                }
            }
            None => self.unknown.push((start..start + colon, value)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", Some(27) ; "crlf")]
    #[test_case(b"GET /\n\n", Some(7) ; "bare lf")]
    #[test_case(b"\r\n\r\nGET / HTTP/1.0\r\n\r\n", Some(22) ; "leading crlf")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: a\r\n", None ; "incomplete")]
    fn find_end_works(buf: &[u8], expected: Option<usize>) {
        assert_eq!(find_end(buf), expected);
    }

    #[test]
    fn parses_request_line_and_fields() {
        let buf = b"GET /a/b?x=1&y=2 HTTP/1.1\r\nhost: example.com\r\nRange:  bytes=0-9 \r\nX-Custom: yes\r\n\r\nBODY";
        let mut header = Header::new();
        header.parse(buf).unwrap();
        assert_eq!(header.method(), Some(Method::Get));
        assert_eq!(header.version(), Version::Http11);
        assert_eq!(header.request(buf), b"/a/b");
        assert_eq!(header.query_string(buf), b"x=1&y=2");
        assert_eq!(header.known(Known::Host, buf), Some(&b"example.com"[..]));
        assert_eq!(header.known(Known::Range, buf), Some(&b"bytes=0-9"[..]));
        assert_eq!(header.unknown("x-custom", buf), Some(&b"yes"[..]));
        assert_eq!(header.known(Known::Referer, buf), None);
        assert_eq!(header.length(), buf.len() - 4);
    }

    #[test]
    fn missing_version_is_http09() {
        let buf = b"GET /index.html\n\n";
        let mut header = Header::new();
        header.parse(buf).unwrap();
        assert_eq!(header.version(), Version::Http09);
        assert_eq!(header.request(buf), b"/index.html");
    }

    #[test_case(b"BREW /pot HTTP/1.1\r\n\r\n", Status::NotImplemented ; "unknown method")]
    #[test_case(b"GET \r\n\r\n", Status::BadRequest ; "missing uri")]
    #[test_case(b"GET / HTTP/2.0\r\n\r\n", Status::VersionNotSupported ; "bad version")]
    #[test_case(b"GET / FTP\r\n\r\n", Status::BadRequest ; "garbage version")]
    #[test_case(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n", Status::BadRequest ; "field without colon")]
    #[test_case(b"GET / HTTP/1.1\r\n", Status::BadRequest ; "unterminated")]
    fn parse_errors(buf: &[u8], status: Status) {
        assert_eq!(Header::new().parse(buf), Err(status));
    }

    #[test]
    fn first_known_field_wins() {
        let buf = b"GET / HTTP/1.1\r\nHost: one\r\nHost: two\r\n\r\n";
        let mut header = Header::new();
        header.parse(buf).unwrap();
        assert_eq!(header.known(Known::Host, buf), Some(&b"one"[..]));
    }

    #[test]
    fn incremental_and_one_shot_agree() {
        let full = b"POST /form?a=b HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\nUser-Agent: t\r\n\r\nabc";
        let mut one_shot = Header::new();
        one_shot.parse(full).unwrap();

        for split in 1..full.len() {
            let mut acc = Vec::new();
            let mut header = Header::new();
            for chunk in full.chunks(split) {
                acc.extend_from_slice(chunk);
                if find_end(&acc).is_some() {
                    break;
                }
            }
            header.parse(&acc).unwrap();
            assert_eq!(header.method(), one_shot.method());
            assert_eq!(header.request(&acc), one_shot.request(full));
            assert_eq!(header.query_string(&acc), one_shot.query_string(full));
            assert_eq!(header.length(), one_shot.length());
            assert_eq!(
                header.known(Known::UserAgent, &acc),
                one_shot.known(Known::UserAgent, full)
            );
        }
    }
}
