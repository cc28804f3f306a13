use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Request methods understood by the header parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

impl Method {
    const ALL: &'static [(Method, &'static str)] = &[
        (Method::Get, "GET"),
        (Method::Head, "HEAD"),
        (Method::Post, "POST"),
        (Method::Put, "PUT"),
        (Method::Delete, "DELETE"),
        (Method::Options, "OPTIONS"),
        (Method::Trace, "TRACE"),
        (Method::Connect, "CONNECT"),
    ];

    pub fn from_bytes(name: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_, s)| s.as_bytes() == name)
            .map(|(method, _)| *method)
    }

    pub fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(method, _)| *method == self)
            .map(|(_, s)| *s)
            .unwrap_or("GET")
    }

    /// Methods whose requests carry a body delimited by Content-Length.
    pub fn has_input(self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of methods a configuration entry accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodSet(u16);

impl MethodSet {
    pub const NONE: MethodSet = MethodSet(0);
    pub const ALL: MethodSet = MethodSet(u16::MAX);

    pub fn common() -> Self {
        Self::of(&[Method::Get, Method::Head, Method::Post, Method::Options])
    }

    pub fn of(methods: &[Method]) -> Self {
        MethodSet(methods.iter().fold(0, |acc, m| acc | m.bit()))
    }

    pub fn contains(self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }
}

impl Default for MethodSet {
    fn default() -> Self {
        Self::common()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

impl Version {
    pub fn status_prefix(self) -> &'static str {
        match self {
            Version::Http09 | Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Response status codes the server emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    SwitchingProtocols,
    Ok,
    PartialContent,
    MovedPermanently,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    LengthRequired,
    RequestEntityTooLarge,
    RequestUriTooLong,
    RangeNotSatisfiable,
    UpgradeRequired,
    InternalError,
    NotImplemented,
    VersionNotSupported,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::SwitchingProtocols => 101,
            Status::Ok => 200,
            Status::PartialContent => 206,
            Status::MovedPermanently => 301,
            Status::NotModified => 304,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::LengthRequired => 411,
            Status::RequestEntityTooLarge => 413,
            Status::RequestUriTooLong => 414,
            Status::RangeNotSatisfiable => 416,
            Status::UpgradeRequired => 426,
            Status::InternalError => 500,
            Status::NotImplemented => 501,
            Status::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::SwitchingProtocols => "Switching Protocols",
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::MovedPermanently => "Moved Permanently",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::LengthRequired => "Length Required",
            Status::RequestEntityTooLarge => "Request Entity Too Large",
            Status::RequestUriTooLong => "Request-URI Too Long",
            Status::RangeNotSatisfiable => "Requested Range Not Satisfiable",
            Status::UpgradeRequired => "Upgrade Required",
            Status::InternalError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::VersionNotSupported => "HTTP Version Not Supported",
        }
    }

    /// 4xx or 5xx.
    pub fn is_error(self) -> bool {
        self.code() >= 400
    }

    /// Responses that must not carry a message body.
    pub fn forbids_body(self) -> bool {
        let code = self.code();
        code < 200 || code == 204 || code == 304
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Authentication schemes, as a bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthType(u8);

impl AuthType {
    pub const NONE: AuthType = AuthType(0);
    pub const BASIC: AuthType = AuthType(1);
    pub const DIGEST: AuthType = AuthType(2);

    pub fn contains(self, other: AuthType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: AuthType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AuthType {
    type Output = AuthType;

    fn bitor(self, rhs: AuthType) -> AuthType {
        AuthType(self.0 | rhs.0)
    }
}

impl BitOrAssign for AuthType {
    fn bitor_assign(&mut self, rhs: AuthType) {
        self.0 |= rhs.0;
    }
}

/// Protocol upgrade state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upgrade {
    Nothing,
    Tls10,
}

impl Default for Upgrade {
    fn default() -> Self {
        Upgrade::Nothing
    }
}
