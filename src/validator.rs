//! Credential validators for Basic and Digest authentication.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::http::{AuthType, Method};
use crate::md5::md5_hex;
use crate::util::base64_decode;

/// What the client sent in its Authorization header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    /// Basic only.
    pub passwd: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub qop: String,
    pub nc: String,
    pub cnonce: String,
    pub response: String,
    pub algorithm: String,
    pub opaque: String,
}

impl Credentials {
    /// Parse the payload of `Authorization: Basic`, a base64 encoded `user:password`.
    pub fn parse_basic(&mut self, payload: &[u8]) -> bool {
        let decoded = match base64_decode(trim(payload)) {
            Some(decoded) => decoded,
            None => return false,
        };
        let colon = match decoded.iter().position(|&b| b == b':') {
            Some(colon) => colon,
            None => return false,
        };
        self.user = String::from_utf8_lossy(&decoded[..colon]).into_owned();
        self.passwd = String::from_utf8_lossy(&decoded[colon + 1..]).into_owned();
        !self.user.is_empty()
    }

    /// Parse the comma separated `key=value` / `key="value"` list of `Authorization: Digest`.
    pub fn parse_digest(&mut self, payload: &[u8]) -> bool {
        let mut rest = payload;
        loop {
            rest = skip_separators(rest);
            if rest.is_empty() {
                break;
            }
            let eq = match rest.iter().position(|&b| b == b'=') {
                Some(eq) => eq,
                None => return false,
            };
            let key = trim(&rest[..eq]);
            rest = &rest[eq + 1..];

            let value;
            if rest.first() == Some(&b'"') {
                let close = match rest[1..].iter().position(|&b| b == b'"') {
                    Some(close) => close + 1,
                    None => return false,
                };
                value = &rest[1..close];
                rest = &rest[close + 1..];
            } else {
                let end = rest.iter().position(|&b| b == b',').unwrap_or(rest.len());
                value = trim(&rest[..end]);
                rest = &rest[end..];
            }

            let value = String::from_utf8_lossy(value).into_owned();
            match key.to_ascii_lowercase().as_slice() {
                b"username" => self.user = value,
                b"realm" => self.realm = value,
                b"nonce" => self.nonce = value,
                b"uri" => self.uri = value,
                b"qop" => self.qop = value,
                b"nc" => self.nc = value,
                b"cnonce" => self.cnonce = value,
                b"response" => self.response = value,
                b"algorithm" => self.algorithm = value,
                b"opaque" => self.opaque = value,
                _ => {}
            }
        }
        !self.user.is_empty()
    }
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

fn skip_separators(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t' | b',', rest @ ..] = s {
        s = rest;
    }
    s
}

/// Checks the credentials of one authentication attempt.
pub trait Validator: Send {
    /// Schemes this validator can check.
    fn support(&self) -> AuthType;

    fn credentials(&self) -> &Credentials;

    fn credentials_mut(&mut self) -> &mut Credentials;

    fn parse_basic(&mut self, payload: &[u8]) -> bool {
        self.credentials_mut().parse_basic(payload)
    }

    fn parse_digest(&mut self, payload: &[u8]) -> bool {
        self.credentials_mut().parse_digest(payload)
    }

    /// Verify the parsed credentials for the request on `conn`.
    fn check(&mut self, conn: &Connection) -> bool;
}

/// Creates a validator for each authentication attempt.
pub trait ValidatorFactory: Send + Sync {
    fn new_validator(&self) -> Option<Box<dyn Validator>>;
}

/// Users and their plain text passwords.
#[derive(Clone, Debug, Default)]
pub struct PlainUsers {
    users: Arc<HashMap<String, String>>,
    support: AuthType,
}

impl PlainUsers {
    pub fn new(support: AuthType) -> Self {
        Self {
            users: Arc::new(HashMap::new()),
            support,
        }
    }

    pub fn add(&mut self, user: &str, passwd: &str) {
        Arc::make_mut(&mut self.users).insert(user.to_string(), passwd.to_string());
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl ValidatorFactory for PlainUsers {
    fn new_validator(&self) -> Option<Box<dyn Validator>> {
        Some(Box::new(PlainValidator {
            users: Arc::clone(&self.users),
            support: self.support,
            credentials: Credentials::default(),
        }))
    }
}

#[derive(Debug)]
pub struct PlainValidator {
    users: Arc<HashMap<String, String>>,
    support: AuthType,
    credentials: Credentials,
}

impl PlainValidator {
    fn check_digest(&self, passwd: &str, method: Method, realm: &str) -> bool {
        let c = &self.credentials;
        let ha1 = md5_hex(&[c.user.as_bytes(), b":", realm.as_bytes(), b":", passwd.as_bytes()]);
        let ha2 = md5_hex(&[method.as_str().as_bytes(), b":", c.uri.as_bytes()]);
        let expected = if c.qop.is_empty() {
            md5_hex(&[ha1.as_bytes(), b":", c.nonce.as_bytes(), b":", ha2.as_bytes()])
        } else {
            md5_hex(&[
                ha1.as_bytes(),
                b":",
                c.nonce.as_bytes(),
                b":",
                c.nc.as_bytes(),
                b":",
                c.cnonce.as_bytes(),
                b":",
                c.qop.as_bytes(),
                b":",
                ha2.as_bytes(),
            ])
        };
        expected.eq_ignore_ascii_case(&c.response)
    }
}

impl Validator for PlainValidator {
    fn support(&self) -> AuthType {
        self.support
    }

    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn credentials_mut(&mut self) -> &mut Credentials {
        &mut self.credentials
    }

    fn check(&mut self, conn: &Connection) -> bool {
        let passwd = match self.users.get(&self.credentials.user) {
            Some(passwd) => passwd,
            None => return false,
        };
        if conn.req_auth_type == AuthType::BASIC {
            return *passwd == self.credentials.passwd;
        }
        if conn.req_auth_type == AuthType::DIGEST {
            let method = match conn.header.method() {
                Some(method) => method,
                None => return false,
            };
            let realm = conn.realm.as_deref().unwrap_or("");
            return self.check_digest(passwd, method, realm);
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_basic() {
        let mut credentials = Credentials::default();
        // "aladdin:open sesame"
        assert!(credentials.parse_basic(b"YWxhZGRpbjpvcGVuIHNlc2FtZQ=="));
        assert_eq!(credentials.user, "aladdin");
        assert_eq!(credentials.passwd, "open sesame");

        assert!(!Credentials::default().parse_basic(b"bm9jb2xvbg==")); // "nocolon"
        assert!(!Credentials::default().parse_basic(b"!!!"));
    }

    #[test]
    fn parses_digest() {
        let mut credentials = Credentials::default();
        assert!(credentials.parse_digest(
            b"username=\"Mufasa\", realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
              uri=\"/dir/index.html\", qop=auth, nc=00000001, cnonce=\"0a4f113b\", \
              response=\"6629fae49393a05397450978507c4ef1\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""
        ));
        assert_eq!(credentials.user, "Mufasa");
        assert_eq!(credentials.realm, "testrealm@host.com");
        assert_eq!(credentials.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(credentials.uri, "/dir/index.html");
        assert_eq!(credentials.qop, "auth");
        assert_eq!(credentials.nc, "00000001");
        assert_eq!(credentials.cnonce, "0a4f113b");
        assert_eq!(credentials.response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_rejects_garbage() {
        assert!(!Credentials::default().parse_digest(b"username"));
        assert!(!Credentials::default().parse_digest(b"username=\"unterminated"));
        assert!(!Credentials::default().parse_digest(b"realm=\"x\""));
    }

    #[test]
    fn rfc2617_digest_response() {
        let mut users = PlainUsers::new(AuthType::DIGEST);
        users.add("Mufasa", "Circle Of Life");
        let mut validator = PlainValidator {
            users: Arc::clone(&users.users),
            support: AuthType::DIGEST,
            credentials: Credentials::default(),
        };
        assert!(validator.parse_digest(
            b"username=\"Mufasa\", realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
              uri=\"/dir/index.html\", qop=auth, nc=00000001, cnonce=\"0a4f113b\", \
              response=\"6629fae49393a05397450978507c4ef1\""
        ));
        assert!(validator.check_digest("Circle Of Life", Method::Get, "testrealm@host.com"));
        assert!(!validator.check_digest("wrong", Method::Get, "testrealm@host.com"));
        assert!(!validator.check_digest("Circle Of Life", Method::Post, "testrealm@host.com"));
    }
}
