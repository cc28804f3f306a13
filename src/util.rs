use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Resolve //, /./, and /../ in a URL path.
///
/// Returns None if the path doesn't start with a slash or climbs above the root.
pub fn make_safe_url(url: &[u8]) -> Option<Vec<u8>> {
    let mut url = url.to_vec();

    // URLs not starting with a slash are illegal.
    if !url.starts_with(b"/") {
        return None;
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < url.len() {
        if url[src_index] == b'/' && url.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && matches!(url.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && url.get(src_index + 2) == Some(&b'.')
            && matches!(url.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return None;
                }
                dst_index -= 1;
                if url[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            url[dst_index] = url[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve leading slash
    dst_index = dst_index.max(1);
    url.truncate(dst_index);
    Some(url)
}

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the byte it represents.
pub fn url_decode(url: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode bytes for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a [u8]);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if !b.is_ascii() || b.is_ascii_control() || b == b'"' {
                write!(f, "%{:02X}", b)?;
            } else {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

/// Lowercase hexadecimal rendering of a byte string.
pub struct Hex<'a>(pub &'a [u8]);

impl<'a> std::fmt::Display for Hex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

const BASE64_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Decode base64 data. Returns None on characters outside the alphabet or a truncated quantum.
pub fn base64_decode(data: &[u8]) -> Option<Vec<u8>> {
    let data = match data.iter().position(|&b| b == b'=') {
        Some(pad) if data[pad..].iter().all(|&b| b == b'=') && data[pad..].len() <= 2 => &data[..pad],
        Some(_) => return None,
        None => data,
    };
    if data.len() % 4 == 1 {
        return None;
    }
    let mut decoded = Vec::with_capacity(data.len() * 3 / 4);
    for chunk in data.chunks(4) {
        let mut quad: u32 = 0;
        for &c in chunk {
            let value = BASE64_TABLE.iter().position(|&t| t == c)? as u32;
            quad = (quad << 6) | value;
        }
        quad <<= 6 * (4 - chunk.len()) as u32;
        let bytes = quad.to_be_bytes();
        decoded.extend_from_slice(&bytes[1..chunk.len()]);
    }
    Some(decoded)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;
    use test_case::test_case;

    #[test_case(b"", "" ; "zero bytes")]
    #[test_case(b"M", "TQ==" ; "one byte")]
    #[test_case(b"Ma", "TWE=" ; "two bytes")]
    #[test_case(b"Man", "TWFu" ; "three bytes")]
    #[test_case(b"hello world", "aGVsbG8gd29ybGQ=" ; "many bytes")]
    fn base_64_decode_works(data: &[u8], encoded: &str) {
        assert_eq!(base64_decode(encoded.as_bytes()).as_deref(), Some(data));
    }

    #[test]
    fn base_64_decode_rejects_garbage() {
        assert_eq!(base64_decode(b"a*b="), None);
        assert_eq!(base64_decode(b"TQ=x"), None);
        assert_eq!(base64_decode(b"T"), None);
    }

    #[test]
    fn url_decode_works() {
        assert_eq!(url_decode(b"escape%28this%29name%09"), b"escape(this)name\t");
        assert_eq!(url_decode(b"edge%"), b"edge%");
        assert_eq!(url_decode(b"edge%2"), b"edge%2");
        assert_eq!(url_decode(b"edge%20"), b"edge ");
        assert_eq!(url_decode(b"%F0%9F%A6%80"), "\u{1F980}".as_bytes());
    }

    #[test]
    fn html_escaped_works() {
        assert_eq!(
            HtmlEscaped("foo<>&'\"").to_string(),
            "foo&lt;&gt;&amp;&apos;&quot;"
        );
    }

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("some\"log\tcrab\u{1F980}".as_bytes()).to_string(),
            "some%22log%09crab%F0%9F%A6%80"
        );
    }

    #[test]
    fn clf_date_works() {
        // contains system's local timezone
        assert!(
            ClfDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1620965123))
                .to_string()
                .contains("May/2021")
        );
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1622040683)).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn make_safe_url_works() {
        let test_cases = &[
            ("", None),
            ("/", Some("/")),
            ("/.", Some("/")),
            ("/./", Some("/")),
            ("/.d", Some("/.d")),
            ("//.d", Some("/.d")),
            ("/../", None),
            ("/abc", Some("/abc")),
            ("/abc/", Some("/abc/")),
            ("/abc/.", Some("/abc")),
            ("/abc/./", Some("/abc/")),
            ("/abc/..", Some("/")),
            ("/abc/../", Some("/")),
            ("/abc/../def", Some("/def")),
            ("/abc/../def/", Some("/def/")),
            ("/abc/../def/..", Some("/")),
            ("/abc/../def/../", Some("/")),
            ("/abc/../def/../../", None),
            ("/abc/../def/.././", Some("/")),
            ("/a/b/c/../../d/", Some("/a/d/")),
            ("/a/b/../../../c", None),
            ("//a///b////c/////", Some("/a/b/c/")),
        ];
        for (url, expected) in test_cases {
            assert_eq!(
                make_safe_url(url.as_bytes()),
                expected.map(|s| s.as_bytes().to_vec())
            );
        }
    }
}
