//! Content encoders and the registry used for Accept-Encoding negotiation.

use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::buffer::Buffer;
use crate::connection::Connection;

/// Transforms handler output on its way to the client.
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, _conn: &Connection) -> std::io::Result<()> {
        Ok(())
    }

    /// Append header lines announcing the encoding.
    fn add_headers(&self, out: &mut Buffer);

    /// Encode `input`, appending whatever output is ready to `out`.
    fn encode(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()>;

    /// Encode the last piece of input and append everything still pending.
    fn flush(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()>;
}

/// Move the bytes an encoder produced so far into `out`.
fn drain_into(produced: &mut Vec<u8>, out: &mut Buffer) {
    out.add(produced);
    produced.clear();
}

/// zlib-wrapped deflate stream (`Content-Encoding: deflate`).
pub struct DeflateEncoder {
    inner: ZlibEncoder<Vec<u8>>,
}

impl DeflateEncoder {
    pub fn new() -> Self {
        Self {
            inner: ZlibEncoder::new(Vec::new(), Compression::fast()),
        }
    }
}

impl Default for DeflateEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for DeflateEncoder {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn add_headers(&self, out: &mut Buffer) {
        out.add_str("Content-Encoding: deflate\r\nVary: Accept-Encoding\r\n");
    }

    fn encode(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()> {
        self.inner.write_all(input)?;
        drain_into(self.inner.get_mut(), out);
        Ok(())
    }

    fn flush(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()> {
        self.inner.write_all(input)?;
        self.inner.try_finish()?;
        drain_into(self.inner.get_mut(), out);
        Ok(())
    }
}

/// Gzip stream (`Content-Encoding: gzip`).
pub struct GzipEncoder {
    inner: GzEncoder<Vec<u8>>,
}

impl GzipEncoder {
    pub fn new() -> Self {
        Self {
            inner: GzEncoder::new(Vec::new(), Compression::fast()),
        }
    }
}

impl Default for GzipEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for GzipEncoder {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn add_headers(&self, out: &mut Buffer) {
        out.add_str("Content-Encoding: gzip\r\nVary: Accept-Encoding\r\n");
    }

    fn encode(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()> {
        self.inner.write_all(input)?;
        drain_into(self.inner.get_mut(), out);
        Ok(())
    }

    fn flush(&mut self, input: &[u8], out: &mut Buffer) -> std::io::Result<()> {
        self.inner.write_all(input)?;
        self.inner.try_finish()?;
        drain_into(self.inner.get_mut(), out);
        Ok(())
    }
}

type NewEncoder = fn() -> Box<dyn Encoder>;

struct Registration {
    token: String,
    /// File extensions the encoder applies to; None means any.
    extensions: Option<Vec<String>>,
    new: NewEncoder,
}

/// Encoders known to the server, keyed by Accept-Encoding token.
#[derive(Default)]
pub struct EncoderTable {
    entries: Vec<Registration>,
}

impl EncoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// gzip and deflate for any extension.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register("gzip", None, || Box::new(GzipEncoder::new()));
        table.register("deflate", None, || Box::new(DeflateEncoder::new()));
        table
    }

    pub fn register(&mut self, token: &str, extensions: Option<&[&str]>, new: NewEncoder) {
        self.entries.push(Registration {
            token: token.to_ascii_lowercase(),
            extensions: extensions.map(|exts| exts.iter().map(|ext| ext.to_string()).collect()),
            new,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create the encoder registered for `token`, if it applies to files with `extension`.
    pub fn new_encoder(&self, token: &[u8], extension: &[u8]) -> Option<Box<dyn Encoder>> {
        let token = trim(token);
        self.entries
            .iter()
            .filter(|entry| entry.token.as_bytes().eq_ignore_ascii_case(token))
            .find(|entry| match &entry.extensions {
                Some(exts) => exts.iter().any(|ext| ext.as_bytes() == extension),
                None => true,
            })
            .map(|entry| (entry.new)())
    }
}

impl std::fmt::Debug for EncoderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.token))
            .finish()
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

#[cfg(test)]
mod test {
    use super::*;

    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    fn run(encoder: &mut dyn Encoder, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Buffer::new();
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            encoder.encode(chunk, &mut out).unwrap();
        }
        encoder.flush(last, &mut out).unwrap();
        out.as_bytes().to_vec()
    }

    #[test]
    fn gzip_round_trips() {
        let encoded = run(
            &mut GzipEncoder::new(),
            &[&b"hello "[..], &b"gzip "[..], &b"world"[..]],
        );
        let mut decoded = String::new();
        GzDecoder::new(&encoded[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello gzip world");
    }

    #[test]
    fn deflate_round_trips() {
        let input = b"abc".repeat(1000);
        let encoded = run(&mut DeflateEncoder::new(), &[&input[..], &b""[..]]);
        // zlib header: 32 KiB window, deflate method
        assert_eq!(encoded[0], 0x78);
        let mut decoded = Vec::new();
        ZlibDecoder::new(&encoded[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn lookup_honours_extensions() {
        let mut table = EncoderTable::new();
        table.register("deflate", Some(&["html", "txt"][..]), || Box::new(DeflateEncoder::new()));
        table.register("gzip", Some(&["css"][..]), || Box::new(GzipEncoder::new()));
        assert_eq!(table.new_encoder(b" deflate", b"html").unwrap().name(), "deflate");
        assert!(table.new_encoder(b"gzip", b"html").is_none());
        assert!(table.new_encoder(b"identity", b"html").is_none());
        assert_eq!(table.new_encoder(b"GZIP", b"css").unwrap().name(), "gzip");
    }
}
