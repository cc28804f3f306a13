use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mp4               mp4",
    "video/mpeg              mpeg mpe mpg",
];

/// File extension to content type table.
#[derive(Debug)]
pub struct MimeMap {
    types: HashMap<String, String>,
    pub default_type: String,
}

impl MimeMap {
    /// Add the associations listed in a mime.types style file.
    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            self.add_line(&line);
        }
        Ok(())
    }

    /// `type ext1 ext2 ...`; `#` starts a comment line.
    pub fn add_line(&mut self, line: &str) {
        let mut fields = line.split_whitespace();
        let mime = match fields.next() {
            Some(mime) if !mime.starts_with('#') => mime,
            _ => return,
        };
        for ext in fields {
            self.types.insert(ext.to_ascii_lowercase(), mime.to_string());
        }
    }

    /// Content type for a request path, judged by its extension.
    pub fn content_type(&self, path: &[u8]) -> &str {
        let name = match path.iter().rposition(|&b| b == b'/') {
            Some(slash) => &path[slash + 1..],
            None => path,
        };
        name.iter()
            .rposition(|&b| b == b'.')
            .and_then(|dot| std::str::from_utf8(&name[dot + 1..]).ok())
            .and_then(|ext| self.types.get(&ext.to_ascii_lowercase()))
            .unwrap_or(&self.default_type)
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let mut map = Self {
            types: HashMap::new(),
            default_type: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            map.add_line(line);
        }
        map
    }
}
