use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(std::array::IntoIter::new([$(($k, $v),)*]))
    };
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// A corehttpd process serving a fresh temporary directory.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn new() -> Self {
        Self::with_args(&[])
    }

    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        Self::with_root(root, args)
    }

    /// Serve `root`, which the caller may have populated already (for files named by `args`).
    pub fn with_root(root: TempDir, args: &[&str]) -> Self {
        // Get an unused port. Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_corehttpd"))
            .args(&[
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn corehttpd");
        let child = ScopedChild(child);

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to corehttpd");

        Self {
            _child: child,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, content: &str) {
        let mut file = File::create(self.root().join(name)).expect("failed to create file");
        file.write_all(content.as_bytes())
            .expect("failed to write file");
    }

    pub fn stream(&self) -> TcpStream {
        let stream = TcpStream::connect(("localhost", self.port))
            .expect("failed to connect to corehttpd");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut stream = self.stream();
        write_request(&mut stream, path, &headers);
        Response::from_reader(&mut stream).expect("failed to read response")
    }
}

pub fn write_request(stream: &mut TcpStream, path: &str, headers: &HashMap<&str, &str>) {
    write!(stream, "GET {} HTTP/1.1\r\n", path).unwrap();
    if !headers.contains_key("Host") {
        write!(stream, "Host: localhost\r\n").unwrap();
    }
    for (header_name, header_value) in headers {
        write!(stream, "{}: {}\r\n", header_name, header_value).unwrap();
    }
    write!(stream, "\r\n").unwrap();
}

/// HTTP response from corehttpd.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Read one response. The body is read by Content-Length, or to the end of the stream.
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = match headers.get("Content-Length") {
            Some(length) => {
                let length = length.parse::<usize>().expect("invalid content length");
                Self::read_body(reader, length)?
            }
            None => {
                let mut body = Vec::new();
                reader.read_to_end(&mut body)?;
                body
            }
        };
        Ok(Self {
            response_line,
            headers,
            body: Some(body),
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
