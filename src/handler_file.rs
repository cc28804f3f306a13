//! Static file handler.

use std::fmt::Write;
use std::fs::{File, Metadata};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::buffer::Buffer;
use crate::connection::{Connection, Mmaped, Resolution, Ret};
use crate::handler::{Handler, HandlerFactory, Step, Support};
use crate::header::Known;
use crate::http::{Method, Status};
use crate::server::Server;
use crate::util::HttpDate;

const READ_SIZE: usize = 8192;

/// Serves files below the connection's local directory.
#[derive(Debug, Default)]
pub struct FileFactory {
    /// Treat whatever follows an existing file in the request as path info.
    pub allow_pathinfo: bool,
}

fn stat(srv: &Server, path: &Path) -> std::io::Result<Metadata> {
    match &srv.iocache {
        Some(cache) => cache.stat(path, SystemTime::now()),
        None => std::fs::metadata(path),
    }
}

fn local_path(conn: &Connection, request: &[u8]) -> PathBuf {
    let mut path = conn.local_directory.as_bytes().to_vec();
    path.extend_from_slice(request);
    PathBuf::from(std::ffi::OsStr::from_bytes(&path))
}

fn status_for(e: &std::io::Error) -> Status {
    match e.kind() {
        ErrorKind::PermissionDenied => Status::Forbidden,
        ErrorKind::NotFound => Status::NotFound,
        _ if e.raw_os_error() == Some(libc::ENOTDIR) => Status::NotFound,
        _ => Status::InternalError,
    }
}

impl FileFactory {
    /// Find the longest request prefix naming a regular file and move the rest to `pathinfo`.
    fn split_pathinfo(&self, conn: &mut Connection, srv: &Server) -> bool {
        let slashes: Vec<usize> = conn
            .request
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &b)| b == b'/')
            .map(|(i, _)| i)
            .collect();
        for &end in slashes.iter().rev() {
            let path = local_path(conn, &conn.request[..end]);
            if matches!(stat(srv, &path), Ok(metadata) if metadata.is_file()) {
                conn.pathinfo.replace(&conn.request[end..]);
                conn.save_original_request();
                conn.request.truncate(end);
                return true;
            }
        }
        false
    }

    fn directory(&self, conn: &mut Connection, srv: &Server, path: &Path) -> Resolution<Box<dyn Handler>> {
        if conn.request.end_char() != Some(b'/') {
            if conn.request_original.is_empty() {
                conn.redirect.add_buffer(&conn.request);
            } else {
                conn.redirect.add_buffer(&conn.request_original);
            }
            conn.redirect.add_char(b'/');
            return Resolution::Failed(Status::MovedPermanently);
        }

        let vserver = srv.vserver(conn.vserver);
        for index in &vserver.index_list {
            // A leading slash names an index below the virtual server root.
            if let Some(top) = index.strip_prefix('/') {
                if !matches!(stat(srv, &vserver.root.join(top)), Ok(metadata) if metadata.is_file()) {
                    continue;
                }
                let directory = local_path(conn, &conn.request);
                conn.effective_directory.replace(directory.as_os_str().as_bytes());
                conn.save_original_request();
                conn.request.replace(index.as_bytes());
                tracing::trace!("top-level index {}", index);
                return Resolution::Restart;
            }

            if matches!(stat(srv, &path.join(index)), Ok(metadata) if metadata.is_file()) {
                conn.save_original_request();
                conn.request.add_str(index);
                tracing::trace!("directory index {}", index);
                return Resolution::Restart;
            }
        }
        Resolution::Failed(Status::Forbidden)
    }
}

impl HandlerFactory for FileFactory {
    fn new_handler(&self, conn: &mut Connection, srv: &Server) -> Resolution<Box<dyn Handler>> {
        let path = local_path(conn, &conn.request);
        match stat(srv, &path) {
            Ok(metadata) if metadata.is_file() => Resolution::Continue(Box::new(FileHandler::new(path))),
            Ok(metadata) if metadata.is_dir() => self.directory(conn, srv, &path),
            Ok(_) => Resolution::Failed(Status::Forbidden),
            Err(e) => {
                if self.allow_pathinfo && conn.pathinfo.is_empty() && self.split_pathinfo(conn, srv) {
                    return Resolution::Restart;
                }
                tracing::trace!("stat {} failed: {}", path.display(), e);
                Resolution::Failed(status_for(&e))
            }
        }
    }
}

/// Sends one regular file, or a byte range of it.
#[derive(Debug)]
pub struct FileHandler {
    path: PathBuf,
    file: Option<File>,
    content_type: String,
    modified: Option<SystemTime>,
    size: u64,
    start: u64,
    offset: u64,
    /// Exclusive.
    end: u64,
    partial: bool,
    encoded: bool,
    head: bool,
}

impl FileHandler {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            content_type: String::new(),
            modified: None,
            size: 0,
            start: 0,
            offset: 0,
            end: 0,
            partial: false,
            encoded: false,
            head: false,
        }
    }

    fn fail(conn: &mut Connection, status: Status) -> Ret {
        conn.error_code = status;
        Ret::Error
    }

    fn not_modified(&self, conn: &Connection) -> bool {
        let since = match conn.header.known(Known::IfModifiedSince, &conn.incoming_header) {
            Some(since) => since,
            None => return false,
        };
        match self.modified {
            Some(modified) => HttpDate(modified).to_string().as_bytes() == since,
            None => false,
        }
    }
}

impl Handler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    fn support(&self) -> Support {
        Support::LENGTH | Support::RANGE
    }

    fn init(&mut self, conn: &mut Connection, srv: &Server) -> Ret {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("open {} failed: {}", self.path.display(), e);
                return Self::fail(conn, status_for(&e));
            }
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!("fstat {} failed: {}", self.path.display(), e);
                return Self::fail(conn, Status::InternalError);
            }
        };

        self.size = metadata.len();
        self.modified = metadata.modified().ok();
        self.content_type = srv.mime.content_type(&conn.request).to_string();
        self.head = conn.header.method() == Some(Method::Head);
        self.encoded = conn.encoder.is_some();

        if self.not_modified(conn) {
            return Self::fail(conn, Status::NotModified);
        }

        self.offset = 0;
        self.end = self.size;
        if self.encoded {
            // The encoded length is unknown; the body is counted as it goes out.
            conn.support.remove(Support::LENGTH);
            conn.range_start = 0;
            conn.range_end = 0;
        } else {
            if conn.range_start != 0 || conn.range_end != 0 {
                if conn.range_start >= self.size {
                    return Self::fail(conn, Status::RangeNotSatisfiable);
                }
                let last = if conn.range_end == 0 {
                    self.size - 1
                } else {
                    conn.range_end.min(self.size - 1)
                };
                self.offset = conn.range_start;
                self.end = last + 1;
                self.partial = true;
                conn.error_code = Status::PartialContent;
            }
            conn.range_start = self.offset;
            conn.range_end = self.end;
        }
        self.start = self.offset;

        if !self.head && !self.encoded && self.end > self.offset {
            if let Some(cache) = &srv.iocache {
                match cache.mmap(&self.path, &file, &metadata) {
                    Ok(entry) => {
                        conn.mmaped = Some(Mmaped {
                            entry,
                            offset: self.offset as usize,
                            len: (self.end - self.offset) as usize,
                        });
                        self.offset = self.end;
                    }
                    Err(e) => tracing::trace!("not mapping {}: {}", self.path.display(), e),
                }
            }
        }
        self.file = Some(file);
        Ret::Ok
    }

    fn add_headers(&mut self, out: &mut Buffer) -> Ret {
        out.add_str("Accept-Ranges: bytes\r\n");
        let _ = write!(out, "Content-Type: {}\r\n", self.content_type);
        if let Some(modified) = self.modified {
            let _ = write!(out, "Last-Modified: {}\r\n", HttpDate(modified));
        }
        if !self.encoded {
            let _ = write!(out, "Content-Length: {}\r\n", self.end - self.start);
            if self.partial {
                let _ = write!(
                    out,
                    "Content-Range: bytes {}-{}/{}\r\n",
                    self.start,
                    self.end - 1,
                    self.size
                );
            }
        }
        Ret::Ok
    }

    fn step(&mut self, out: &mut Buffer) -> Step {
        if self.head || self.offset >= self.end {
            return Step::Eof;
        }
        let file = match &self.file {
            Some(file) => file,
            None => return Step::Error,
        };

        let want = (self.end - self.offset).min(READ_SIZE as u64) as usize;
        let offset = self.offset;
        let mut result = Ok(0);
        out.append_from(want, |space| {
            result = file.read_at(space, offset);
            *result.as_ref().unwrap_or(&0)
        });
        match result {
            Ok(0) => Step::Eof,
            Ok(n) => {
                self.offset += n as u64;
                if self.offset >= self.end {
                    Step::EofHaveData
                } else {
                    Step::Ok
                }
            }
            Err(e) => {
                tracing::debug!("read {} failed: {}", self.path.display(), e);
                Step::Error
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::transport::MockTransport;

    fn setup() -> (tempfile::TempDir, Server) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("sub/index.html"), "<p>index</p>").unwrap();
        (dir, Server::for_tests())
    }

    fn request(srv: &Server, root: &Path, raw: &str) -> Connection {
        let mut conn = Connection::new(Box::new(MockTransport::new()), srv);
        conn.incoming_header.add_str(raw);
        assert_eq!(conn.get_request(srv), Ret::Ok);
        conn.local_directory.add(root.as_os_str().as_bytes());
        conn
    }

    fn handler_for(factory: &FileFactory, conn: &mut Connection, srv: &Server) -> Box<dyn Handler> {
        match factory.new_handler(conn, srv) {
            Resolution::Continue(handler) => {
                conn.support = handler.support();
                handler
            }
            Resolution::Restart => panic!("unexpected restart"),
            Resolution::Failed(status) => panic!("unexpected {}", status),
        }
    }

    fn failure(factory: &FileFactory, conn: &mut Connection, srv: &Server) -> Option<Status> {
        match factory.new_handler(conn, srv) {
            Resolution::Failed(status) => Some(status),
            _ => None,
        }
    }

    #[test]
    fn reads_file_without_cache() {
        let (dir, mut srv) = setup();
        srv.iocache = None;
        let mut conn = request(&srv, dir.path(), "GET /a.txt HTTP/1.0\r\n\r\n");
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);
        assert!(conn.mmaped.is_none());
        assert_eq!((conn.range_start, conn.range_end), (0, 11));

        let mut headers = Buffer::new();
        handler.add_headers(&mut headers);
        let headers = headers.to_string_lossy().into_owned();
        assert!(headers.contains("Content-Length: 11\r\n"), "{}", headers);
        assert!(headers.contains("Content-Type: text/plain\r\n"), "{}", headers);
        assert!(headers.contains("Last-Modified: "), "{}", headers);

        let mut body = Buffer::new();
        assert_eq!(handler.step(&mut body), Step::EofHaveData);
        assert_eq!(body.as_bytes(), b"hello world");
        assert_eq!(handler.step(&mut body), Step::Eof);
    }

    #[test]
    fn maps_file_through_cache() {
        let (dir, srv) = setup();
        let mut conn = request(&srv, dir.path(), "GET /a.txt HTTP/1.0\r\n\r\n");
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);
        let mmaped = conn.mmaped.expect("mapped");
        assert_eq!((mmaped.offset, mmaped.len), (0, 11));
        let region = srv.iocache.as_ref().unwrap().region(mmaped.entry).unwrap();
        assert_eq!(region.as_bytes(), b"hello world");
        let mut body = Buffer::new();
        assert_eq!(handler.step(&mut body), Step::Eof);
    }

    #[test]
    fn serves_ranges() {
        let (dir, mut srv) = setup();
        srv.iocache = None;
        let mut conn = request(&srv, dir.path(), "GET /a.txt HTTP/1.0\r\n\r\n");
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        conn.range_start = 2;
        conn.range_end = 4;
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);
        assert_eq!(conn.error_code, Status::PartialContent);
        assert_eq!((conn.range_start, conn.range_end), (2, 5));

        let mut headers = Buffer::new();
        handler.add_headers(&mut headers);
        let headers = headers.to_string_lossy().into_owned();
        assert!(headers.contains("Content-Length: 3\r\n"), "{}", headers);
        assert!(headers.contains("Content-Range: bytes 2-4/11\r\n"), "{}", headers);

        let mut body = Buffer::new();
        assert_eq!(handler.step(&mut body), Step::EofHaveData);
        assert_eq!(body.as_bytes(), b"llo");
    }

    #[test]
    fn range_past_the_end_is_unsatisfiable() {
        let (dir, srv) = setup();
        let mut conn = request(&srv, dir.path(), "GET /a.txt HTTP/1.0\r\n\r\n");
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        conn.range_start = 11;
        assert_eq!(handler.init(&mut conn, &srv), Ret::Error);
        assert_eq!(conn.error_code, Status::RangeNotSatisfiable);
    }

    #[test]
    fn head_sends_no_body() {
        let (dir, srv) = setup();
        let mut conn = request(&srv, dir.path(), "HEAD /a.txt HTTP/1.0\r\n\r\n");
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Ok);
        assert!(conn.mmaped.is_none());
        let mut body = Buffer::new();
        assert_eq!(handler.step(&mut body), Step::Eof);
        assert!(body.is_empty());
    }

    #[test]
    fn unchanged_file_is_not_modified() {
        let (dir, srv) = setup();
        let modified = std::fs::metadata(dir.path().join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();
        let raw = format!(
            "GET /a.txt HTTP/1.0\r\nIf-Modified-Since: {}\r\n\r\n",
            HttpDate(modified)
        );
        let mut conn = request(&srv, dir.path(), &raw);
        let mut handler = handler_for(&FileFactory::default(), &mut conn, &srv);
        assert_eq!(handler.init(&mut conn, &srv), Ret::Error);
        assert_eq!(conn.error_code, Status::NotModified);
    }

    #[test]
    fn directories_redirect_or_restart_on_index() {
        let (dir, srv) = setup();
        let factory = FileFactory::default();

        let mut conn = request(&srv, dir.path(), "GET /sub HTTP/1.0\r\n\r\n");
        assert_eq!(failure(&factory, &mut conn, &srv), Some(Status::MovedPermanently));
        assert_eq!(conn.redirect.as_bytes(), b"/sub/");

        let mut conn = request(&srv, dir.path(), "GET /sub/ HTTP/1.0\r\n\r\n");
        assert!(matches!(factory.new_handler(&mut conn, &srv), Resolution::Restart));
        assert_eq!(conn.request.as_bytes(), b"/sub/index.html");
        assert_eq!(conn.request_original.as_bytes(), b"/sub/");

        let mut conn = request(&srv, dir.path(), "GET /empty/ HTTP/1.0\r\n\r\n");
        assert_eq!(failure(&factory, &mut conn, &srv), Some(Status::Forbidden));
    }

    #[test]
    fn missing_files_are_not_found() {
        let (dir, srv) = setup();
        let mut conn = request(&srv, dir.path(), "GET /nope.txt HTTP/1.0\r\n\r\n");
        assert_eq!(
            failure(&FileFactory::default(), &mut conn, &srv),
            Some(Status::NotFound)
        );
    }

    #[test]
    fn path_info_is_split_off() {
        let (dir, srv) = setup();
        let factory = FileFactory {
            allow_pathinfo: true,
        };
        let mut conn = request(&srv, dir.path(), "GET /a.txt/extra/bits HTTP/1.0\r\n\r\n");
        assert!(matches!(factory.new_handler(&mut conn, &srv), Resolution::Restart));
        assert_eq!(conn.request.as_bytes(), b"/a.txt");
        assert_eq!(conn.pathinfo.as_bytes(), b"/extra/bits");

        let mut conn = request(&srv, dir.path(), "GET /a.txt/extra HTTP/1.0\r\n\r\n");
        assert_eq!(
            failure(&FileFactory::default(), &mut conn, &srv),
            Some(Status::NotFound)
        );
    }
}
