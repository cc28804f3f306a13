use std::fmt;
use std::ops::Deref;

/// Growable byte string used for every wire-facing buffer of a connection.
///
/// `clear` keeps the allocation so that a connection reused for keep-alive does not reallocate
/// its buffers on every request; `mrproper` releases it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(size),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Content as UTF-8, lossily.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }

    /// Empty the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Empty the buffer and release its allocation.
    pub fn mrproper(&mut self) {
        self.buf = Vec::new();
    }

    pub fn add(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn add_str(&mut self, s: &str) {
        self.add(s.as_bytes());
    }

    pub fn add_char(&mut self, c: u8) {
        self.buf.push(c);
    }

    pub fn add_buffer(&mut self, other: &Buffer) {
        self.add(&other.buf);
    }

    /// Make sure at least `size` bytes can be held without reallocating.
    pub fn ensure_size(&mut self, size: usize) {
        if size > self.buf.capacity() {
            self.buf.reserve(size - self.buf.len());
        }
    }

    /// Drop the first `n` bytes, shifting the rest to the front.
    pub fn move_to_begin(&mut self, n: usize) {
        if n >= self.buf.len() {
            self.buf.clear();
        } else if n > 0 {
            self.buf.drain(..n);
        }
    }

    /// Drop the last `n` bytes.
    pub fn drop_ending(&mut self, n: usize) {
        let len = self.buf.len().saturating_sub(n);
        self.buf.truncate(len);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn end_char(&self) -> Option<u8> {
        self.buf.last().copied()
    }

    /// Number of consecutive bytes starting at `offset` that are all members of `set`.
    pub fn cnt_spn(&self, offset: usize, set: &[u8]) -> usize {
        self.buf
            .get(offset..)
            .map(|tail| tail.iter().take_while(|b| set.contains(b)).count())
            .unwrap_or(0)
    }

    /// Collapse runs of `c` into a single occurrence.
    pub fn remove_dups(&mut self, c: u8) {
        self.buf.dedup_by(|a, b| *a == c && *b == c);
    }

    /// Let `fill` write up to `max` bytes at the end of the buffer. `fill` returns how many bytes
    /// it wrote; the buffer grows by exactly that much.
    pub fn append_from<F>(&mut self, max: usize, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let len = self.buf.len();
        self.buf.resize(len + max, 0);
        let n = fill(&mut self.buf[len..]).min(max);
        self.buf.truncate(len + n);
        n
    }

    /// Remove `start..end` from the middle of the buffer.
    pub fn remove_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.buf.len());
        if start < end {
            self.buf.drain(start..end);
        }
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(&mut self.buf, &mut other.buf);
    }

    pub fn replace(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self { buf: data.to_vec() }
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.add_str(s);
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({:?})", self.to_string_lossy())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn move_to_begin_keeps_tail() {
        let mut buf = Buffer::from("GET / HTTP/1.1\r\n\r\nGET /next");
        buf.move_to_begin(18);
        assert_eq!(buf.as_bytes(), b"GET /next");
        buf.move_to_begin(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn cnt_spn_counts_from_offset() {
        let buf = Buffer::from("abc\r\n\r\nx");
        assert_eq!(buf.cnt_spn(3, b"\r\n"), 4);
        assert_eq!(buf.cnt_spn(0, b"\r\n"), 0);
        assert_eq!(buf.cnt_spn(42, b"\r\n"), 0);
    }

    #[test]
    fn remove_dups_collapses_slashes() {
        let mut buf = Buffer::from("//a///b/c//");
        buf.remove_dups(b'/');
        assert_eq!(buf.as_bytes(), b"/a/b/c/");
    }

    #[test]
    fn append_from_grows_by_written() {
        let mut buf = Buffer::from("ab");
        let n = buf.append_from(16, |space| {
            space[..3].copy_from_slice(b"cde");
            3
        });
        assert_eq!(n, 3);
        assert_eq!(buf.as_bytes(), b"abcde");
        assert_eq!(buf.append_from(16, |_| 0), 0);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn remove_range_keeps_both_ends() {
        let mut buf = Buffer::from("HEADbodyNEXT");
        buf.remove_range(4, 8);
        assert_eq!(buf.as_bytes(), b"HEADNEXT");
        buf.remove_range(4, 100);
        assert_eq!(buf.as_bytes(), b"HEAD");
        buf.remove_range(3, 3);
        assert_eq!(buf.as_bytes(), b"HEAD");
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = Buffer::with_capacity(1024);
        buf.add_str("hello");
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
        buf.mrproper();
        assert_eq!(buf.capacity(), 0);
    }
}
