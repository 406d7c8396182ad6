// src/buffer.rs
use crate::syscalls;
use log::debug;
use std::io;

const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

/// Elastic byte buffer with explicit read/write cursors.
///
/// Bytes in `[reader_index, writer_index)` are valid unread data; everything
/// else is free space. Freeing the front (`retrieve`) never moves bytes;
/// space is reclaimed by compaction the next time a write needs room.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | retrieved bytes   |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0            reader_index        writer_index         capacity
/// ```
pub struct Buffer {
    store: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            store: vec![0; initial_size],
            reader_index: 0,
            writer_index: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.store.len() - self.writer_index
    }

    /// The unread region. Empty slice when there is nothing buffered.
    pub fn peek(&self) -> &[u8] {
        &self.store[self.reader_index..self.writer_index]
    }

    /// Advance the read cursor by `len`, clamped to what is available.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_bytes(len)
    }

    /// Take the longest prefix that ends on a complete UTF-8 code point.
    ///
    /// A trailing truncated sequence stays buffered until the rest of it
    /// arrives; a buffer of nothing but continuation bytes yields "".
    pub fn retrieve_utf8_string(&mut self) -> String {
        let safe_len = self.utf8_safe_len();
        if safe_len == 0 {
            return String::new();
        }
        let s = String::from_utf8_lossy(&self.peek()[..safe_len]).into_owned();
        self.retrieve(safe_len);
        s
    }

    /// Length of the prefix of the readable region that does not cut a UTF-8
    /// sequence in half. Pure cursor arithmetic, no I/O.
    pub fn utf8_safe_len(&self) -> usize {
        let data = self.peek();
        let len = data.len();
        if len == 0 {
            return 0;
        }

        // Walk backward over continuation bytes (10xxxxxx).
        let mut pos = len;
        while pos > 0 && (data[pos - 1] & 0xC0) == 0x80 {
            pos -= 1;
        }

        // Nothing but continuation bytes: no complete character to take.
        if pos == 0 {
            return 0;
        }

        // data[pos - 1] starts the last (possibly truncated) sequence.
        let lead = data[pos - 1];
        let char_len = if lead & 0x80 == 0x00 {
            1
        } else if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            // Invalid lead byte; treat as a single byte rather than stalling.
            1
        };

        if pos - 1 + char_len <= len { len } else { pos - 1 }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.store[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Fill from a descriptor with one vectored read: the writable tail plus
    /// a large stack scratch, so a single syscall can absorb more than the
    /// buffer's current capacity. Ok(0) means the peer closed.
    pub fn read_fd(&mut self, fd: i32) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let tail = &mut self.store[self.writer_index..];
            syscalls::readv_nonblocking(fd, tail, &mut extra)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.store.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write as much of the readable region as the descriptor accepts and
    /// advance the read cursor by that amount. Callers re-arm for
    /// writability if readable bytes remain.
    pub fn write_fd(&mut self, fd: i32) -> io::Result<usize> {
        let n = syscalls::write_nonblocking(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    /// Make room for `len` more bytes: compact first (shift unread data to
    /// offset 0), reallocate only if compaction is not enough.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }

        if self.reader_index + self.writable_bytes() >= len {
            let readable = self.readable_bytes();
            self.store
                .copy_within(self.reader_index..self.writer_index, 0);
            self.reader_index = 0;
            self.writer_index = readable;
            debug!("Buffer compacted, readable_bytes={}", readable);
        } else {
            let old_size = self.store.len();
            let new_size = (old_size * 2).max(self.writer_index + len);
            self.store.resize(new_size, 0);
            debug!("Buffer resized from {} to {}", old_size, new_size);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        let rest = buf.retrieve_all_as_bytes();
        assert_eq!(rest, b"world");
        assert_eq!(buf.readable_bytes(), 0);
        assert!(buf.peek().is_empty());
    }

    #[test]
    fn test_retrieve_clamps_to_available() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(1000);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_compaction_before_grow() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.retrieve(8);

        // 6 free at the tail + 8 reclaimable at the front: this fits after
        // compaction without reallocating.
        buf.append(b"abcdefghijkl");
        assert_eq!(buf.peek(), b"89abcdefghijkl");
        assert_eq!(buf.writable_bytes() + buf.readable_bytes(), 16);
    }

    #[test]
    fn test_growth_at_least_doubles() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"0123456789abcdef0");
        assert_eq!(buf.readable_bytes(), 17);
        assert_eq!(buf.peek(), b"0123456789abcdef0");
    }

    #[test]
    fn test_utf8_safe_len_complete() {
        let mut buf = Buffer::new();
        buf.append("héllo".as_bytes());
        assert_eq!(buf.utf8_safe_len(), "héllo".len());
        assert_eq!(buf.retrieve_utf8_string(), "héllo");
    }

    #[test]
    fn test_utf8_split_code_point_stays_buffered() {
        // U+4E2D is 3 bytes: E4 B8 AD. Feed the first two only.
        let mut buf = Buffer::new();
        buf.append(&[0xE4, 0xB8]);
        assert_eq!(buf.retrieve_utf8_string(), "");
        assert_eq!(buf.readable_bytes(), 2);

        buf.append(&[0xAD]);
        assert_eq!(buf.retrieve_utf8_string(), "\u{4E2D}");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_utf8_ascii_then_truncated_tail() {
        let mut buf = Buffer::new();
        buf.append(b"ok");
        buf.append(&[0xE4, 0xB8]);
        assert_eq!(buf.utf8_safe_len(), 2);
        assert_eq!(buf.retrieve_utf8_string(), "ok");
        assert_eq!(buf.peek(), &[0xE4, 0xB8]);
    }

    #[test]
    fn test_utf8_all_continuation_bytes() {
        let mut buf = Buffer::new();
        buf.append(&[0x80, 0x81, 0x82]);
        assert_eq!(buf.utf8_safe_len(), 0);
        assert_eq!(buf.retrieve_utf8_string(), "");
        assert_eq!(buf.readable_bytes(), 3);
    }

    #[test]
    fn test_read_write_fd_over_pipe() {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        let (rfd, wfd) = (fds[0], fds[1]);

        let mut out = Buffer::new();
        out.append(b"ping over a pipe");
        let written = out.write_fd(wfd).unwrap();
        assert_eq!(written, 16);
        assert_eq!(out.readable_bytes(), 0);

        let mut input = Buffer::new();
        let n = input.read_fd(rfd).unwrap();
        assert_eq!(n, 16);
        assert_eq!(input.peek(), b"ping over a pipe");

        // Empty pipe reports WouldBlock, not an error worth acting on.
        let err = input.read_fd(rfd).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }
}
