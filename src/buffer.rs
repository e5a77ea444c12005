//! Growable byte buffer with a reserved prepend region.
//!
//! One instance accumulates partial reads (input) and one accumulates
//! partial writes (output) per connection. Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0              read_index         write_index         capacity
//! ```
//!
//! The prependable region is reserved for protocol framing prefixes written
//! with [`Buffer::prepend`] and is never consumed by normal reads.

use std::io;
use std::os::unix::io::RawFd;

/// Bytes reserved at the front for `prepend`.
pub const RESERVED_PREPEND_SIZE: usize = 8;

/// Initial readable/writable capacity beyond the prepend region.
pub const INITIAL_SIZE: usize = 1024;

/// A growable byte container with `read_index <= write_index <= capacity`.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `capacity` writable bytes beyond the reserved
    /// prepend region.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0; RESERVED_PREPEND_SIZE + capacity],
            read_index: RESERVED_PREPEND_SIZE,
            write_index: RESERVED_PREPEND_SIZE,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be appended without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// Size of the region in front of the unread bytes.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// Returns true if there are no readable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// The readable bytes, without consuming them.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Advance the read cursor by `n` bytes.
    ///
    /// When the buffer becomes fully drained both cursors snap back to the
    /// prepend boundary, so long-lived connections do not accumulate cursor
    /// offset.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "retrieve past readable bytes");
        if n == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_index += n;
        }
    }

    /// Drain the buffer and reset both cursors to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.read_index = RESERVED_PREPEND_SIZE;
        self.write_index = RESERVED_PREPEND_SIZE;
    }

    /// Consume `n` bytes and return them exactly as stored.
    pub fn retrieve_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes(), "retrieve past readable bytes");
        let bytes = self.data[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        bytes
    }

    /// Consume `n` bytes and return them as a `String`. Lossy: invalid
    /// UTF-8 becomes U+FFFD. Use [`retrieve_bytes`] when the exact bytes
    /// matter.
    ///
    /// [`retrieve_bytes`]: Buffer::retrieve_bytes
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_bytes(n)).into_owned()
    }

    /// Append bytes at the write cursor, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write bytes backward into the prepend region, immediately in front of
    /// the readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` exceeds `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend larger than prependable region"
        );
        self.read_index -= data.len();
        self.data[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Three-way growth policy:
    /// 1. trailing writable space suffices: append in place;
    /// 2. total free space (prependable beyond the reserve + writable) is
    ///    still too small: grow the storage, amortized, never shrinking;
    /// 3. otherwise: compact by sliding unread bytes down to the reserved
    ///    prepend boundary, reclaiming space without reallocating.
    fn ensure_writable(&mut self, needed: usize) {
        if self.writable_bytes() >= needed {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() < needed + RESERVED_PREPEND_SIZE {
            self.data.resize(self.write_index + needed, 0);
        } else {
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.read_index..self.write_index, RESERVED_PREPEND_SIZE);
            self.read_index = RESERVED_PREPEND_SIZE;
            self.write_index = RESERVED_PREPEND_SIZE + readable;
        }
    }

    /// Read from `fd` with a single scatter syscall into the writable tail
    /// plus a 64 KiB stack fallback, so one `readv` can drain a full socket
    /// buffer even when this buffer's own free space is small. Fallback bytes
    /// are appended (growing the buffer) afterwards.
    ///
    /// Returns `Ok(0)` on peer shutdown; errors carry the saved errno.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
