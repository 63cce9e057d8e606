//! Growable byte buffer with reserved head room.
//!
//! `ByteBuffer` is the payload container carried by every message. It keeps
//! three cursors over a zero-initialised, power-of-two sized allocation:
//!
//! ```text
//! 0 ......... head ......... read ============ write ........... capacity
//!   head room     consumed       readable          writable tail
//! ```
//!
//! Invariants (checked by the tests below):
//! - `head <= read <= write <= capacity`
//! - `capacity` is always a power of two
//! - the readable bytes are exactly the bytes written minus those consumed
//!
//! Appends first try to fit into the tail. If the tail is too short but the
//! tail plus the already-consumed prefix is enough, the unread bytes are moved
//! back down to the head mark. Otherwise the allocation grows to the next
//! power of two and the existing bytes stay where they are.

use bytes::Bytes;
use std::fmt;
use std::io;

/// Head room reserved for prepends by default.
pub const DEFAULT_HEAD_RESERVE: usize = 16;

/// Default writable space, chosen so a fresh buffer occupies 128 bytes.
pub const DEFAULT_RESERVE: usize = 128 - DEFAULT_HEAD_RESERVE;

/// Per-buffer flags.
///
/// They travel with the payload through queues and workers, so a producer can
/// tag a buffer (close after send, frame as slices, broadcast) without a
/// separate side channel.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferFlag {
    /// Close the connection once this buffer has been written.
    Close = 2,
    /// Frame this buffer as length-prefixed slices.
    Chunked = 4,
    /// The carrying message is a broadcast.
    Broadcast = 8,
}

impl BufferFlag {
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self as u16
    }
}

/// Origin for [`ByteBuffer::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Relative to the head mark (the first byte ever readable).
    Begin,
    /// Relative to the current read cursor.
    Current,
}

/// Growable byte container with head room and read/write cursors.
///
/// `Clone` performs a full deep copy: same capacity, same head reserve,
/// same cursors and flags.
#[derive(Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    /// Configured head reserve, restored by `clear`.
    reserve: usize,
    /// Current floor of the read cursor. Drops below `reserve` only after a
    /// prepend consumed part of the head room.
    head: usize,
    read: usize,
    write: usize,
    flags: u16,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// Buffer with the default reserve and head room.
    #[must_use]
    pub fn new() -> Self {
        Self::with_head_reserve(DEFAULT_RESERVE, DEFAULT_HEAD_RESERVE)
    }

    /// Buffer with room for at least `reserve` bytes and the default head room.
    #[must_use]
    pub fn with_capacity(reserve: usize) -> Self {
        Self::with_head_reserve(reserve, DEFAULT_HEAD_RESERVE)
    }

    /// Buffer with room for at least `reserve` bytes after `head` bytes of
    /// head room.
    #[must_use]
    pub fn with_head_reserve(reserve: usize, head: usize) -> Self {
        let capacity = (reserve + head).next_power_of_two();
        Self {
            data: vec![0; capacity],
            reserve: head,
            head,
            read: head,
            write: head,
            flags: 0,
        }
    }

    /// Total allocation size. Always a power of two.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Configured head reserve.
    #[inline]
    #[must_use]
    pub const fn head_reserve(&self) -> usize {
        self.reserve
    }

    /// Bytes that can still be prepended with [`write_front`](Self::write_front).
    #[inline]
    #[must_use]
    pub const fn head_room(&self) -> usize {
        self.read
    }

    /// Bytes available at the tail without moving or growing.
    #[inline]
    #[must_use]
    pub fn writable(&self) -> usize {
        self.data.len() - self.write
    }

    #[inline]
    #[must_use]
    pub const fn read_pos(&self) -> usize {
        self.read
    }

    #[inline]
    #[must_use]
    pub const fn write_pos(&self) -> usize {
        self.write
    }

    /// The readable bytes.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read..self.write]
    }

    /// Make at least `need` writable bytes available at the tail and return
    /// exactly `need` of them. Call [`commit`](Self::commit) with the number
    /// actually filled.
    pub fn prepare(&mut self, need: usize) -> &mut [u8] {
        let writable = self.writable();
        if writable < need {
            if writable + self.read < need + self.head {
                let capacity = (self.write + need).next_power_of_two();
                self.data.resize(capacity, 0);
            } else {
                let readable = self.len();
                self.data.copy_within(self.read..self.write, self.head);
                self.read = self.head;
                self.write = self.head + readable;
            }
        }
        &mut self.data[self.write..self.write + need]
    }

    /// Advance the write cursor by `n`, clamped to the capacity.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.write + n <= self.data.len());
        self.write = (self.write + n).min(self.data.len());
    }

    /// Append bytes at the tail.
    pub fn write_back(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.prepare(bytes.len()).copy_from_slice(bytes);
        self.commit(bytes.len());
    }

    /// Prepend bytes into the head room.
    ///
    /// Returns `false` and leaves the buffer untouched when `bytes` does not
    /// fit into the head room.
    #[must_use]
    pub fn write_front(&mut self, bytes: &[u8]) -> bool {
        let n = bytes.len();
        if n > self.read {
            return false;
        }
        self.read -= n;
        self.data[self.read..self.read + n].copy_from_slice(bytes);
        self.head = self.head.min(self.read);
        true
    }

    /// Copy `out.len()` bytes out of the buffer and consume them.
    ///
    /// Returns `false` without consuming anything when fewer bytes are
    /// readable.
    #[must_use]
    pub fn read(&mut self, out: &mut [u8]) -> bool {
        let n = out.len();
        if self.len() < n {
            return false;
        }
        out.copy_from_slice(&self.data[self.read..self.read + n]);
        self.read += n;
        true
    }

    /// Consume up to `n` readable bytes.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.read += n.min(self.len());
    }

    /// Drop the last `n` written bytes (at most everything readable).
    #[inline]
    pub fn revert(&mut self, n: usize) {
        self.write -= n.min(self.len());
    }

    /// Move the read cursor. Fails (and leaves the cursor alone) when the
    /// target lies before the head mark or after the write cursor.
    #[must_use]
    pub fn seek(&mut self, offset: isize, origin: SeekOrigin) -> bool {
        let base = match origin {
            SeekOrigin::Begin => self.head,
            SeekOrigin::Current => self.read,
        };
        let Some(target) = base.checked_add_signed(offset) else {
            return false;
        };
        if target < self.head || target > self.write {
            return false;
        }
        self.read = target;
        true
    }

    /// Reset cursors to the configured head reserve and drop all flags.
    pub fn clear(&mut self) {
        self.flags = 0;
        self.head = self.reserve;
        self.read = self.reserve;
        self.write = self.reserve;
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> u16 {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    #[inline]
    pub fn set_flag(&mut self, flag: BufferFlag) {
        self.flags |= flag.bits();
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: BufferFlag) {
        self.flags &= !flag.bits();
    }

    #[inline]
    #[must_use]
    pub const fn has_flag(&self, flag: BufferFlag) -> bool {
        self.flags & flag.bits() != 0
    }

    /// Freeze the readable bytes without copying.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        let (read, write) = (self.read, self.write);
        Bytes::from(self.data).slice(read..write)
    }

    /// Writable tail, used by receive adapters.
    #[inline]
    pub(crate) fn spare(&self) -> &[u8] {
        &self.data[self.write..]
    }

    #[inline]
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len());
        buf.write_back(bytes);
        buf
    }
}

impl From<&str> for ByteBuffer {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<String> for ByteBuffer {
    fn from(s: String) -> Self {
        Self::from(s.as_bytes())
    }
}

impl fmt::Write for ByteBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_back(s.as_bytes());
        Ok(())
    }
}

impl io::Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_back(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("flags", &self.flags)
            .finish()
    }
}
