//! I/O buffer adapters for compio.
//!
//! This module is the ONLY place where the unsafe `IoBuf` contracts are
//! implemented. Everything else hands buffers to the driver through these
//! wrappers and stays safe.

#![allow(unsafe_code)]

use crate::buffer::ByteBuffer;
use bytes::Bytes;
use compio::buf::{IoBuf, IoBufMut, SetBufInit};

/// Receive view over the writable tail of a [`ByteBuffer`].
///
/// The driver sees an empty buffer whose capacity is the tail, so a
/// completed read lands directly after the bytes already buffered and
/// advances the write cursor. No intermediate copy.
///
/// Call [`ByteBuffer::prepare`] before wrapping to size the tail.
pub struct RecvBuf {
    inner: ByteBuffer,
}

impl RecvBuf {
    #[must_use]
    pub const fn new(inner: ByteBuffer) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn into_inner(self) -> ByteBuffer {
        self.inner
    }
}

// SAFETY: the tail slice lives inside the buffer's heap allocation, which is
// not touched while the driver owns the `RecvBuf`. Length 0 means nothing in
// the view is claimed as initialised data.
unsafe impl IoBuf for RecvBuf {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.inner.spare().as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        0
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.inner.spare().len()
    }
}

// SAFETY: the tail is exclusively owned and zero-initialised, so the driver
// may write anywhere in `[ptr, ptr + capacity)`.
unsafe impl IoBufMut for RecvBuf {
    #[inline]
    fn as_buf_mut_ptr(&mut self) -> *mut u8 {
        self.inner.spare_mut().as_mut_ptr()
    }
}

impl SetBufInit for RecvBuf {
    #[inline]
    unsafe fn set_buf_init(&mut self, len: usize) {
        debug_assert!(len <= self.inner.writable());
        self.inner.commit(len);
    }
}

/// Zero-copy `IoBuf` wrapper for Bytes.
///
/// Send queues freeze payloads into `Bytes` and hand them to vectored
/// writes through this type.
#[derive(Clone, Debug)]
pub struct IoBytes(Bytes);

impl IoBytes {
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<ByteBuffer> for IoBytes {
    fn from(buffer: ByteBuffer) -> Self {
        Self(buffer.into_bytes())
    }
}

impl From<IoBytes> for Bytes {
    fn from(io_bytes: IoBytes) -> Self {
        io_bytes.0
    }
}

impl AsRef<[u8]> for IoBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// SAFETY: IoBytes wraps Bytes which is:
// - Immutable (no mutable aliasing)
// - Refcounted (memory stays valid)
// - Contiguous (valid pointer/len guarantees)
unsafe impl IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}
