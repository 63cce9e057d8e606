//! Backpressure: per-connection send queue
//!
//! Outgoing buffers wait here until the connection's single write task
//! turns them into one vectored write. The queue enforces two limits,
//! counted in buffers:
//!
//! - at or above the warn threshold every push logs a warning
//! - at or above the error threshold the push fails; the first failure is
//!   reported as [`Enqueue::Overflow`] so the caller can fail the
//!   connection, later ones as [`Enqueue::Rejected`]
//!
//! A zero threshold disables that check.

use crate::alloc::IoBytes;
use crate::buffer::{BufferFlag, ByteBuffer};
use crate::framing;
use std::collections::VecDeque;
use tracing::warn;

/// Fragment cap for one vectored write.
pub const MAX_WRITE_FRAGMENTS: usize = 64;

/// Outcome of [`SendQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Accepted. `start` is true when no write was in progress and the
    /// caller must start draining.
    Queued { start: bool },
    /// Error threshold reached for the first time.
    Overflow,
    /// Not accepted: empty payload, a previous overflow, or a closed queue.
    Rejected,
}

/// One vectored write assembled from the head of the queue.
#[derive(Default)]
pub struct WriteBatch {
    pub fragments: Vec<IoBytes>,
    /// Queue entries covered by this batch.
    pub buffers: usize,
    /// Bytes on the wire, slice headers included.
    pub bytes: usize,
    /// The last buffer asked for the connection to close after it is sent.
    pub close_after: bool,
}

#[derive(Debug)]
pub struct SendQueue {
    pending: VecDeque<ByteBuffer>,
    /// Remaining fragments of a sliced buffer too large for one batch.
    spill: VecDeque<IoBytes>,
    spill_close: bool,
    in_flight: usize,
    writing: bool,
    overflowed: bool,
    warn_at: usize,
    error_at: usize,
    slice_size: usize,
    chunked: bool,
}

impl SendQueue {
    #[must_use]
    pub fn new(warn_at: usize, error_at: usize, slice_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            spill: VecDeque::new(),
            spill_close: false,
            in_flight: 0,
            writing: false,
            overflowed: false,
            warn_at,
            error_at,
            slice_size,
            chunked: false,
        }
    }

    pub fn set_limits(&mut self, warn_at: usize, error_at: usize) {
        self.warn_at = warn_at;
        self.error_at = error_at;
    }

    /// Slice-frame every buffer, not only those flagged chunked.
    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    /// Buffers waiting or being written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight + usize::from(!self.spill.is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn push(&mut self, buf: ByteBuffer) -> Enqueue {
        if buf.is_empty() || self.overflowed {
            return Enqueue::Rejected;
        }
        let len = self.len();
        if self.warn_at != 0 && len >= self.warn_at {
            warn!("network send queue too long. size: {}", len);
        }
        if self.error_at != 0 && len >= self.error_at {
            self.overflowed = true;
            return Enqueue::Overflow;
        }
        self.pending.push_back(buf);
        let start = !self.writing;
        self.writing = true;
        Enqueue::Queued { start }
    }

    /// Take the next batch off the queue, or `None` (and leave the writing
    /// state) when nothing is pending.
    ///
    /// A batch holds at most [`MAX_WRITE_FRAGMENTS`] fragments. A sliced
    /// buffer with more fragments than that starts a fresh batch and is
    /// written over as many batches as it needs; it counts toward
    /// `buffers` only in the batch carrying its last fragment. Batching
    /// stops after a buffer flagged `Close`.
    pub fn next_batch(&mut self) -> Option<WriteBatch> {
        if self.pending.is_empty() && self.spill.is_empty() {
            self.writing = false;
            return None;
        }
        let mut batch = WriteBatch::default();
        if !self.spill.is_empty() && self.take_spill(&mut batch) {
            self.in_flight += batch.buffers;
            return Some(batch);
        }
        while let Some(front) = self.pending.front() {
            let sliced = self.chunked || front.has_flag(BufferFlag::Chunked);
            let needed = if sliced {
                framing::slice_fragment_count(front.len(), self.slice_size)
            } else {
                1
            };
            let fits = batch.fragments.len() + needed <= MAX_WRITE_FRAGMENTS;
            if !fits && !batch.fragments.is_empty() {
                break;
            }
            let Some(buf) = self.pending.pop_front() else {
                break;
            };
            let close = buf.has_flag(BufferFlag::Close);
            let bytes = buf.into_bytes();
            if !fits {
                let mut fragments = Vec::with_capacity(needed);
                framing::push_slices(&bytes, self.slice_size, &mut fragments);
                self.spill.extend(fragments);
                self.spill_close = close;
                self.take_spill(&mut batch);
                break;
            }
            let start = batch.fragments.len();
            if sliced {
                framing::push_slices(&bytes, self.slice_size, &mut batch.fragments);
            } else {
                batch.fragments.push(IoBytes::new(bytes));
            }
            batch.bytes += batch.fragments[start..].iter().map(IoBytes::len).sum::<usize>();
            batch.buffers += 1;
            if close {
                batch.close_after = true;
                break;
            }
        }
        self.in_flight += batch.buffers;
        Some(batch)
    }

    /// Move spilled fragments into `batch` up to the fragment cap. Returns
    /// true when the batch must end here.
    fn take_spill(&mut self, batch: &mut WriteBatch) -> bool {
        let room = MAX_WRITE_FRAGMENTS.saturating_sub(batch.fragments.len());
        let take = room.min(self.spill.len());
        for fragment in self.spill.drain(..take) {
            batch.bytes += fragment.len();
            batch.fragments.push(fragment);
        }
        if !self.spill.is_empty() {
            return true;
        }
        batch.buffers += 1;
        if std::mem::take(&mut self.spill_close) {
            batch.close_after = true;
            return true;
        }
        false
    }

    /// Mark a batch as written.
    pub fn complete(&mut self, batch_buffers: usize) {
        self.in_flight = self.in_flight.saturating_sub(batch_buffers);
    }

    /// Drop everything and refuse further pushes.
    pub fn close(&mut self) {
        self.pending.clear();
        self.spill.clear();
        self.spill_close = false;
        self.in_flight = 0;
        self.writing = false;
        self.overflowed = true;
    }
}
