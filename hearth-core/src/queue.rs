//! Multi-producer handoff queue drained in batches by one consumer.
//!
//! Producers append under a short lock. The consumer swaps the whole pending
//! vector with its own (empty) read vector and then iterates without holding
//! the lock, so contention is one push or one swap at a time.
//!
//! `push_back` returns the pending count; a return of `1` means the queue
//! just went from empty to non-empty and the consumer should be woken.

use parking_lot::Mutex;

#[derive(Debug)]
pub struct HandoffQueue<T> {
    pending: Mutex<Vec<T>>,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Append an item and return how many items are now pending.
    pub fn push_back(&self, item: T) -> usize {
        let mut pending = self.pending.lock();
        pending.push(item);
        pending.len()
    }

    /// Swap the pending items into `read` and hand it back for iteration.
    ///
    /// `read` is expected to be empty; anything left in it would otherwise
    /// be handed to producers and come back out of order.
    pub fn swap_on_read<'a>(&self, read: &'a mut Vec<T>) -> &'a mut Vec<T> {
        debug_assert!(read.is_empty(), "read vector must be drained before swapping");
        let mut pending = self.pending.lock();
        std::mem::swap(&mut *pending, read);
        read
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
