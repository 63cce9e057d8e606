//! Service identifiers and socket handle allocation.
//!
//! A [`ServiceId`] packs the owning worker into its top 8 bits and a
//! worker-local number into the low 24 bits, so any thread can route a
//! message to the right worker from the id alone.

use hashbrown::HashSet;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub const WORKER_ID_SHIFT: u32 = 24;

/// Largest local number. Allocation wraps back to 1 before reaching it.
pub const MAX_LOCAL_ID: u32 = (1 << WORKER_ID_SHIFT) - 1;

/// Globally unique actor address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServiceId(u32);

impl ServiceId {
    /// "No service": used as sender for runtime-originated messages.
    pub const NONE: Self = Self(0);

    /// First service created on worker 1.
    pub const BOOTSTRAP: Self = Self(0x0100_0001);

    #[inline]
    #[must_use]
    pub const fn new(worker: u8, local: u32) -> Self {
        Self(((worker as u32) << WORKER_ID_SHIFT) | (local & MAX_LOCAL_ID))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Owning worker (1-based; 0 is never a worker).
    #[inline]
    #[must_use]
    pub const fn worker(self) -> u8 {
        (self.0 >> WORKER_ID_SHIFT) as u8
    }

    #[inline]
    #[must_use]
    pub const fn local(self) -> u32 {
        self.0 & MAX_LOCAL_ID
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({:08X})", self.0)
    }
}

impl From<ServiceId> for u32 {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

/// Per-worker local id allocator.
///
/// Walks the local space with wraparound, skipping ids that are still live.
#[derive(Debug)]
pub struct IdAllocator {
    worker: u8,
    last: u32,
}

impl IdAllocator {
    #[must_use]
    pub const fn new(worker: u8) -> Self {
        Self { worker, last: 0 }
    }

    /// Allocator whose next candidate is `last + 1`.
    #[must_use]
    pub const fn starting_after(worker: u8, last: u32) -> Self {
        Self { worker, last }
    }

    /// Next free id, or `None` when every local number is taken.
    pub fn next<F>(&mut self, is_live: F) -> Option<ServiceId>
    where
        F: Fn(ServiceId) -> bool,
    {
        for _ in 0..MAX_LOCAL_ID {
            self.last += 1;
            if self.last >= MAX_LOCAL_ID {
                self.last = 1;
            }
            let id = ServiceId::new(self.worker, self.last);
            if !is_live(id) {
                return Some(id);
            }
        }
        None
    }
}

/// Process-wide registry of socket handles.
///
/// Handles come from a monotonically increasing counter that skips 0 and
/// any value still registered, so a recycled counter never aliases a live
/// socket.
#[derive(Debug)]
pub struct HandleRegistry {
    next: AtomicU32,
    live: RwLock<HashSet<u32>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            live: RwLock::new(HashSet::new()),
        }
    }

    /// Allocate and register a fresh handle.
    pub fn next_handle(&self) -> u32 {
        loop {
            let fd = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if fd == 0 {
                continue;
            }
            if self.try_lock(fd) {
                return fd;
            }
        }
    }

    /// Register `fd`. Returns `false` if it is already live.
    pub fn try_lock(&self, fd: u32) -> bool {
        self.live.write().insert(fd)
    }

    pub fn unlock(&self, fd: u32) {
        self.live.write().remove(&fd);
    }

    #[must_use]
    pub fn is_live(&self, fd: u32) -> bool {
        self.live.read().contains(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }
}
