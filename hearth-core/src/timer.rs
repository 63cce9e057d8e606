//! Ordered timer store.
//!
//! Entries are kept in a `BTreeMap` keyed by `(expiry, sequence)`: expiry
//! order first, insertion order for equal expiries. The map sits behind a
//! mutex so any thread may add timers, while expiry is driven by the owning
//! worker through [`TimerWheel::update`].
//!
//! `update` pops expired entries one at a time and releases the lock before
//! invoking the callback, so a callback may schedule new timers on the same
//! wheel.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct TimerWheel<T> {
    entries: Mutex<BTreeMap<(i64, u64), T>>,
    seq: AtomicU64,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedule `payload` to fire once `now >= expiry`.
    pub fn add(&self, expiry: i64, payload: T) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert((expiry, seq), payload);
    }

    /// Fire every entry whose expiry is `<= now`, in expiry then insertion
    /// order. Returns the number fired.
    ///
    /// Entries added by `fire` that are already due are fired in the same
    /// call.
    pub fn update<F>(&self, now: i64, mut fire: F) -> usize
    where
        F: FnMut(T),
    {
        let mut fired = 0;
        loop {
            let next = {
                let mut entries = self.entries.lock();
                match entries.first_key_value() {
                    Some((&(expiry, _), _)) if expiry <= now => entries.pop_first(),
                    _ => None,
                }
            };
            let Some((_, payload)) = next else {
                break;
            };
            fire(payload);
            fired += 1;
        }
        fired
    }

    /// Earliest pending expiry.
    #[must_use]
    pub fn next_expiry(&self) -> Option<i64> {
        self.entries.lock().first_key_value().map(|(&(expiry, _), _)| expiry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_expiry_then_insertion_order() {
        let wheel = TimerWheel::new();
        wheel.add(30, "c");
        wheel.add(10, "a1");
        wheel.add(20, "b");
        wheel.add(10, "a2");

        let mut fired = Vec::new();
        assert_eq!(wheel.update(25, |p| fired.push(p)), 3);
        assert_eq!(fired, vec!["a1", "a2", "b"]);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next_expiry(), Some(30));
    }

    #[test]
    fn nothing_fires_before_expiry() {
        let wheel = TimerWheel::new();
        wheel.add(100, ());
        assert_eq!(wheel.update(99, |()| panic!("fired early")), 0);
        assert_eq!(wheel.update(100, |()| {}), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn callback_may_schedule_on_same_wheel() {
        let wheel = TimerWheel::new();
        wheel.add(5, 1u32);

        let mut fired = Vec::new();
        wheel.update(10, |n| {
            fired.push(n);
            if n < 3 {
                // due immediately, picked up by the same update
                wheel.add(7, n + 1);
            }
        });
        wheel.add(50, 99);
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(wheel.next_expiry(), Some(50));
    }
}
