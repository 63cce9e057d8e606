//! Request/response sessions.
//!
//! A service that wants a reply allocates a session id, sends the request
//! with it, and awaits the [`Session`]. The reply arrives as an ordinary
//! message with the negated id; the worker routes it to the waiting future
//! instead of the service's `dispatch`.
//!
//! Sessions are worker-local: the future is resumed on the loop that owns
//! the service, never on another thread.

use futures::channel::oneshot;
use hashbrown::HashMap;
use hearth_core::error::{HearthError, Result};
use hearth_core::message::Message;

/// Prune cancelled entries once the table grows past this.
const PRUNE_THRESHOLD: usize = 1024;

/// Pending reply for one session id.
#[must_use = "a session does nothing unless awaited"]
pub struct Session {
    id: i32,
    rx: oneshot::Receiver<Message>,
}

impl Session {
    #[inline]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Wait for the reply. Fails with [`HearthError::SessionAbandoned`]
    /// when the owning service is removed first.
    pub async fn wait(self) -> Result<Message> {
        self.rx.await.map_err(|_| HearthError::SessionAbandoned)
    }
}

/// Per-service table of outstanding sessions.
#[derive(Debug)]
pub(crate) struct SessionTable {
    next: i32,
    pending: HashMap<i32, oneshot::Sender<Message>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next free positive id.
    pub(crate) fn make(&mut self) -> Session {
        if self.pending.len() >= PRUNE_THRESHOLD {
            self.pending.retain(|_, tx| !tx.is_canceled());
        }
        while self.pending.contains_key(&self.next) {
            self.advance();
        }
        let id = self.next;
        self.advance();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Session { id, rx }
    }

    fn advance(&mut self) {
        self.next = if self.next == i32::MAX { 1 } else { self.next + 1 };
    }

    /// Hand `msg` to the session it replies to. Gives the message back when
    /// no session matches.
    pub(crate) fn resume(&mut self, msg: Message) -> std::result::Result<(), Message> {
        let id = msg.session().checked_neg().unwrap_or(0);
        match self.pending.remove(&id) {
            // A dropped waiter simply discards the reply.
            Some(tx) => {
                let _ = tx.send(msg);
                Ok(())
            }
            None => Err(msg),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending sender; waiters observe `SessionAbandoned`.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
