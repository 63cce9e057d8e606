//! Service contract.
//!
//! A service is an actor: it owns its state, lives on exactly one worker and
//! handles one message at a time. The runtime only talks to it through
//! [`Service::init`] and [`Service::dispatch`]; everything else goes through
//! the [`ServiceContext`] passed to both.
//!
//! Services are created on their worker thread by a factory registered under
//! a type name, so a service itself need not be `Send`.

use crate::config::ServiceConfig;
use crate::context::ServiceContext;
use crate::session::{Session, SessionTable};
use hearth_core::error::{HearthError, Result};
use hearth_core::id::ServiceId;
use hearth_core::message::Message;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

pub trait Service: 'static {
    /// Called once on the owning worker before the service becomes ready.
    /// An error aborts creation and is reported to the creator.
    fn init(&mut self, ctx: &ServiceContext, config: &ServiceConfig) -> Result<()>;

    /// Handle one message. Setting a different receiver on `msg` forwards it
    /// there after this call returns (not allowed for broadcasts).
    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message);
}

/// Builds a fresh service instance on the worker that will own it.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Runtime-side state of one live service.
pub(crate) struct ServiceCore {
    id: ServiceId,
    name: String,
    unique: bool,
    ready: Cell<bool>,
    sessions: RefCell<SessionTable>,
}

impl ServiceCore {
    pub(crate) fn new(id: ServiceId, name: String, unique: bool) -> Self {
        Self {
            id,
            name,
            unique,
            ready: Cell::new(false),
            sessions: RefCell::new(SessionTable::new()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ServiceId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn is_unique(&self) -> bool {
        self.unique
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.get()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    pub(crate) fn make_session(&self) -> Session {
        self.sessions.borrow_mut().make()
    }

    pub(crate) fn resume(&self, msg: Message) -> std::result::Result<(), Message> {
        self.sessions.borrow_mut().resume(msg)
    }

    /// Stop accepting messages and abandon all pending sessions.
    pub(crate) fn retire(&self) {
        self.ready.set(false);
        self.sessions.borrow_mut().clear();
    }
}

/// Table entry: runtime state plus the actor itself.
#[derive(Clone)]
pub(crate) struct ServiceSlot {
    pub(crate) core: Rc<ServiceCore>,
    pub(crate) actor: Rc<RefCell<Box<dyn Service>>>,
}

impl ServiceSlot {
    pub(crate) fn new(core: ServiceCore, actor: Box<dyn Service>) -> Self {
        Self {
            core: Rc::new(core),
            actor: Rc::new(RefCell::new(actor)),
        }
    }
}

/// Where a dispatched message goes next.
///
/// `Ok(None)` when the receiver was left alone, `Ok(Some(target))` when the
/// service redirected it, and an error for a redirected broadcast.
pub fn redirect_target(original: ServiceId, msg: &Message) -> Result<Option<ServiceId>> {
    let receiver = msg.receiver();
    if receiver == original {
        return Ok(None);
    }
    if msg.is_broadcast() {
        return Err(HearthError::BroadcastRedirect);
    }
    Ok(Some(receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::message::ptype;

    #[test]
    fn untouched_receiver_is_not_forwarded() {
        let mut msg = Message::new(ptype::TEXT);
        msg.set_receiver(ServiceId::new(1, 2));
        assert!(redirect_target(ServiceId::new(1, 2), &msg).unwrap().is_none());
    }

    #[test]
    fn changed_receiver_is_forwarded() {
        let mut msg = Message::new(ptype::TEXT);
        msg.set_receiver(ServiceId::new(2, 7));
        assert_eq!(
            redirect_target(ServiceId::new(1, 2), &msg).unwrap(),
            Some(ServiceId::new(2, 7))
        );
    }

    #[test]
    fn broadcast_cannot_be_redirected() {
        let mut msg = Message::new(ptype::SYSTEM);
        msg.set_broadcast(true);
        msg.set_receiver(ServiceId::new(2, 7));
        assert!(matches!(
            redirect_target(ServiceId::NONE, &msg),
            Err(HearthError::BroadcastRedirect)
        ));
    }

    #[test]
    fn retire_abandons_sessions() {
        let core = ServiceCore::new(ServiceId::new(1, 1), "svc".into(), false);
        core.set_ready(true);
        let _pending = core.make_session();
        core.retire();
        assert!(!core.is_ready());
        assert_eq!(core.sessions.borrow().len(), 0);
    }
}
