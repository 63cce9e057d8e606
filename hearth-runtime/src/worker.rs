//! Worker threads.
//!
//! Each worker is one OS thread running its own compio runtime. The thread
//! owns a table of services and a socket server, and is driven by a single
//! loop:
//!
//! 1. swap the handoff queue and process every command in it
//! 2. fire due timers
//! 3. sleep until woken by a producer or until the next timer is due
//!
//! Other threads only ever touch the [`WorkerHandle`]: they push commands
//! into its queue, read its counters, or (from the worker's own thread) add
//! timers directly.

use crate::config::ServiceConfig;
use crate::context::ServiceContext;
use crate::placement::WorkerLoad;
use crate::server::{Server, ServerState};
use crate::service::{self, ServiceCore, ServiceSlot};
use crate::socket::{AdoptedConnection, SocketServer};
use futures::future::{self, Either};
use hashbrown::HashMap;
use hearth_core::buffer::ByteBuffer;
use hearth_core::clock;
use hearth_core::error::{HearthError, Result};
use hearth_core::id::{IdAllocator, ServiceId};
use hearth_core::message::{ptype, Message};
use hearth_core::queue::HandoffQueue;
use hearth_core::timer::TimerWheel;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::io;
use std::pin::pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

thread_local! {
    static CURRENT_WORKER: Cell<u8> = const { Cell::new(0) };
}

/// Id of the worker running on this thread, 0 on any other thread.
pub(crate) fn current_worker_id() -> u8 {
    CURRENT_WORKER.with(Cell::get)
}

/// What a due timer does.
#[derive(Debug)]
pub(crate) enum TimerEntry {
    /// Deliver a TIMER message to a service.
    Service {
        service: ServiceId,
        timer_id: u32,
        session: i32,
    },
    /// Periodic idle-connection scan.
    SocketScan,
}

/// Commands processed by a worker loop.
pub(crate) enum WorkerCommand {
    Deliver(Message),
    NewService(Box<ServiceConfig>),
    RemoveService {
        id: ServiceId,
        requester: ServiceId,
        session: i32,
    },
    Scan {
        requester: ServiceId,
        session: i32,
    },
    AddTimer {
        expiry: i64,
        entry: TimerEntry,
    },
    /// A connection accepted on another worker for a service living here.
    Adopt(Box<AdoptedConnection>),
    /// Bump the liveness counter.
    Ping,
    /// Dispatch SHUTDOWN to every service, then remove them all.
    Shutdown,
    /// Leave the loop.
    Exit,
}

/// Thread-safe face of a worker.
pub(crate) struct WorkerHandle {
    id: u8,
    queue: HandoffQueue<WorkerCommand>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    timers: TimerWheel<TimerEntry>,
    count: AtomicU32,
    shared: AtomicBool,
    mq_size: AtomicUsize,
    version: AtomicU32,
}

impl WorkerHandle {
    pub(crate) fn new(id: u8) -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            id,
            queue: HandoffQueue::new(),
            wake_tx,
            wake_rx,
            timers: TimerWheel::new(),
            count: AtomicU32::new(0),
            shared: AtomicBool::new(true),
            mq_size: AtomicUsize::new(0),
            version: AtomicU32::new(0),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn push(&self, cmd: WorkerCommand) {
        self.mq_size.fetch_add(1, Ordering::Relaxed);
        if self.queue.push_back(cmd) == 1 {
            self.wake();
        }
    }

    pub(crate) fn wake(&self) {
        // A full channel already holds a pending wake-up.
        let _ = self.wake_tx.try_send(());
    }

    /// Add a timer from the worker's own thread.
    pub(crate) fn add_timer(&self, expiry: i64, entry: TimerEntry) {
        self.timers.add(expiry, entry);
        self.wake();
    }

    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn add_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn sub_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub(crate) fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Release);
    }

    pub(crate) fn mq_size(&self) -> usize {
        self.mq_size.load(Ordering::Relaxed)
    }

    pub(crate) fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Current liveness counter; also asks the worker to bump it, so a
    /// worker stuck in one dispatch shows a frozen value.
    pub(crate) fn alive(&self) -> u32 {
        let version = self.version.load(Ordering::Relaxed);
        self.push(WorkerCommand::Ping);
        version
    }

    pub(crate) fn load(&self) -> WorkerLoad {
        WorkerLoad {
            count: self.count(),
            shared: self.is_shared(),
        }
    }
}

/// Start the thread for `handle`.
pub(crate) fn spawn(server: Arc<Server>, handle: Arc<WorkerHandle>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("hearth-worker-{}", handle.id()))
        .spawn(move || worker_thread(server, handle))
}

fn worker_thread(server: Arc<Server>, handle: Arc<WorkerHandle>) {
    let id = handle.id();
    info!("[Worker {}] Starting", id);

    let rt = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[Worker {}] Failed to create runtime: {}", id, e);
            server.stop(-1);
            return;
        }
    };

    CURRENT_WORKER.with(|c| c.set(id));
    rt.block_on(async move {
        let worker = Rc::new(Worker::new(server, handle));
        worker.run().await;
    });

    info!("[Worker {}] Stopped", id);
}

/// Let spawned tasks run before the loop continues.
async fn yield_now() {
    let mut yielded = false;
    future::poll_fn(|cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await;
}

/// One `scan_services` record.
#[derive(Serialize)]
struct ScanEntry<'a> {
    name: &'a str,
    serviceid: String,
}

/// Thread-local worker state.
pub(crate) struct Worker {
    handle: Arc<WorkerHandle>,
    server: Arc<Server>,
    services: RefCell<HashMap<ServiceId, ServiceSlot>>,
    ids: RefCell<IdAllocator>,
    pub(crate) sockets: SocketServer,
    next_timer_id: Cell<u32>,
    exiting: Cell<bool>,
}

impl Worker {
    fn new(server: Arc<Server>, handle: Arc<WorkerHandle>) -> Self {
        let id = handle.id();
        Self {
            handle,
            server,
            services: RefCell::new(HashMap::new()),
            ids: RefCell::new(IdAllocator::new(id)),
            sockets: SocketServer::new(),
            next_timer_id: Cell::new(0),
            exiting: Cell::new(false),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u8 {
        self.handle.id()
    }

    #[inline]
    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub(crate) fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub(crate) fn has_service(&self, id: ServiceId) -> bool {
        self.services.borrow().contains_key(&id)
    }

    pub(crate) fn next_timer_id(&self) -> u32 {
        let mut id = self.next_timer_id.get().wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        self.next_timer_id.set(id);
        id
    }

    async fn run(self: Rc<Self>) {
        self.schedule_socket_scan();
        let idle_wait = self.server.options().idle_wait;
        let mut batch = Vec::new();

        loop {
            let read = self.handle.queue.swap_on_read(&mut batch);
            self.handle.mq_size.fetch_sub(read.len(), Ordering::Relaxed);
            for cmd in read.drain(..) {
                self.handle_command(cmd);
            }

            self.handle
                .timers
                .update(clock::now_millis(), |entry| self.on_timer(entry));

            if self.exiting.get() {
                break;
            }

            yield_now().await;
            if !self.handle.queue.is_empty() {
                continue;
            }

            let wait = self
                .handle
                .timers
                .next_expiry()
                .map_or(idle_wait, |expiry| clock::until(expiry).min(idle_wait));
            let woken = pin!(self.handle.wake_rx.recv_async());
            let slept = pin!(compio::time::sleep(wait));
            if let Either::Left((Err(_), _)) = future::select(woken, slept).await {
                // the handle owns the sender, so this cannot happen while we run
                break;
            }
        }

        self.sockets.close_all(&self);
        let slots: Vec<ServiceSlot> = self.services.borrow_mut().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.core.retire();
        }
        self.handle.timers.clear();
    }

    fn handle_command(self: &Rc<Self>, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Deliver(msg) => self.handle_one(msg),
            WorkerCommand::NewService(conf) => self.new_service(*conf),
            WorkerCommand::RemoveService {
                id,
                requester,
                session,
            } => self.remove_service(id, requester, session),
            WorkerCommand::Scan { requester, session } => self.scan(requester, session),
            WorkerCommand::AddTimer { expiry, entry } => self.handle.timers.add(expiry, entry),
            WorkerCommand::Adopt(conn) => self.sockets.adopt(self, *conn),
            WorkerCommand::Ping => {
                self.handle.version.fetch_add(1, Ordering::Relaxed);
            }
            WorkerCommand::Shutdown => self.shutdown(),
            WorkerCommand::Exit => self.exiting.set(true),
        }
    }

    fn schedule_socket_scan(&self) {
        let interval = self.server.options().socket_scan_interval;
        let expiry = clock::deadline_after(interval.as_millis() as i64);
        self.handle.timers.add(expiry, TimerEntry::SocketScan);
    }

    fn on_timer(self: &Rc<Self>, entry: TimerEntry) {
        match entry {
            TimerEntry::Service {
                service,
                timer_id,
                session,
            } => {
                let mut msg = Message::new(ptype::TIMER);
                msg.set_sender(timer_id);
                msg.set_receiver(service);
                msg.set_session(session);
                self.handle_one(msg);
            }
            TimerEntry::SocketScan => {
                self.sockets.check_timeouts(self, clock::now_millis());
                if !self.exiting.get() {
                    self.schedule_socket_scan();
                }
            }
        }
    }

    /// Route one message to the service (or services) it is addressed to.
    pub(crate) fn handle_one(self: &Rc<Self>, mut msg: Message) {
        if msg.is_broadcast() {
            self.broadcast_local(msg);
            return;
        }

        let receiver = msg.receiver();
        let slot = self.services.borrow().get(&receiver).cloned();
        let slot = match slot {
            Some(slot) if slot.core.is_ready() => slot,
            _ => {
                self.dead_letter(&msg);
                return;
            }
        };

        if msg.is_reply() {
            match slot.core.resume(msg) {
                Ok(()) => return,
                Err(unmatched) => msg = unmatched,
            }
        }

        self.dispatch(&slot, &mut msg);

        match service::redirect_target(receiver, &msg) {
            Ok(Some(target)) => {
                trace!("[Worker {}] {} redirected to {}", self.id(), receiver, target);
                self.server.send_message(msg);
            }
            Ok(None) => {}
            Err(e) => warn!("[Worker {}] {}", self.id(), e),
        }
    }

    fn broadcast_local(self: &Rc<Self>, mut msg: Message) {
        let sender = msg.sender();
        let ty = msg.ty();
        let receiver = msg.receiver();
        let targets: Vec<ServiceSlot> = self
            .services
            .borrow()
            .values()
            .filter(|s| s.core.is_ready() && s.core.id().raw() != sender)
            .filter(|s| ty != ptype::SYSTEM || s.core.is_unique())
            .cloned()
            .collect();

        for slot in &targets {
            if !slot.core.is_ready() {
                continue;
            }
            self.dispatch(slot, &mut msg);
            if let Err(e) = service::redirect_target(receiver, &msg) {
                warn!("[Worker {}] service {}: {}", self.id(), slot.core.id(), e);
                msg.set_receiver(receiver);
            }
        }
    }

    fn dispatch(self: &Rc<Self>, slot: &ServiceSlot, msg: &mut Message) {
        let ctx = ServiceContext::new(Rc::clone(&slot.core), Rc::clone(self));
        let started = Instant::now();
        match slot.actor.try_borrow_mut() {
            Ok(mut actor) => actor.dispatch(&ctx, msg),
            Err(_) => {
                error!(
                    "[Worker {}] service {} is already dispatching; message dropped",
                    self.id(),
                    slot.core.id()
                );
                return;
            }
        }
        let elapsed = started.elapsed();
        if elapsed > self.server.options().slow_dispatch {
            warn!(
                "[Worker {}] handle one message({}) cost {:?}, from {:08X} to {}",
                self.id(),
                ptype::name(msg.ty()),
                elapsed,
                msg.sender(),
                slot.core.id()
            );
        }
    }

    /// Report an undeliverable message back to its sender.
    fn dead_letter(&self, msg: &Message) {
        let sender = msg.sender();
        if sender == 0 || msg.ty() == ptype::TIMER {
            trace!(
                "[Worker {}] dropped {} message for dead service {}",
                self.id(),
                ptype::name(msg.ty()),
                msg.receiver()
            );
            return;
        }
        let text = format!(
            "{}: {}",
            HearthError::DeadLetter {
                sender: ServiceId::from_raw(sender),
                receiver: msg.receiver(),
            },
            hex::encode(msg.bytes())
        );
        debug!("[Worker {}] {}", self.id(), text);
        // a dead-lettered reply must not come back as a new request
        self.server
            .error_reply(ServiceId::from_raw(sender), &text, msg.session().max(0));
    }

    fn new_service(self: &Rc<Self>, conf: ServiceConfig) {
        let id = {
            let services = self.services.borrow();
            self.ids.borrow_mut().next(|id| services.contains_key(&id))
        };
        let created = id
            .ok_or(HearthError::ServiceIdExhausted(self.id()))
            .and_then(|id| self.create_service(id, &conf));

        match created {
            Ok(id) => {
                debug!(
                    "[Worker {}] new service [{}] {}",
                    self.id(),
                    conf.name,
                    id
                );
                if conf.session != 0 {
                    self.server.response(
                        conf.creator,
                        &id.raw().to_string(),
                        conf.session,
                        ptype::INTEGER,
                    );
                }
            }
            Err(e) => {
                error!(
                    "[Worker {}] new service [{}] of type '{}' failed: {}",
                    self.id(),
                    conf.name,
                    conf.service_type,
                    e
                );
                // the first service of the server is the bootstrap; nothing runs without it
                if id == Some(ServiceId::BOOTSTRAP) {
                    error!("[Worker {}] bootstrap service failed to start", self.id());
                    self.server.stop(-1);
                }
                self.handle.sub_count();
                if self.services.borrow().is_empty() {
                    self.handle.set_shared(true);
                }
                if conf.session != 0 {
                    self.server
                        .response(conf.creator, &format!("0 {e}"), conf.session, ptype::ERROR);
                }
            }
        }
    }

    fn create_service(self: &Rc<Self>, id: ServiceId, conf: &ServiceConfig) -> Result<ServiceId> {
        let actor = self
            .server
            .make_service(&conf.service_type)
            .ok_or_else(|| HearthError::UnknownServiceType(conf.service_type.clone()))?;

        let register_unique = conf.unique && !conf.name.is_empty();
        if register_unique && !self.server.set_unique_service(&conf.name, id) {
            return Err(HearthError::UniqueNameTaken(conf.name.clone()));
        }

        let slot = ServiceSlot::new(ServiceCore::new(id, conf.name.clone(), conf.unique), actor);
        let ctx = ServiceContext::new(Rc::clone(&slot.core), Rc::clone(self));
        let init = slot.actor.borrow_mut().init(&ctx, conf);
        if let Err(e) = init {
            slot.core.retire();
            if register_unique {
                self.server.remove_unique(&conf.name, id);
            }
            return Err(e);
        }

        slot.core.set_ready(true);
        self.services.borrow_mut().insert(id, slot);
        Ok(id)
    }

    fn remove_service(self: &Rc<Self>, id: ServiceId, requester: ServiceId, session: i32) {
        let removed = self.services.borrow_mut().remove(&id);
        let Some(slot) = removed else {
            if session != 0 {
                self.server.response(
                    requester,
                    &format!("service [{id}] not found"),
                    session,
                    ptype::ERROR,
                );
            }
            return;
        };

        slot.core.retire();
        self.handle.sub_count();
        if slot.core.is_unique() && !slot.core.name().is_empty() {
            self.server.remove_unique(slot.core.name(), id);
        }
        if session != 0 {
            self.server
                .response(requester, "service destroy", session, ptype::TEXT);
        }
        if self.services.borrow().is_empty() {
            self.handle.set_shared(true);
        }
        debug!("[Worker {}] service [{}] {} removed", self.id(), slot.core.name(), id);

        if self.server.state() == ServerState::Running {
            let text = format!("_service_exit,name:{} serviceid:{}", slot.core.name(), id);
            self.server
                .broadcast(id, &ByteBuffer::from(text.as_str()), ptype::SYSTEM);
        }
        if id == ServiceId::BOOTSTRAP {
            self.server.set_state(ServerState::Stopped);
        }
    }

    fn scan(&self, requester: ServiceId, session: i32) {
        let content = {
            let services = self.services.borrow();
            let entries: Vec<ScanEntry<'_>> = services
                .values()
                .map(|slot| ScanEntry {
                    name: slot.core.name(),
                    serviceid: format!("{:X}", slot.core.id().raw()),
                })
                .collect();
            serde_json::to_string(&entries).unwrap_or_default()
        };
        self.server.response(requester, &content, session, ptype::TEXT);
    }

    fn shutdown(self: &Rc<Self>) {
        let slots: Vec<ServiceSlot> = self.services.borrow().values().cloned().collect();
        for slot in &slots {
            if slot.core.is_ready() {
                let mut msg = Message::new(ptype::SHUTDOWN);
                msg.set_receiver(slot.core.id());
                self.dispatch(slot, &mut msg);
            }
        }
        let ids: Vec<ServiceId> = self.services.borrow().keys().copied().collect();
        for id in ids {
            self.remove_service(id, ServiceId::NONE, 0);
        }
        debug!("[Worker {}] shutdown complete", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_counts_queue_depth() {
        let handle = WorkerHandle::new(1);
        handle.push(WorkerCommand::Ping);
        handle.push(WorkerCommand::Ping);
        assert_eq!(handle.mq_size(), 2);
        // first push leaves one pending wake-up, the second is coalesced
        assert_eq!(handle.wake_rx.len(), 1);
    }

    #[test]
    fn alive_reports_then_requests_ping() {
        let handle = WorkerHandle::new(2);
        assert_eq!(handle.alive(), 0);
        assert_eq!(handle.queue.len(), 1);
    }

    #[test]
    fn load_snapshot() {
        let handle = WorkerHandle::new(3);
        handle.add_count();
        handle.set_shared(false);
        assert_eq!(
            handle.load(),
            WorkerLoad {
                count: 1,
                shared: false
            }
        );
    }

    #[test]
    fn no_worker_outside_worker_threads() {
        assert_eq!(current_worker_id(), 0);
    }
}
