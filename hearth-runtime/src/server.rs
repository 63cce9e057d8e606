//! The server: a fixed pool of workers plus the process-wide registries.
//!
//! `Server` is the explicit handle applications hold. It is shared as
//! `Arc<Server>` between the thread that calls [`Server::run`] and every
//! worker thread; all of its state is either immutable after construction
//! or behind a lock / atomic.
//!
//! Routing is by id: the top byte of a [`ServiceId`] names the worker that
//! owns the service, so delivering a message is a single queue push.

use crate::config::{ServerOptions, ServiceConfig};
use crate::placement;
use crate::service::{Service, ServiceFactory};
use crate::worker::{self, TimerEntry, WorkerCommand, WorkerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hashbrown::HashMap;
use hearth_core::buffer::ByteBuffer;
use hearth_core::clock;
use hearth_core::error::{HearthError, Result};
use hearth_core::id::{HandleRegistry, ServiceId};
use hearth_core::message::{ptype, Message};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EXIT_CODE_UNSET: i32 = i32::MAX;

/// How often `run` re-checks the shutdown conditions.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

pub struct Server {
    options: ServerOptions,
    workers: Vec<Arc<WorkerHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    factories: RwLock<HashMap<String, ServiceFactory>>,
    unique: DashMap<String, ServiceId>,
    env: DashMap<String, String>,
    handles: HandleRegistry,
    state: AtomicU8,
    exit_code: AtomicI32,
    signal_tx: flume::Sender<()>,
    signal_rx: flume::Receiver<()>,
    created: Instant,
}

impl Server {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let count = options.worker_count.clamp(1, u8::MAX as usize);
        let workers = (1..=count)
            .map(|id| Arc::new(WorkerHandle::new(id as u8)))
            .collect();
        let (signal_tx, signal_rx) = flume::bounded(1);
        Arc::new(Self {
            options,
            workers,
            threads: Mutex::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            unique: DashMap::new(),
            env: DashMap::new(),
            handles: HandleRegistry::new(),
            state: AtomicU8::new(ServerState::Init as u8),
            exit_code: AtomicI32::new(EXIT_CODE_UNSET),
            signal_tx,
            signal_rx,
            created: Instant::now(),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    // ----- lifecycle -----

    /// Spawn the worker threads. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        self.set_state(ServerState::Running);
        for handle in &self.workers {
            threads.push(worker::spawn(Arc::clone(self), Arc::clone(handle))?);
        }
        Ok(())
    }

    /// Start (if needed) and block until the server stops. Returns the exit
    /// code, 0 when none was set.
    pub fn run(self: &Arc<Self>) -> Result<i32> {
        self.start()?;
        info!(
            "[{}] started with {} workers in {:?}",
            self.name(),
            self.workers.len(),
            self.created.elapsed()
        );

        let mut shutting_down = false;
        loop {
            // Timeouts and wake-ups both just mean "check again".
            let _ = self.signal_rx.recv_timeout(RUN_POLL_INTERVAL);

            let code = self.exit_code.load(Ordering::Acquire);
            if code != EXIT_CODE_UNSET && code < 0 {
                warn!("[{}] aborting with exit code {}", self.name(), code);
                break;
            }

            if !shutting_down && (code != EXIT_CODE_UNSET || self.state() == ServerState::Stopped) {
                shutting_down = true;
                self.set_state(ServerState::Stopping);
                info!("[{}] stopping", self.name());
                for handle in self.workers.iter().rev() {
                    handle.push(WorkerCommand::Shutdown);
                }
            }

            if shutting_down && self.service_count() == 0 {
                break;
            }
        }

        for handle in self.workers.iter().rev() {
            handle.push(WorkerCommand::Exit);
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                error!("[{}] worker thread panicked", self.name());
            }
        }
        self.set_state(ServerState::Stopped);

        let code = self.exit_code.load(Ordering::Acquire);
        let code = if code == EXIT_CODE_UNSET { 0 } else { code };
        info!("[{}] stopped with exit code {}", self.name(), code);
        Ok(code)
    }

    /// Ask the server to stop. A negative code aborts without shutting
    /// services down.
    pub fn stop(&self, code: i32) {
        let _ = self.exit_code.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current == EXIT_CODE_UNSET || code < 0).then_some(code)
        });
        let _ = self.signal_tx.try_send(());
    }

    /// Exit code passed to [`stop`](Self::stop), if any.
    pub fn exit_code(&self) -> Option<i32> {
        let code = self.exit_code.load(Ordering::Acquire);
        (code != EXIT_CODE_UNSET).then_some(code)
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
        if state == ServerState::Stopped {
            let _ = self.signal_tx.try_send(());
        }
    }

    /// Milliseconds on the process clock.
    pub fn now(&self) -> i64 {
        clock::now_millis()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Live services across all workers, including ones still being created.
    pub fn service_count(&self) -> usize {
        self.workers.iter().map(|w| w.count() as usize).sum()
    }

    pub(crate) fn worker_handle(&self, id: u8) -> Option<&Arc<WorkerHandle>> {
        if id == 0 {
            return None;
        }
        self.workers.get(id as usize - 1)
    }

    // ----- services -----

    /// Register a factory under `name`.
    pub fn register_service<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(HearthError::DuplicateServiceType(name));
        }
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub(crate) fn make_service(&self, service_type: &str) -> Option<Box<dyn Service>> {
        let factory = self.factories.read().get(service_type).cloned()?;
        Some(factory())
    }

    /// Create a service on its pinned worker or the least-loaded shared one.
    /// The outcome is reported to `conf.creator` when `conf.session` is set.
    pub fn new_service(&self, conf: ServiceConfig) {
        let handle = match conf.worker {
            Some(id) => match self.worker_handle(id) {
                Some(handle) => {
                    handle.set_shared(false);
                    handle
                }
                None => {
                    warn!("new service [{}]: worker {} does not exist", conf.name, id);
                    self.response(
                        conf.creator,
                        &format!("0 worker {id} does not exist"),
                        conf.session,
                        ptype::ERROR,
                    );
                    return;
                }
            },
            None => {
                let loads: Vec<_> = self.workers.iter().map(|w| w.load()).collect();
                &self.workers[placement::pick_worker(&loads)]
            }
        };
        handle.add_count();
        handle.push(WorkerCommand::NewService(Box::new(conf)));
    }

    /// Remove `id` on its worker; `requester` gets "service destroy" or an
    /// error when `session` is set.
    pub fn remove_service(&self, id: ServiceId, requester: ServiceId, session: i32) {
        match self.worker_handle(id.worker()) {
            Some(handle) => handle.push(WorkerCommand::RemoveService {
                id,
                requester,
                session,
            }),
            None => self.response(
                requester,
                &format!("service [{id}] not found"),
                session,
                ptype::ERROR,
            ),
        }
    }

    /// Reply to `requester` with the services living on `worker`.
    pub fn scan_services(&self, requester: ServiceId, worker: u8, session: i32) {
        match self.worker_handle(worker) {
            Some(handle) => handle.push(WorkerCommand::Scan { requester, session }),
            None => self.response(
                requester,
                &format!("worker {worker} does not exist"),
                session,
                ptype::ERROR,
            ),
        }
    }

    // ----- messaging -----

    /// Queue `msg` on the worker owning its receiver. An unknown worker is a
    /// dead letter.
    pub fn send_message(&self, msg: Message) -> bool {
        let receiver = msg.receiver();
        if let Some(handle) = self.worker_handle(receiver.worker()) {
            handle.push(WorkerCommand::Deliver(msg));
            return true;
        }

        let sender = msg.sender();
        if sender != 0 && msg.ty() != ptype::TIMER {
            let text = format!(
                "{}: {}",
                HearthError::DeadLetter {
                    sender: ServiceId::from_raw(sender),
                    receiver,
                },
                hex::encode(msg.bytes())
            );
            debug!("{}", text);
            self.error_reply(ServiceId::from_raw(sender), &text, msg.session().max(0));
        }
        false
    }

    pub fn send(
        &self,
        sender: ServiceId,
        receiver: ServiceId,
        payload: ByteBuffer,
        session: i32,
        ty: u8,
    ) -> bool {
        let mut msg = Message::with_payload(ty, payload);
        msg.set_sender(sender);
        msg.set_receiver(receiver);
        msg.set_session(session);
        self.send_message(msg)
    }

    /// Reply to a request carrying `session`. Dropped when there is nobody
    /// to reply to or the request was fire-and-forget.
    pub fn reply(&self, sender: ServiceId, to: ServiceId, payload: ByteBuffer, session: i32, ty: u8) {
        if to.is_none() || session == 0 {
            return;
        }
        self.send(sender, to, payload, -session, ty);
    }

    /// Runtime-originated text reply.
    pub fn response(&self, to: ServiceId, content: &str, session: i32, ty: u8) {
        self.reply(ServiceId::NONE, to, ByteBuffer::from(content), session, ty);
    }

    /// ERROR message to `to`, delivered even without a session.
    pub fn error_reply(&self, to: ServiceId, text: &str, session: i32) {
        if to.is_none() {
            return;
        }
        self.send(ServiceId::NONE, to, ByteBuffer::from(text), -session, ptype::ERROR);
    }

    /// Deliver a copy of `payload` to every ready service except `sender`.
    /// SYSTEM broadcasts only reach unique services.
    pub fn broadcast(&self, sender: ServiceId, payload: &ByteBuffer, ty: u8) {
        for handle in &self.workers {
            let mut msg = Message::with_payload(ty, payload.clone());
            msg.set_sender(sender);
            msg.set_broadcast(true);
            handle.push(WorkerCommand::Deliver(msg));
        }
    }

    /// Fire a TIMER message at `service` after `interval_ms`, with
    /// `sender = timer_id`. A non-zero `session` makes it a reply to that
    /// session.
    pub fn timeout(&self, interval_ms: i64, service: ServiceId, timer_id: u32, session: i32) {
        let Some(handle) = self.worker_handle(service.worker()) else {
            return;
        };
        let session = -session;

        if interval_ms <= 0 {
            let mut msg = Message::new(ptype::TIMER);
            msg.set_sender(timer_id);
            msg.set_receiver(service);
            msg.set_session(session);
            handle.push(WorkerCommand::Deliver(msg));
            return;
        }

        let expiry = clock::deadline_after(interval_ms);
        let entry = TimerEntry::Service {
            service,
            timer_id,
            session,
        };
        if worker::current_worker_id() == handle.id() {
            handle.add_timer(expiry, entry);
        } else {
            handle.push(WorkerCommand::AddTimer { expiry, entry });
        }
    }

    // ----- registries -----

    pub fn env(&self, name: &str) -> Option<String> {
        self.env.get(name).map(|v| v.value().clone())
    }

    pub fn set_env(&self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    pub fn unique_service(&self, name: &str) -> Option<ServiceId> {
        self.unique.get(name).map(|v| *v.value())
    }

    /// Register `name` for `id`. The first writer wins.
    pub fn set_unique_service(&self, name: &str, id: ServiceId) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.unique.entry(name.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    pub(crate) fn remove_unique(&self, name: &str, id: ServiceId) {
        self.unique.remove_if(name, |_, owner| *owner == id);
    }

    // ----- socket handles -----

    pub fn next_fd(&self) -> u32 {
        self.handles.next_handle()
    }

    pub fn try_lock_fd(&self, fd: u32) -> bool {
        self.handles.try_lock(fd)
    }

    pub fn unlock_fd(&self, fd: u32) {
        self.handles.unlock(fd);
    }

    pub fn socket_count(&self) -> usize {
        self.handles.len()
    }

    // ----- monitoring -----

    /// JSON snapshot: one record for the server, one per worker.
    pub fn info(&self) -> String {
        let mut records = Vec::with_capacity(self.workers.len() + 1);
        records.push(InfoRecord::Server {
            id: 0,
            socket: self.socket_count(),
            timer: self.workers.iter().map(|w| w.timer_count()).sum(),
            service: self.service_count(),
        });
        records.extend(self.workers.iter().map(|handle| InfoRecord::Worker {
            id: handle.id(),
            mqsize: handle.mq_size(),
            service: handle.count(),
            timer: handle.timer_count(),
            alive: handle.alive(),
        }));
        serde_json::to_string(&records).unwrap_or_default()
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum InfoRecord {
    Server {
        id: u8,
        socket: usize,
        timer: usize,
        service: usize,
    },
    Worker {
        id: u8,
        mqsize: usize,
        service: u32,
        timer: usize,
        alive: u32,
    },
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.options.name)
            .field("workers", &self.workers.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::error::Result;

    struct Idle;

    impl Service for Idle {
        fn init(&mut self, _: &crate::context::ServiceContext, _: &ServiceConfig) -> Result<()> {
            Ok(())
        }

        fn dispatch(&mut self, _: &crate::context::ServiceContext, _: &mut Message) {}
    }

    fn server(workers: usize) -> Arc<Server> {
        Server::new(ServerOptions::new().with_worker_count(workers))
    }

    #[test]
    fn duplicate_factory_is_rejected() {
        let server = server(1);
        server.register_service("idle", || Box::new(Idle)).unwrap();
        assert!(matches!(
            server.register_service("idle", || Box::new(Idle)),
            Err(HearthError::DuplicateServiceType(name)) if name == "idle"
        ));
        assert!(server.make_service("idle").is_some());
        assert!(server.make_service("missing").is_none());
    }

    #[test]
    fn unique_names_first_writer_wins() {
        let server = server(1);
        let a = ServiceId::new(1, 5);
        let b = ServiceId::new(1, 6);
        assert!(server.set_unique_service("db", a));
        assert!(!server.set_unique_service("db", b));
        assert!(!server.set_unique_service("", b));

        server.remove_unique("db", b);
        assert_eq!(server.unique_service("db"), Some(a));
        server.remove_unique("db", a);
        assert_eq!(server.unique_service("db"), None);
    }

    #[test]
    fn env_round_trip() {
        let server = server(1);
        server.set_env("path", "/srv");
        assert_eq!(server.env("path").as_deref(), Some("/srv"));
        assert_eq!(server.env("missing"), None);
    }

    #[test]
    fn placement_counts_before_workers_run() {
        let server = server(3);
        for _ in 0..3 {
            server.new_service(ServiceConfig::new("idle"));
        }
        assert_eq!(server.service_count(), 3);
        assert!(server.workers.iter().all(|w| w.count() == 1));
    }

    #[test]
    fn pinning_marks_worker_unshared() {
        let server = server(2);
        server.new_service(ServiceConfig::new("idle").pinned_to(1));
        assert!(!server.workers[0].is_shared());
        // unpinned placement now skips worker 1 even though it is not busier
        server.new_service(ServiceConfig::new("idle"));
        server.new_service(ServiceConfig::new("idle"));
        assert_eq!(server.workers[0].count(), 1);
        assert_eq!(server.workers[1].count(), 2);
    }

    #[test]
    fn unknown_worker_is_not_queued() {
        let server = server(1);
        let mut msg = Message::with_text(ptype::TEXT, "hi");
        msg.set_receiver(ServiceId::new(9, 1));
        assert!(!server.send_message(msg));
    }

    #[test]
    fn stop_keeps_first_code_unless_aborting() {
        let server = server(1);
        assert_eq!(server.exit_code(), None);
        server.stop(3);
        server.stop(4);
        assert_eq!(server.exit_code(), Some(3));
        server.stop(-1);
        assert_eq!(server.exit_code(), Some(-1));
    }

    #[test]
    fn info_snapshot_shape() {
        let server = server(2);
        let info = server.info();
        assert!(info.starts_with("[{\"id\":0,\"socket\":0,\"timer\":0,\"service\":0}"));
        assert!(info.contains("{\"id\":1,\"mqsize\":0,"));
        assert!(info.contains("{\"id\":2,"));
        assert!(info.ends_with("\"alive\":0}]"));
    }

    #[test]
    fn info_is_valid_json() {
        let server = server(3);
        let info: serde_json::Value = serde_json::from_str(&server.info()).unwrap();
        let records = info.as_array().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["service"], 0);
        assert_eq!(records[3]["id"], 3);
    }

    #[test]
    fn fd_allocation_skips_locked() {
        let server = server(1);
        let fd = server.next_fd();
        assert!(!server.try_lock_fd(fd));
        assert_eq!(server.socket_count(), 1);

        let second = server.next_fd();
        assert_ne!(second, fd);
        server.unlock_fd(fd);
        server.unlock_fd(second);
        assert_eq!(server.socket_count(), 0);
        assert!(server.try_lock_fd(fd));
    }
}
