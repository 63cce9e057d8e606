//! Handle a service uses to talk to the runtime.
//!
//! A `ServiceContext` is worker-local and cheap to clone. Clone it into a
//! spawned task to write request/response logic as straight-line async
//! code:
//!
//! ```ignore
//! let ctx = ctx.clone();
//! ctx.clone().spawn(async move {
//!     let reply = ctx.call(peer, ByteBuffer::from("ping"), ptype::TEXT).await;
//! });
//! ```
//!
//! Every await resumes on the worker that owns the service.

use crate::config::ServiceConfig;
use crate::server::Server;
use crate::service::ServiceCore;
use crate::session::Session;
use crate::worker::Worker;
use hearth_core::buffer::ByteBuffer;
use hearth_core::clock;
use hearth_core::error::{HearthError, Result};
use hearth_core::id::ServiceId;
use hearth_core::message::{ptype, Message};
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ServiceContext {
    core: Rc<ServiceCore>,
    worker: Rc<Worker>,
}

/// Turn a reply into its payload, or its text into an error.
fn expect_reply(msg: Message) -> Result<Message> {
    if msg.ty() == ptype::ERROR {
        let text = String::from_utf8_lossy(msg.bytes()).into_owned();
        return Err(HearthError::Remote(text));
    }
    Ok(msg)
}

impl ServiceContext {
    pub(crate) fn new(core: Rc<ServiceCore>, worker: Rc<Worker>) -> Self {
        Self { core, worker }
    }

    #[inline]
    pub fn id(&self) -> ServiceId {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn is_unique(&self) -> bool {
        self.core.is_unique()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// A service that is not ready drops everything addressed to it.
    pub fn set_ready(&self, ready: bool) {
        self.core.set_ready(ready);
    }

    pub fn server(&self) -> &Arc<Server> {
        self.worker.server()
    }

    pub fn worker_id(&self) -> u8 {
        self.worker.id()
    }

    /// Milliseconds on the process clock.
    pub fn now(&self) -> i64 {
        clock::now_millis()
    }

    /// Run a task on this service's worker.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        compio::runtime::spawn(fut).detach();
    }

    pub fn make_session(&self) -> Session {
        self.core.make_session()
    }

    /// Fire-and-forget send.
    pub fn send(&self, to: ServiceId, payload: ByteBuffer, ty: u8) -> bool {
        self.server().send(self.id(), to, payload, 0, ty)
    }

    /// Send with a session id the receiver should reply to.
    pub fn send_with_session(&self, to: ServiceId, payload: ByteBuffer, session: i32, ty: u8) -> bool {
        self.server().send(self.id(), to, payload, session, ty)
    }

    /// Send a request and wait for its reply. An ERROR reply becomes
    /// [`HearthError::Remote`].
    pub async fn call(&self, to: ServiceId, payload: ByteBuffer, ty: u8) -> Result<Message> {
        let session = self.make_session();
        self.server().send(self.id(), to, payload, session.id(), ty);
        expect_reply(session.wait().await?)
    }

    /// Reply to `request` (no-op for fire-and-forget requests).
    pub fn respond(&self, request: &Message, ty: u8, payload: ByteBuffer) {
        self.server()
            .reply(self.id(), request.sender_id(), payload, request.session(), ty);
    }

    pub fn broadcast(&self, payload: &ByteBuffer, ty: u8) {
        self.server().broadcast(self.id(), payload, ty);
    }

    /// Create a service and wait for its id.
    pub async fn new_service(&self, mut conf: ServiceConfig) -> Result<ServiceId> {
        let session = self.make_session();
        conf.creator = self.id();
        conf.session = session.id();
        self.server().new_service(conf);

        let reply = expect_reply(session.wait().await?)?;
        let text = reply.as_str().unwrap_or_default();
        text.parse::<u32>()
            .map(ServiceId::from_raw)
            .map_err(|_| HearthError::Malformed(text.to_owned()))
    }

    /// Create a service without waiting for the outcome.
    pub fn spawn_service(&self, mut conf: ServiceConfig) {
        conf.creator = self.id();
        conf.session = 0;
        self.server().new_service(conf);
    }

    /// Remove a service and wait until its worker confirms.
    pub async fn remove_service(&self, id: ServiceId) -> Result<()> {
        let session = self.make_session();
        self.server().remove_service(id, self.id(), session.id());
        expect_reply(session.wait().await?).map(|_| ())
    }

    /// Send `id` a SHUTDOWN notice, then remove it.
    pub fn close_service(&self, id: ServiceId) {
        let server = self.server();
        server.send(self.id(), id, ByteBuffer::new(), 0, ptype::SHUTDOWN);
        server.remove_service(id, ServiceId::NONE, 0);
    }

    /// Remove this service.
    pub fn quit(&self) {
        self.server().remove_service(self.id(), ServiceId::NONE, 0);
    }

    /// List the services of `worker` as JSON text.
    pub async fn scan_services(&self, worker: u8) -> Result<String> {
        let session = self.make_session();
        self.server().scan_services(self.id(), worker, session.id());
        let reply = expect_reply(session.wait().await?)?;
        Ok(String::from_utf8_lossy(reply.bytes()).into_owned())
    }

    /// Schedule a TIMER message to this service; returns its timer id, which
    /// arrives as the message sender.
    pub fn timeout(&self, interval_ms: i64) -> u32 {
        let timer_id = self.worker.next_timer_id();
        self.server().timeout(interval_ms, self.id(), timer_id, 0);
        timer_id
    }

    /// Suspend the calling task for `interval_ms`.
    pub async fn sleep(&self, interval_ms: i64) -> Result<()> {
        let session = self.make_session();
        let timer_id = self.worker.next_timer_id();
        self.server()
            .timeout(interval_ms, self.id(), timer_id, session.id());
        session.wait().await.map(|_| ())
    }

    // ----- sockets -----

    /// Bind a TCP listener owned by this service. Returns the handle and the
    /// bound address.
    pub async fn listen(&self, host: &str, port: u16, ty: u8) -> Result<(u32, SocketAddr)> {
        self.worker
            .sockets
            .listen(&self.worker, host, port, self.id(), ty)
            .await
    }

    /// Accept one connection on `listener` and wait for its handle. The new
    /// connection is owned by `owner` (this service when `NONE`).
    pub async fn accept(&self, listener: u32, owner: ServiceId) -> Result<u32> {
        let owner = if owner.is_none() { self.id() } else { owner };
        let session = self.make_session();
        self.worker
            .sockets
            .accept(&self.worker, listener, session.id(), owner, self.id());
        let reply = expect_reply(session.wait().await?)?;
        let text = reply.as_str().unwrap_or_default();
        text.parse()
            .map_err(|_| HearthError::Malformed(text.to_owned()))
    }

    /// Accept connections forever; each one is announced to this service as
    /// an `accept|<listener>|<peer>` message sent from the new handle.
    pub fn accept_forever(&self, listener: u32) {
        self.worker
            .sockets
            .accept(&self.worker, listener, 0, self.id(), self.id());
    }

    /// Connect and wait for the handle. `timeout` of zero waits indefinitely.
    pub async fn connect(&self, host: &str, port: u16, ty: u8, timeout: Duration) -> Result<u32> {
        let session = self.make_session();
        self.worker
            .sockets
            .connect(&self.worker, host, port, self.id(), ty, session.id(), timeout);
        let reply = expect_reply(session.wait().await?)?;
        let text = reply.as_str().unwrap_or_default();
        text.parse()
            .map_err(|_| HearthError::Malformed(text.to_owned()))
    }

    /// Connect in the background. The outcome arrives as an INTEGER message
    /// carrying the handle, or an ERROR message.
    pub fn connect_detached(&self, host: &str, port: u16, ty: u8) {
        self.worker.sockets.connect(
            &self.worker,
            host,
            port,
            self.id(),
            ty,
            0,
            Duration::ZERO,
        );
    }

    /// Read from a connection: up to `delim` when non-empty, else exactly
    /// `count` bytes, else whatever arrives next (one slice-framed message
    /// when chunked receive is on).
    pub async fn read(&self, fd: u32, count: usize, delim: &[u8]) -> Result<ByteBuffer> {
        let session = self.make_session();
        self.worker
            .sockets
            .read(&self.worker, fd, self.id(), count, delim, session.id());
        let mut reply = expect_reply(session.wait().await?)?;
        Ok(reply.take_payload())
    }

    /// Queue `data` on a connection or on a connected UDP handle.
    pub fn write(&self, fd: u32, data: ByteBuffer) -> bool {
        self.worker.sockets.write(&self.worker, fd, data)
    }

    pub fn close(&self, fd: u32) -> bool {
        self.worker.sockets.close(&self.worker, fd)
    }

    /// Idle read timeout in seconds; 0 disables it.
    pub fn set_timeout(&self, fd: u32, seconds: u64) -> bool {
        self.worker.sockets.set_timeout(fd, seconds)
    }

    pub fn set_nodelay(&self, fd: u32) -> bool {
        self.worker.sockets.set_nodelay(fd)
    }

    pub fn set_send_queue_limit(&self, fd: u32, warn: usize, error: usize) -> bool {
        self.worker.sockets.set_send_queue_limit(fd, warn, error)
    }

    /// `"r"`, `"w"` or `"rw"`.
    pub fn set_enable_chunked(&self, fd: u32, flags: &str) -> bool {
        self.worker.sockets.set_enable_chunked(fd, flags)
    }

    /// Peer address of a connection, local address of a listener or UDP
    /// endpoint.
    pub fn address(&self, fd: u32) -> Option<String> {
        self.worker.sockets.address(fd)
    }

    /// Bind a UDP endpoint owned by this service.
    pub async fn udp_open(&self, host: &str, port: u16) -> Result<u32> {
        self.worker
            .sockets
            .udp_open(&self.worker, self.id(), host, port)
            .await
    }

    /// Set the default peer used by [`write`](Self::write).
    pub fn udp_connect(&self, fd: u32, host: &str, port: u16) -> Result<()> {
        self.worker.sockets.udp_connect(fd, host, port)
    }

    /// Send one datagram to an encoded address.
    pub fn send_to(&self, fd: u32, address: &[u8], data: ByteBuffer) -> bool {
        self.worker.sockets.send_to(&self.worker, fd, address, data)
    }
}
