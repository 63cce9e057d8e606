//! Per-worker socket bridge.
//!
//! Every listener, connection and UDP endpoint is owned by one service and
//! lives on that service's worker, keyed by a process-wide handle from the
//! server's [`HandleRegistry`](hearth_core::id::HandleRegistry). Socket
//! events come back to the owner as ordinary messages sent from the handle:
//!
//! | event                    | type                     | payload                         |
//! |--------------------------|--------------------------|---------------------------------|
//! | read completed           | the socket's type        | the bytes                       |
//! | accepted (no session)    | the listener's type      | `accept\|<listener>\|<peer>`    |
//! | datagram                 | `SOCKET_UDP`             | encoded peer address + datagram |
//! | any failure              | `ERROR`                  | `{"addr":..,"code":..,"message":..}` |
//!
//! Request/response operations (`accept`, `connect`, `read`) answer on the
//! caller's session instead.
//!
//! All socket futures run as tasks on the worker's runtime and are raced
//! against a [`Closer`], so closing a handle cancels whatever is in flight.

mod connection;
mod udp;

use crate::worker::{Worker, WorkerCommand};
use connection::Connection;
use futures::future::{self, Either};
use hashbrown::HashMap;
use hearth_core::buffer::ByteBuffer;
use hearth_core::endpoint::decode_address;
use hearth_core::error::{HearthError, Result, SocketError, SocketErrorKind};
use hearth_core::framing::ReadMode;
use hearth_core::id::ServiceId;
use hearth_core::message::{ptype, Message};
use hearth_core::options::ChunkedMode;
use hearth_core::tcp;
use std::cell::RefCell;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use udp::UdpEndpoint;

use compio::net::{TcpListener, TcpStream};

/// A TCP stream accepted on one worker, handed to the worker owning the
/// target service.
pub(crate) struct AdoptedConnection {
    pub(crate) stream: TcpStream,
    pub(crate) fd: u32,
    pub(crate) owner: ServiceId,
    pub(crate) kind: u8,
    pub(crate) peer: SocketAddr,
    pub(crate) listener: u32,
    pub(crate) reply_to: ServiceId,
    pub(crate) session: i32,
}

/// Cancellation signal shared by the tasks of one handle.
pub(crate) struct Closer {
    tx: RefCell<Option<flume::Sender<()>>>,
    rx: flume::Receiver<()>,
}

impl Closer {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx: RefCell::new(Some(tx)),
            rx,
        }
    }

    pub(crate) fn close(&self) {
        self.tx.borrow_mut().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Run `fut` unless the handle is closed first.
    pub(crate) async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_closed() {
            return None;
        }
        let closed = pin!(self.rx.recv_async());
        let fut = pin!(fut);
        match future::select(fut, closed).await {
            Either::Left((out, _)) => Some(out),
            Either::Right(_) => None,
        }
    }
}

struct Listener {
    fd: u32,
    kind: u8,
    listener: TcpListener,
    local: SocketAddr,
    closer: Closer,
}

impl Listener {
    async fn accept_loop(
        self: Rc<Self>,
        worker: Rc<Worker>,
        session: i32,
        owner: ServiceId,
        requester: ServiceId,
    ) {
        let server = worker.server().clone();
        loop {
            let Some(accepted) = self.closer.guard(self.listener.accept()).await else {
                break;
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(fd = self.fd, "accept failed: {}", e);
                    let err = SocketError::from(e);
                    server.error_reply(requester, &err.to_payload(&self.local.to_string()), session);
                    break;
                }
            };

            let fd = server.next_fd();
            trace!(listener = self.fd, fd, %peer, "accepted");
            let adopted = AdoptedConnection {
                stream,
                fd,
                owner,
                kind: self.kind,
                peer,
                listener: self.fd,
                reply_to: requester,
                session,
            };
            if owner.worker() == worker.id() {
                worker.sockets.adopt(&worker, adopted);
            } else if let Some(handle) = server.worker_handle(owner.worker()) {
                handle.push(WorkerCommand::Adopt(Box::new(adopted)));
            } else {
                server.unlock_fd(fd);
                server.error_reply(
                    requester,
                    &HearthError::UnknownWorker(owner).to_string(),
                    session,
                );
            }

            if session != 0 {
                break;
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct SocketServer {
    listeners: RefCell<HashMap<u32, Rc<Listener>>>,
    connections: RefCell<HashMap<u32, Rc<Connection>>>,
    udps: RefCell<HashMap<u32, Rc<UdpEndpoint>>>,
}

impl SocketServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Deliver a socket event to the owner, or drop the handle if the owner
    /// is gone.
    pub(crate) fn notify(&self, worker: &Rc<Worker>, msg: Message) {
        if worker.has_service(msg.receiver()) {
            worker.handle().push(WorkerCommand::Deliver(msg));
        } else {
            trace!(fd = msg.sender(), "socket owner {} is gone", msg.receiver());
            self.close_quietly(worker, msg.sender());
        }
    }

    fn event(fd: u32, owner: ServiceId, ty: u8, session: i32, payload: ByteBuffer) -> Message {
        let mut msg = Message::with_payload(ty, payload);
        msg.set_sender(fd);
        msg.set_receiver(owner);
        msg.set_session(session);
        msg
    }

    /// Bind a listener owned by `owner`.
    pub(crate) async fn listen(
        &self,
        worker: &Rc<Worker>,
        host: &str,
        port: u16,
        owner: ServiceId,
        kind: u8,
    ) -> Result<(u32, SocketAddr)> {
        let addr = tcp::resolve(host, port)?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            warn!("listen {}:{} failed: {}", host, port, e);
            e
        })?;
        let local = listener.local_addr()?;
        let fd = worker.server().next_fd();
        self.listeners.borrow_mut().insert(
            fd,
            Rc::new(Listener {
                fd,
                kind,
                listener,
                local,
                closer: Closer::new(),
            }),
        );
        info!(fd, owner = %owner, "listening on {}", local);
        Ok((fd, local))
    }

    /// Accept on `listener`. With a session, accept once and reply with the
    /// new handle; without one, keep accepting and announce each connection
    /// to `owner`.
    pub(crate) fn accept(
        &self,
        worker: &Rc<Worker>,
        listener: u32,
        session: i32,
        owner: ServiceId,
        requester: ServiceId,
    ) {
        let Some(entry) = self.listeners.borrow().get(&listener).cloned() else {
            worker.server().error_reply(
                requester,
                &format!("socket.accept: invalid listener {listener}"),
                session,
            );
            return;
        };
        let worker = Rc::clone(worker);
        compio::runtime::spawn(entry.accept_loop(worker, session, owner, requester)).detach();
    }

    /// Register an accepted stream on this worker and tell the requester.
    pub(crate) fn adopt(&self, worker: &Rc<Worker>, adopted: AdoptedConnection) {
        let AdoptedConnection {
            stream,
            fd,
            owner,
            kind,
            peer,
            listener,
            reply_to,
            session,
        } = adopted;
        let server = worker.server();

        if !worker.has_service(owner) {
            debug!(fd, "accepted connection for dead service {}", owner);
            server.unlock_fd(fd);
            server.error_reply(reply_to, &format!("service [{owner}] not found"), session);
            return;
        }

        match Connection::new(fd, owner, kind, stream, peer, &server.options().connection) {
            Ok(conn) => {
                self.connections.borrow_mut().insert(fd, conn);
                if session != 0 {
                    server.response(reply_to, &fd.to_string(), session, ptype::INTEGER);
                } else {
                    let text = format!("accept|{listener}|{peer}");
                    self.notify(worker, Self::event(fd, owner, kind, 0, ByteBuffer::from(text)));
                }
            }
            Err(e) => {
                server.unlock_fd(fd);
                let err = SocketError::from(e);
                server.error_reply(reply_to, &err.to_payload(&peer.to_string()), session);
            }
        }
    }

    /// Connect to `host:port` for `owner`. The handle (INTEGER) or the error
    /// is sent on `session`; a zero timeout waits as long as the OS does.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connect(
        &self,
        worker: &Rc<Worker>,
        host: &str,
        port: u16,
        owner: ServiceId,
        kind: u8,
        session: i32,
        timeout: Duration,
    ) {
        let worker = Rc::clone(worker);
        let host = host.to_owned();
        compio::runtime::spawn(async move {
            let server = worker.server().clone();
            let connecting = TcpStream::connect((host.as_str(), port));
            let result = if timeout.is_zero() {
                connecting.await.map_err(HearthError::from)
            } else {
                match compio::time::timeout(timeout, connecting).await {
                    Ok(result) => result.map_err(HearthError::from),
                    Err(_) => Err(HearthError::ConnectTimeout {
                        host: host.clone(),
                        port,
                    }),
                }
            };

            let stream = match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("connect {}:{} failed: {}", host, port, e);
                    server.error_reply(owner, &e.to_string(), session);
                    return;
                }
            };

            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(e) => {
                    server.error_reply(owner, &e.to_string(), session);
                    return;
                }
            };
            if !worker.has_service(owner) {
                return;
            }
            let fd = server.next_fd();
            match Connection::new(fd, owner, kind, stream, peer, &server.options().connection) {
                Ok(conn) => {
                    worker.sockets.connections.borrow_mut().insert(fd, conn);
                    debug!(fd, "connected to {}", peer);
                    let payload = ByteBuffer::from(fd.to_string());
                    server.send(ServiceId::NONE, owner, payload, -session, ptype::INTEGER);
                }
                Err(e) => {
                    server.unlock_fd(fd);
                    server.error_reply(owner, &e.to_string(), session);
                }
            }
        })
        .detach();
    }

    /// Issue one read on a connection; the payload arrives on `session`.
    pub(crate) fn read(
        &self,
        worker: &Rc<Worker>,
        fd: u32,
        requester: ServiceId,
        count: usize,
        delim: &[u8],
        session: i32,
    ) {
        let conn = self.connections.borrow().get(&fd).cloned();
        match conn {
            Some(conn) => {
                let mode = ReadMode::from_request(count, delim, conn.chunked().read);
                conn.read(worker, mode, session);
            }
            None => worker
                .server()
                .error_reply(requester, "socket.read: closed", session),
        }
    }

    /// Queue `data` on a connection, or send it to a UDP handle's default
    /// peer.
    pub(crate) fn write(&self, worker: &Rc<Worker>, fd: u32, data: ByteBuffer) -> bool {
        let conn = self.connections.borrow().get(&fd).cloned();
        if let Some(conn) = conn {
            return conn.send(worker, data);
        }
        let udp = self.udps.borrow().get(&fd).cloned();
        match udp {
            Some(udp) => udp.send_default(worker, data),
            None => false,
        }
    }

    /// Close a handle. A pending read is answered with a closed error.
    pub(crate) fn close(&self, worker: &Rc<Worker>, fd: u32) -> bool {
        if let Some(conn) = self.take_connection(worker, fd) {
            conn.shutdown(worker, Some(SocketErrorKind::Closed.into()));
            return true;
        }
        self.close_other(worker, fd)
    }

    fn close_quietly(&self, worker: &Rc<Worker>, fd: u32) {
        if let Some(conn) = self.take_connection(worker, fd) {
            conn.shutdown(worker, None);
        } else {
            self.close_other(worker, fd);
        }
    }

    fn close_other(&self, worker: &Rc<Worker>, fd: u32) -> bool {
        if let Some(listener) = self.listeners.borrow_mut().remove(&fd) {
            listener.closer.close();
        } else if let Some(udp) = self.udps.borrow_mut().remove(&fd) {
            udp.closer().close();
        } else {
            return false;
        }
        worker.server().unlock_fd(fd);
        true
    }

    /// Remove a connection from the table and release its handle.
    pub(crate) fn take_connection(&self, worker: &Rc<Worker>, fd: u32) -> Option<Rc<Connection>> {
        let conn = self.connections.borrow_mut().remove(&fd)?;
        worker.server().unlock_fd(fd);
        Some(conn)
    }

    pub(crate) fn remove_udp(&self, worker: &Rc<Worker>, fd: u32) -> Option<Rc<UdpEndpoint>> {
        let udp = self.udps.borrow_mut().remove(&fd)?;
        worker.server().unlock_fd(fd);
        Some(udp)
    }

    /// Close every handle without notifying owners.
    pub(crate) fn close_all(&self, worker: &Rc<Worker>) {
        let fds: Vec<u32> = self
            .listeners
            .borrow()
            .keys()
            .chain(self.connections.borrow().keys())
            .chain(self.udps.borrow().keys())
            .copied()
            .collect();
        for fd in fds {
            self.close_quietly(worker, fd);
        }
    }

    /// Fail every connection idle for longer than its read timeout.
    pub(crate) fn check_timeouts(&self, worker: &Rc<Worker>, now: i64) {
        let expired: Vec<Rc<Connection>> = self
            .connections
            .borrow()
            .values()
            .filter(|c| c.is_timed_out(now))
            .cloned()
            .collect();
        for conn in expired {
            debug!(fd = conn.fd(), "read timeout");
            conn.fail(worker, SocketErrorKind::ReadTimeout.into());
        }
    }

    pub(crate) fn set_timeout(&self, fd: u32, seconds: u64) -> bool {
        self.with_connection(fd, |c| {
            c.set_read_timeout((seconds > 0).then(|| Duration::from_secs(seconds)));
        })
    }

    pub(crate) fn set_nodelay(&self, fd: u32) -> bool {
        let conn = self.connections.borrow().get(&fd).cloned();
        match conn {
            Some(conn) => conn.set_nodelay().is_ok(),
            None => false,
        }
    }

    pub(crate) fn set_send_queue_limit(&self, fd: u32, warn: usize, error: usize) -> bool {
        self.with_connection(fd, |c| c.set_send_queue_limit(warn, error))
    }

    pub(crate) fn set_enable_chunked(&self, fd: u32, flags: &str) -> bool {
        let Some(mode) = ChunkedMode::parse(flags) else {
            return false;
        };
        self.with_connection(fd, |c| c.set_chunked(mode))
    }

    pub(crate) fn address(&self, fd: u32) -> Option<String> {
        if let Some(conn) = self.connections.borrow().get(&fd) {
            return Some(conn.peer().to_string());
        }
        if let Some(listener) = self.listeners.borrow().get(&fd) {
            return Some(listener.local.to_string());
        }
        self.udps.borrow().get(&fd).map(|u| u.local().to_string())
    }

    fn with_connection(&self, fd: u32, f: impl FnOnce(&Connection)) -> bool {
        match self.connections.borrow().get(&fd) {
            Some(conn) => {
                f(conn);
                true
            }
            None => false,
        }
    }

    /// Bind a UDP endpoint; an empty host binds the IPv4 wildcard.
    pub(crate) async fn udp_open(
        &self,
        worker: &Rc<Worker>,
        owner: ServiceId,
        host: &str,
        port: u16,
    ) -> Result<u32> {
        let addr = tcp::resolve(host, port)?;
        let socket = compio::net::UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        let fd = worker.server().next_fd();
        let recv_size = worker.server().options().connection.read_buffer_size;
        let endpoint = Rc::new(UdpEndpoint::new(fd, owner, socket, local));
        self.udps.borrow_mut().insert(fd, Rc::clone(&endpoint));
        compio::runtime::spawn(endpoint.recv_loop(Rc::clone(worker), recv_size)).detach();
        debug!(fd, owner = %owner, "udp bound to {}", local);
        Ok(fd)
    }

    pub(crate) fn udp_connect(&self, fd: u32, host: &str, port: u16) -> Result<()> {
        let addr = tcp::resolve(host, port)?;
        let udps = self.udps.borrow();
        let udp = udps.get(&fd).ok_or(HearthError::InvalidHandle(fd))?;
        udp.set_peer(addr);
        Ok(())
    }

    /// Send one datagram to an encoded address (see
    /// [`encode_address`](hearth_core::endpoint::encode_address)).
    pub(crate) fn send_to(&self, worker: &Rc<Worker>, fd: u32, address: &[u8], data: ByteBuffer) -> bool {
        let Some((addr, _)) = decode_address(address) else {
            return false;
        };
        let udp = self.udps.borrow().get(&fd).cloned();
        match udp {
            Some(udp) => udp.send(worker, addr, data),
            None => false,
        }
    }
}
