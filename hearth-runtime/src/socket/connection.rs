//! One TCP connection.
//!
//! The stream is split into a read half and a write half (two handles on
//! the same socket). Reads are issued one at a time by the owner; writes go
//! through a [`SendQueue`] drained by a single write task while anything is
//! pending.

use super::Closer;
use crate::worker::Worker;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use compio::runtime::TryClone;
use hearth_core::alloc::RecvBuf;
use hearth_core::backpressure::{Enqueue, SendQueue};
use hearth_core::buffer::ByteBuffer;
use hearth_core::clock;
use hearth_core::error::{SocketError, SocketErrorKind};
use hearth_core::framing::{self, ReadMode};
use hearth_core::id::ServiceId;
use hearth_core::message::{ptype, Message};
use hearth_core::options::{ChunkedMode, ConnectionOptions};
use hearth_core::tcp;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

struct ReadState {
    /// Bytes received but not yet handed out. `None` while a read task has it.
    buffer: Option<ByteBuffer>,
    /// Session of the outstanding read, if any.
    pending: Option<i32>,
    recv_time: i64,
    timeout: Option<Duration>,
}

pub(crate) struct Connection {
    fd: u32,
    owner: ServiceId,
    kind: u8,
    peer: SocketAddr,
    reader: RefCell<Option<TcpStream>>,
    writer: RefCell<Option<TcpStream>>,
    closer: Closer,
    read: RefCell<ReadState>,
    queue: RefCell<SendQueue>,
    chunked: RefCell<ChunkedMode>,
    max_read_size: usize,
    read_buffer_size: usize,
    slice_size: usize,
}

impl Connection {
    pub(crate) fn new(
        fd: u32,
        owner: ServiceId,
        kind: u8,
        stream: TcpStream,
        peer: SocketAddr,
        options: &ConnectionOptions,
    ) -> io::Result<Rc<Self>> {
        if options.nodelay {
            tcp::enable_tcp_nodelay(&stream)?;
        }
        let writer = stream.try_clone()?;
        let mut queue = SendQueue::new(
            options.send_queue_warn,
            options.send_queue_error,
            options.slice_size,
        );
        queue.set_chunked(options.chunked.write);

        Ok(Rc::new(Self {
            fd,
            owner,
            kind,
            peer,
            reader: RefCell::new(Some(stream)),
            writer: RefCell::new(Some(writer)),
            closer: Closer::new(),
            read: RefCell::new(ReadState {
                buffer: Some(ByteBuffer::with_capacity(options.read_buffer_size)),
                pending: None,
                recv_time: clock::now_millis(),
                timeout: options.read_timeout,
            }),
            queue: RefCell::new(queue),
            chunked: RefCell::new(options.chunked),
            max_read_size: options.max_read_size,
            read_buffer_size: options.read_buffer_size.max(1),
            slice_size: options.slice_size,
        }))
    }

    #[inline]
    pub(crate) fn fd(&self) -> u32 {
        self.fd
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn chunked(&self) -> ChunkedMode {
        *self.chunked.borrow()
    }

    pub(crate) fn set_chunked(&self, mode: ChunkedMode) {
        *self.chunked.borrow_mut() = mode;
        self.queue.borrow_mut().set_chunked(mode.write);
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        let mut read = self.read.borrow_mut();
        read.timeout = timeout;
        read.recv_time = clock::now_millis();
    }

    pub(crate) fn set_send_queue_limit(&self, warn: usize, error: usize) {
        self.queue.borrow_mut().set_limits(warn, error);
    }

    pub(crate) fn set_nodelay(&self) -> io::Result<()> {
        match self.writer.borrow().as_ref().or(self.reader.borrow().as_ref()) {
            Some(stream) => tcp::enable_tcp_nodelay(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub(crate) fn is_timed_out(&self, now: i64) -> bool {
        let read = self.read.borrow();
        read.timeout
            .is_some_and(|t| now - read.recv_time > t.as_millis() as i64)
    }

    fn event(&self, ty: u8, session: i32, payload: ByteBuffer) -> Message {
        let mut msg = Message::with_payload(ty, payload);
        msg.set_sender(self.fd);
        msg.set_receiver(self.owner);
        msg.set_session(session);
        msg
    }

    // ----- reads -----

    /// Start one read. Only one may be outstanding.
    pub(crate) fn read(self: &Rc<Self>, worker: &Rc<Worker>, mode: ReadMode, session: i32) {
        {
            let mut read = self.read.borrow_mut();
            if read.pending.is_some() {
                drop(read);
                let err = SocketError::from(SocketErrorKind::InvalidReadOperation);
                worker
                    .server()
                    .error_reply(self.owner, &err.to_payload(&self.peer.to_string()), session);
                return;
            }
            read.pending = Some(session);
        }

        let this = Rc::clone(self);
        let worker = Rc::clone(worker);
        compio::runtime::spawn(async move {
            let Some(result) = this.closer.guard(this.fill(&mode)).await else {
                return;
            };
            match result {
                Ok(payload) => {
                    this.read.borrow_mut().pending = None;
                    trace!(fd = this.fd, len = payload.len(), "read");
                    let msg = this.event(this.kind, -session, payload);
                    worker.sockets.notify(&worker, msg);
                }
                Err(err) => this.fail(&worker, err),
            }
        })
        .detach();
    }

    /// Receive until `mode` can be satisfied from the buffer.
    async fn fill(&self, mode: &ReadMode) -> Result<ByteBuffer, SocketError> {
        let mut stream = self
            .reader
            .borrow_mut()
            .take()
            .ok_or(SocketError::Protocol(SocketErrorKind::Closed))?;
        let mut buffer = self
            .read
            .borrow_mut()
            .buffer
            .take()
            .unwrap_or_else(|| ByteBuffer::with_capacity(self.read_buffer_size));

        let result = loop {
            match framing::extract_read(&mut buffer, mode, self.max_read_size, self.slice_size) {
                Ok(Some(payload)) => break Ok(payload),
                Ok(None) => {}
                Err(kind) => break Err(kind.into()),
            }

            buffer.prepare(self.read_buffer_size);
            let BufResult(res, recv) = stream.read(RecvBuf::new(buffer)).await;
            buffer = recv.into_inner();
            match res {
                Ok(0) => break Err(SocketError::Eof),
                Ok(_) => self.read.borrow_mut().recv_time = clock::now_millis(),
                Err(e) => break Err(e.into()),
            }
        };

        *self.reader.borrow_mut() = Some(stream);
        self.read.borrow_mut().buffer = Some(buffer);
        result
    }

    // ----- writes -----

    /// Queue `data`. Returns false when it was not accepted.
    pub(crate) fn send(self: &Rc<Self>, worker: &Rc<Worker>, data: ByteBuffer) -> bool {
        let outcome = self.queue.borrow_mut().push(data);
        match outcome {
            Enqueue::Queued { start } => {
                if start {
                    let this = Rc::clone(self);
                    let worker = Rc::clone(worker);
                    compio::runtime::spawn(async move { this.drain(worker).await }).detach();
                }
                true
            }
            Enqueue::Overflow => {
                let this = Rc::clone(self);
                let worker = Rc::clone(worker);
                compio::runtime::spawn(async move {
                    this.fail(&worker, SocketErrorKind::SendQueueTooBig.into());
                })
                .detach();
                false
            }
            Enqueue::Rejected => false,
        }
    }

    async fn drain(self: Rc<Self>, worker: Rc<Worker>) {
        let Some(mut stream) = self.writer.borrow_mut().take() else {
            return;
        };
        loop {
            let batch = self.queue.borrow_mut().next_batch();
            let Some(batch) = batch else {
                break;
            };

            let Some(BufResult(res, _)) = self
                .closer
                .guard(stream.write_vectored_all(batch.fragments))
                .await
            else {
                return;
            };
            if let Err(e) = res {
                self.fail(&worker, e.into());
                return;
            }
            self.queue.borrow_mut().complete(batch.buffers);
            trace!(fd = self.fd, bytes = batch.bytes, "flushed");

            if batch.close_after {
                if let Some(conn) = worker.sockets.take_connection(&worker, self.fd) {
                    conn.shutdown(&worker, Some(SocketErrorKind::Closed.into()));
                }
                return;
            }
        }
        *self.writer.borrow_mut() = Some(stream);
    }

    // ----- teardown -----

    /// The single failure path: deregister, close, and report `err` to the
    /// owner (on the pending read's session, if any).
    pub(crate) fn fail(self: &Rc<Self>, worker: &Rc<Worker>, err: SocketError) {
        if worker.sockets.take_connection(worker, self.fd).is_none() {
            return;
        }
        debug!(fd = self.fd, peer = %self.peer, "socket error: {}", err);
        let session = self.release();
        let payload = ByteBuffer::from(err.to_payload(&self.peer.to_string()));
        let msg = self.event(ptype::ERROR, -session.unwrap_or(0), payload);
        worker.sockets.notify(worker, msg);
    }

    /// Close an already deregistered connection. A pending read is answered
    /// with `err`; without one the owner hears nothing.
    pub(crate) fn shutdown(self: &Rc<Self>, worker: &Rc<Worker>, err: Option<SocketError>) {
        let session = self.release();
        if let (Some(session), Some(err)) = (session, err) {
            let payload = ByteBuffer::from(err.to_payload(&self.peer.to_string()));
            let msg = self.event(ptype::ERROR, -session, payload);
            worker.sockets.notify(worker, msg);
        }
    }

    /// Cancel tasks and drop both halves. Returns the pending read session.
    fn release(&self) -> Option<i32> {
        self.closer.close();
        self.queue.borrow_mut().close();
        self.reader.borrow_mut().take();
        self.writer.borrow_mut().take();
        self.read.borrow_mut().pending.take()
    }
}
