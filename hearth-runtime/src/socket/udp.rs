//! UDP endpoints.

use super::Closer;
use crate::worker::Worker;
use compio::buf::BufResult;
use compio::net::UdpSocket;
use hearth_core::alloc::{IoBytes, RecvBuf};
use hearth_core::buffer::ByteBuffer;
use hearth_core::endpoint::{encode_address, ADDR_V6_SIZE};
use hearth_core::error::SocketError;
use hearth_core::id::ServiceId;
use hearth_core::message::{ptype, Message};
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, trace};

pub(crate) struct UdpEndpoint {
    fd: u32,
    owner: ServiceId,
    socket: UdpSocket,
    local: SocketAddr,
    /// Default destination for `write`.
    peer: Cell<Option<SocketAddr>>,
    closer: Closer,
}

impl UdpEndpoint {
    pub(crate) fn new(fd: u32, owner: ServiceId, socket: UdpSocket, local: SocketAddr) -> Self {
        Self {
            fd,
            owner,
            socket,
            local,
            peer: Cell::new(None),
            closer: Closer::new(),
        }
    }

    pub(crate) fn local(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn closer(&self) -> &Closer {
        &self.closer
    }

    pub(crate) fn set_peer(&self, addr: SocketAddr) {
        self.peer.set(Some(addr));
    }

    /// Deliver every datagram to the owner until closed. The payload starts
    /// with the encoded sender address, written into the head room.
    pub(crate) async fn recv_loop(self: Rc<Self>, worker: Rc<Worker>, recv_size: usize) {
        loop {
            let mut buffer = ByteBuffer::with_head_reserve(recv_size, ADDR_V6_SIZE);
            buffer.prepare(recv_size);
            let Some(BufResult(res, recv)) = self
                .closer
                .guard(self.socket.recv_from(RecvBuf::new(buffer)))
                .await
            else {
                break;
            };

            match res {
                Ok((n, from)) => {
                    let mut payload = recv.into_inner();
                    if !payload.write_front(&encode_address(&from)) {
                        continue;
                    }
                    trace!(fd = self.fd, len = n, %from, "datagram");
                    let mut msg = Message::with_payload(ptype::SOCKET_UDP, payload);
                    msg.set_sender(self.fd);
                    msg.set_receiver(self.owner);
                    worker.sockets.notify(&worker, msg);
                }
                Err(e) => {
                    self.fail(&worker, e.into());
                    break;
                }
            }
        }
    }

    /// Send to the default peer set by `udp_connect`.
    pub(crate) fn send_default(self: &Rc<Self>, worker: &Rc<Worker>, data: ByteBuffer) -> bool {
        match self.peer.get() {
            Some(addr) => self.send(worker, addr, data),
            None => false,
        }
    }

    pub(crate) fn send(self: &Rc<Self>, worker: &Rc<Worker>, addr: SocketAddr, data: ByteBuffer) -> bool {
        if self.closer.is_closed() {
            return false;
        }
        let this = Rc::clone(self);
        let worker = Rc::clone(worker);
        compio::runtime::spawn(async move {
            let sending = this.socket.send_to(IoBytes::from(data), addr);
            if let Some(BufResult(Err(e), _)) = this.closer.guard(sending).await {
                this.fail(&worker, e.into());
            }
        })
        .detach();
        true
    }

    fn fail(&self, worker: &Rc<Worker>, err: SocketError) {
        if worker.sockets.remove_udp(worker, self.fd).is_none() {
            return;
        }
        self.closer.close();
        debug!(fd = self.fd, "udp error: {}", err);
        let mut msg = Message::with_text(ptype::ERROR, &err.to_payload(&self.local.to_string()));
        msg.set_sender(self.fd);
        msg.set_receiver(self.owner);
        worker.sockets.notify(worker, msg);
    }
}
