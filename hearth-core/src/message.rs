//! Actor messages.
//!
//! A [`Message`] is the only thing that moves between services. It carries a
//! one-byte protocol discriminator, the sender and receiver, a signed session
//! id and an optional [`ByteBuffer`] payload.
//!
//! Session ids follow one convention across the runtime:
//! - `0`: fire-and-forget
//! - `> 0`: a request whose sender is waiting for a reply
//! - `< 0`: the reply to session `-id`
//!
//! # Examples
//!
//! ```
//! use hearth_core::id::ServiceId;
//! use hearth_core::message::{ptype, Message};
//!
//! let mut msg = Message::with_text(ptype::TEXT, "ping");
//! msg.set_receiver(ServiceId::BOOTSTRAP);
//! msg.set_session(7);
//!
//! let reply = msg.reply(ptype::TEXT, "pong".into());
//! assert_eq!(reply.session(), -7);
//! assert_eq!(reply.as_str(), Some("pong"));
//! ```

use crate::buffer::{BufferFlag, ByteBuffer};
use crate::id::ServiceId;

/// Protocol discriminators carried in [`Message::ty`].
pub mod ptype {
    pub const UNKNOWN: u8 = 0;
    pub const SYSTEM: u8 = 1;
    pub const TEXT: u8 = 2;
    pub const SCRIPT: u8 = 3;
    pub const ERROR: u8 = 4;
    pub const DEBUG: u8 = 5;
    pub const SHUTDOWN: u8 = 6;
    pub const TIMER: u8 = 7;
    pub const SOCKET_TCP: u8 = 8;
    pub const SOCKET_UDP: u8 = 9;
    pub const SOCKET_WS: u8 = 10;
    pub const COMMAND: u8 = 11;
    pub const INTEGER: u8 = 12;

    /// Human readable name, for logs.
    #[must_use]
    pub const fn name(ty: u8) -> &'static str {
        match ty {
            SYSTEM => "system",
            TEXT => "text",
            SCRIPT => "script",
            ERROR => "error",
            DEBUG => "debug",
            SHUTDOWN => "shutdown",
            TIMER => "timer",
            SOCKET_TCP => "socket_tcp",
            SOCKET_UDP => "socket_udp",
            SOCKET_WS => "socket_ws",
            COMMAND => "command",
            INTEGER => "integer",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Default)]
pub struct Message {
    ty: u8,
    sender: u32,
    receiver: ServiceId,
    session: i32,
    payload: Option<ByteBuffer>,
}

impl Message {
    /// Message without payload.
    #[must_use]
    pub const fn new(ty: u8) -> Self {
        Self {
            ty,
            sender: 0,
            receiver: ServiceId::NONE,
            session: 0,
            payload: None,
        }
    }

    #[must_use]
    pub const fn with_payload(ty: u8, payload: ByteBuffer) -> Self {
        Self {
            ty,
            sender: 0,
            receiver: ServiceId::NONE,
            session: 0,
            payload: Some(payload),
        }
    }

    #[must_use]
    pub fn with_text(ty: u8, text: &str) -> Self {
        Self::with_payload(ty, ByteBuffer::from(text))
    }

    #[inline]
    #[must_use]
    pub const fn ty(&self) -> u8 {
        self.ty
    }

    #[inline]
    pub fn set_type(&mut self, ty: u8) {
        self.ty = ty;
    }

    /// Raw sender: a service id, a timer id (TIMER) or a socket handle
    /// (socket types), depending on the message type.
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> u32 {
        self.sender
    }

    #[inline]
    #[must_use]
    pub const fn sender_id(&self) -> ServiceId {
        ServiceId::from_raw(self.sender)
    }

    #[inline]
    pub fn set_sender(&mut self, sender: impl Into<u32>) {
        self.sender = sender.into();
    }

    #[inline]
    #[must_use]
    pub const fn receiver(&self) -> ServiceId {
        self.receiver
    }

    /// Changing the receiver during dispatch redirects the message.
    #[inline]
    pub fn set_receiver(&mut self, receiver: ServiceId) {
        self.receiver = receiver;
    }

    #[inline]
    #[must_use]
    pub const fn session(&self) -> i32 {
        self.session
    }

    #[inline]
    pub fn set_session(&mut self, session: i32) {
        self.session = session;
    }

    #[inline]
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.session < 0
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.payload
            .as_ref()
            .is_some_and(|p| p.has_flag(BufferFlag::Broadcast))
    }

    /// Mark as broadcast. A broadcast always carries a payload, so an empty
    /// one is created if needed.
    pub fn set_broadcast(&mut self, on: bool) {
        let payload = self.payload.get_or_insert_with(ByteBuffer::new);
        if on {
            payload.set_flag(BufferFlag::Broadcast);
        } else {
            payload.clear_flag(BufferFlag::Broadcast);
        }
    }

    #[must_use]
    pub const fn payload(&self) -> Option<&ByteBuffer> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut ByteBuffer> {
        self.payload.as_mut()
    }

    pub fn set_payload(&mut self, payload: ByteBuffer) {
        self.payload = Some(payload);
    }

    /// Take the payload out, leaving an empty buffer-less message.
    pub fn take_payload(&mut self) -> ByteBuffer {
        self.payload.take().unwrap_or_default()
    }

    /// Readable payload bytes (empty when there is no payload).
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_ref().map_or(&[], ByteBuffer::data)
    }

    /// Payload as UTF-8 text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.bytes()).ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Build the reply addressed back to this message's sender, carrying the
    /// negated session id.
    #[must_use]
    pub fn reply(&self, ty: u8, payload: ByteBuffer) -> Self {
        let mut reply = Self::with_payload(ty, payload);
        reply.sender = self.receiver.raw();
        reply.receiver = ServiceId::from_raw(self.sender);
        reply.session = -self.session;
        reply
    }
}
