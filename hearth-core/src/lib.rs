//! Hearth Core
//!
//! This crate contains the runtime-agnostic building blocks of the actor
//! runtime:
//! - Growable payload buffer with head room (`buffer`)
//! - compio I/O adapters, the only unsafe code (`alloc`)
//! - Batch handoff queue between threads (`queue`)
//! - Ordered timer store (`timer`)
//! - Messages, protocol types and service ids (`message`, `id`)
//! - Stream framing and per-connection send queues (`framing`, `backpressure`)
//! - Error types (`error`)

// alloc and tcp opt back in for the raw buffer and fd access they need
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
pub mod alloc;
pub mod backpressure;
pub mod buffer;
pub mod clock;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod id;
pub mod message;
pub mod options;
pub mod queue;
pub mod tcp;
pub mod timer;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{IoBytes, RecvBuf};
    pub use crate::backpressure::{Enqueue, SendQueue, WriteBatch};
    pub use crate::buffer::{BufferFlag, ByteBuffer, SeekOrigin};
    pub use crate::command::Command;
    pub use crate::endpoint::{decode_address, encode_address};
    pub use crate::error::{HearthError, Result, SocketError, SocketErrorKind};
    pub use crate::framing::ReadMode;
    pub use crate::id::ServiceId;
    pub use crate::message::{ptype, Message};
    pub use crate::options::{ChunkedMode, ConnectionOptions};
    pub use crate::queue::HandoffQueue;
    pub use crate::timer::TimerWheel;
}
