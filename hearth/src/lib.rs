//! # Hearth
//!
//! A thread-per-core actor runtime with an `io_uring` socket bridge.
//!
//! ## Architecture
//!
//! Hearth is structured as a small **actor kernel** with clean layering:
//!
//! - **`hearth-core`**: payload buffers, handoff queue, timers, messages,
//!   ids, framing and send-queue backpressure
//! - **`hearth-runtime`**: server, worker threads, services, sessions and the
//!   per-worker socket bridge
//! - **`hearth`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth::prelude::*;
//!
//! struct Greeter;
//!
//! impl Service for Greeter {
//!     fn init(&mut self, _ctx: &ServiceContext, _config: &ServiceConfig) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
//!         if msg.ty() == ptype::TEXT {
//!             ctx.respond(msg, ptype::TEXT, ByteBuffer::from("hello"));
//!         }
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let server = Server::new(ServerOptions::new().with_worker_count(2));
//!     server.register_service("greeter", || Box::new(Greeter))?;
//!     server.new_service(ServiceConfig::new("greeter").with_name("greeter").unique(true));
//!     std::process::exit(server.run()?);
//! }
//! ```
//!
//! ## Model
//!
//! - Every service lives on one worker for its whole life and handles one
//!   message at a time
//! - Services talk only by message; a request/response pair is correlated
//!   by a session id and can be awaited with [`ServiceContext::call`]
//! - Socket events arrive as messages from the socket handle
//!
//! ## Safety
//!
//! `unsafe` code is isolated to `hearth-core` (`alloc` for compio buffer
//! contracts, `tcp` for socket options on a borrowed descriptor).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

pub use hearth_core::{
    alloc, backpressure, buffer, clock, command, endpoint, error, framing, id, message, options,
    queue, tcp, timer,
};
pub use hearth_runtime::{config, context, placement, server, service, session};

pub use bytes::Bytes;
pub use compio;
pub use hearth_core::buffer::ByteBuffer;
pub use hearth_core::error::{HearthError, Result};
pub use hearth_core::id::ServiceId;
pub use hearth_core::message::{ptype, Message};
pub use hearth_runtime::{
    Server, ServerOptions, ServerState, Service, ServiceConfig, ServiceContext, ServiceFactory,
    Session,
};

/// Everything a service implementation usually needs.
pub mod prelude {
    pub use hearth_core::prelude::*;
    pub use hearth_runtime::prelude::*;
}
