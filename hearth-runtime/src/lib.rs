//! # Hearth Runtime
//!
//! Worker threads, services and the socket bridge.
//!
//! ## Overview
//!
//! A [`Server`] owns a fixed pool of workers. Each worker is one OS thread
//! running a single-threaded compio runtime that hosts a set of services
//! (actors). Services never move between workers and are only reached by
//! message:
//!
//! - **Routing**: a [`ServiceId`](hearth_core::id::ServiceId) carries its
//!   worker in the top byte, so a send is one push onto that worker's queue
//! - **Sessions**: request/response pairs are correlated by a session id;
//!   the reply resumes the awaiting task on the owning worker
//! - **Timers**: each worker keeps its own timer store
//! - **Sockets**: TCP/UDP events come back to the owning service as messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth_core::prelude::*;
//! use hearth_runtime::prelude::*;
//!
//! struct Hello;
//!
//! impl Service for Hello {
//!     fn init(&mut self, ctx: &ServiceContext, _: &ServiceConfig) -> Result<()> {
//!         ctx.send(ctx.id(), ByteBuffer::from("hello"), ptype::TEXT);
//!         Ok(())
//!     }
//!
//!     fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
//!         println!("{}", msg.as_str().unwrap_or_default());
//!         ctx.server().stop(0);
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let server = Server::new(ServerOptions::default());
//!     server.register_service("hello", || Box::new(Hello))?;
//!     server.new_service(ServiceConfig::new("hello").with_name("hello"));
//!     std::process::exit(server.run()?);
//! }
//! ```

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

// Internal modules (not part of public API)
mod socket;
mod worker;

pub mod config;
pub mod context;
pub mod placement;
pub mod server;
pub mod service;
pub mod session;

pub use config::{ServerOptions, ServiceConfig};
pub use context::ServiceContext;
pub use server::{Server, ServerState};
pub use service::{Service, ServiceFactory};
pub use session::Session;

pub mod prelude {
    pub use crate::config::{ServerOptions, ServiceConfig};
    pub use crate::context::ServiceContext;
    pub use crate::server::{Server, ServerState};
    pub use crate::service::Service;
    pub use crate::session::Session;
}
