//! echo-reactor: a single-threaded, non-blocking TCP echo server.
//!
//! Every byte a client sends is written back to that client, preceded by a
//! greeting line. One thread owns the listener, the readiness multiplexer and
//! all connection state; sockets are never allowed to block it.
//!
//! Two multiplexer backends are available behind one trait:
//! - epoll (Linux): interest registered once, only ready handles returned
//! - select: descriptor sets rebuilt every poll, limited to `FD_SETSIZE`
//!
//! ```no_run
//! use echo_reactor::{Config, Server};
//!
//! let mut server = Server::new(Config::default());
//! let stop = server.stop_handle();
//! // Hand `stop` to a signal handler or another thread, then:
//! server.start().expect("server failed");
//! # drop(stop);
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;

pub use config::{BackendType, Config};
pub use error::{BackendError, ServerError};
pub use server::{Server, StopHandle};
