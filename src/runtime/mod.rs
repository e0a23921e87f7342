//! Single-threaded readiness runtime.
//!
//! Platform-specific multiplexers:
//! - Linux: epoll (scalable, kernel-held interest)
//! - any unix: select (legacy, fixed-size descriptor sets)
//!
//! Both sit behind the `Multiplexer` trait and share:
//! - `Connection` / `ConnectionTable`: per-client buffers and ownership
//! - `Listener`: bound non-blocking listening socket
//! - `handler`: accept/read/write/close logic

pub mod connection;
pub mod handler;
pub mod listener;
pub mod multiplexer;
pub mod select;

#[cfg(target_os = "linux")]
pub mod epoll;

pub use connection::{Connection, ConnectionTable};
pub use listener::Listener;
pub use multiplexer::{Event, Interest, Multiplexer, Readiness};

use crate::config::BackendType;
use crate::error::ServerError;

/// Create the multiplexer selected by configuration.
pub fn create_multiplexer(
    backend: BackendType,
    events_capacity: usize,
) -> Result<Box<dyn Multiplexer>, ServerError> {
    match backend {
        BackendType::Select => Ok(Box::new(select::Select::new())),
        BackendType::Epoll => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(epoll::Epoll::new(events_capacity)?))
            }

            #[cfg(not(target_os = "linux"))]
            {
                let _ = events_capacity;
                Err(ServerError::Unsupported(
                    "epoll backend is only available on Linux".to_string(),
                ))
            }
        }
    }
}
