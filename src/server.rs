//! Echo server: lifecycle and the single-threaded event loop.
//!
//! `start()` binds (if `bind()` was not called already), then polls the
//! multiplexer and routes each readiness event to the accept, read or write
//! handler until a stop is requested. `stop()` releases every connection,
//! the listener and the multiplexer. A stop requested before `start()` is
//! remembered: `start()` then only cleans up and returns.

use crate::config::Config;
use crate::error::ServerError;
use crate::runtime::handler::{self, AcceptSettings, LogThrottle};
use crate::runtime::{create_multiplexer, ConnectionTable, Interest, Listener, Multiplexer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Requests shutdown of a running server from another thread or a signal
/// handler. Only stores to an atomic flag; the loop notices within one poll
/// timeout and performs the full `Server::stop`.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Server instance
pub struct Server {
    config: Config,
    /// Sticky: once set, `bind` never clears it.
    stop_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    listener: Option<Listener>,
    multiplexer: Option<Box<dyn Multiplexer>>,
    connections: ConnectionTable,
}

impl Server {
    /// Create a new server instance. Nothing is bound until `bind` or `start`.
    pub fn new(config: Config) -> Self {
        Server {
            config,
            stop_requested: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            listener: None,
            multiplexer: None,
            connections: ConnectionTable::new(),
        }
    }

    /// Set up the listening socket and multiplexer and mark the server running.
    ///
    /// Calling this before `start` lets the caller learn the bound address
    /// (e.g. when binding port 0) before the loop blocks.
    pub fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(listener) = &self.listener {
            return listener
                .local_addr()
                .map_err(|e| ServerError::bind(&self.config.host, e));
        }

        let listener =
            Listener::bind_and_listen(&self.config.host, self.config.port, self.config.backlog)?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::bind(&self.config.host, e))?;

        let mut mux = match self.multiplexer.take() {
            Some(mux) => mux,
            None => create_multiplexer(self.config.backend, self.config.events_capacity)?,
        };
        mux.register(listener.handle(), Interest::READABLE)?;

        info!(addr = %addr, backend = mux.name(), "Server listening");

        self.listener = Some(listener);
        self.multiplexer = Some(mux);
        self.running.store(!self.stop_requested(), Ordering::SeqCst);
        Ok(addr)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Use `mux` instead of the configured backend on the next `bind`.
    #[cfg(test)]
    pub(crate) fn set_multiplexer(&mut self, mux: Box<dyn Multiplexer>) {
        self.multiplexer = Some(mux);
    }

    /// Run the event loop until stopped or a fatal poll error occurs.
    ///
    /// All resources are released before this returns, whatever the outcome.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.stop_requested() {
            info!("Stop requested before start");
            self.stop();
            return Ok(());
        }

        if let Err(e) = self.bind() {
            error!(error = %e, "Failed to start server");
            self.stop();
            return Err(e);
        }

        let result = self.event_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Event loop terminated");
        }
        self.stop();
        result
    }

    fn event_loop(&mut self) -> Result<(), ServerError> {
        let (listener, mux) = match (self.listener.as_ref(), self.multiplexer.as_mut()) {
            (Some(listener), Some(mux)) => (listener, mux),
            _ => return Ok(()),
        };
        let listener_fd = listener.handle();
        let timeout = Some(self.config.poll_timeout());
        let settings = AcceptSettings {
            greeting: self.config.greeting.as_bytes().to_vec(),
            max_connections: self.config.max_connections,
        };
        let mut events = Vec::with_capacity(self.config.events_capacity);
        let mut scratch = vec![0u8; self.config.read_chunk_size];

        let mut listener_errors = LogThrottle::default();
        let mut accept_errors = LogThrottle::default();

        debug!(backend = mux.name(), "Entering event loop");

        while !self.stop_requested.load(Ordering::SeqCst) {
            mux.poll(&mut events, timeout).map_err(ServerError::Poll)?;

            if events.is_empty() {
                trace!(
                    backend = mux.name(),
                    connections = self.connections.len(),
                    "Poll timed out"
                );
                continue;
            }

            for event in &events {
                if event.handle() == listener_fd {
                    if event.is_error() && !event.is_readable() {
                        if let Some(repeats) = listener_errors.hit() {
                            warn!(repeats, "Listener reported an error condition");
                        }
                        continue;
                    }
                    listener_errors.reset();
                    handler::accept_connections(
                        listener,
                        &mut **mux,
                        &mut self.connections,
                        &settings,
                        &mut accept_errors,
                    );
                } else {
                    handler::handle_connection_event(
                        event,
                        &mut **mux,
                        &mut self.connections,
                        &mut scratch,
                    );
                }
            }
        }

        Ok(())
    }

    /// Stop the server: close every connection, the listener and the
    /// multiplexer. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if self.listener.is_none() && self.multiplexer.is_none() && self.connections.is_empty() {
            return;
        }

        let closed = match self.multiplexer.as_mut() {
            Some(mux) => handler::close_all(&mut **mux, &mut self.connections),
            None => self.connections.drain().count(),
        };

        if let Some(listener) = self.listener.take() {
            if let Some(mux) = self.multiplexer.as_mut() {
                if let Err(e) = mux.deregister(listener.handle()) {
                    debug!(error = %e, "Failed to deregister listener");
                }
            }
        }
        self.multiplexer = None;

        info!(closed, "Server stopped");
    }

    /// Handle for requesting shutdown from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_requested: Arc::clone(&self.stop_requested),
            running: Arc::clone(&self.running),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of live client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::error::BackendError;
    use crate::runtime::Event;
    use std::io::{self, Read};
    use std::net::TcpStream;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Accepts every registration; `poll` is scripted per test.
    struct Scripted<F: FnMut(&mut Vec<Event>) -> io::Result<()> + Send> {
        poll: F,
    }

    impl<F: FnMut(&mut Vec<Event>) -> io::Result<()> + Send> Multiplexer for Scripted<F> {
        fn register(&mut self, _: RawFd, _: Interest) -> Result<(), BackendError> {
            Ok(())
        }

        fn update(&mut self, _: RawFd, _: Interest) -> Result<(), BackendError> {
            Ok(())
        }

        fn deregister(&mut self, _: RawFd) -> Result<(), BackendError> {
            Ok(())
        }

        fn poll(&mut self, events: &mut Vec<Event>, _: Option<Duration>) -> io::Result<()> {
            (self.poll)(events)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn test_config(backend: BackendType) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            backend,
            poll_timeout_ms: 20,
            ..Config::default()
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = Server::new(test_config(BackendType::Select));
        server.bind().unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().is_some());

        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        server.stop();
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_stop_before_bind() {
        let mut server = Server::new(test_config(BackendType::Select));
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_stop_before_start_is_honored() {
        let mut server = Server::new(test_config(BackendType::Select));
        server.stop_handle().stop();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = server.start();
            tx.send((result.is_ok(), server.is_running(), server.local_addr()))
                .unwrap();
        });

        let (ok, running, addr) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ok);
        assert!(!running);
        assert!(addr.is_none());
    }

    #[test]
    fn test_stop_between_bind_and_start() {
        let mut server = Server::new(test_config(BackendType::Select));
        let addr = server.bind().unwrap();
        server.stop_handle().stop();
        // A second bind must not revive the server.
        assert_eq!(server.bind().unwrap(), addr);
        assert!(!server.is_running());

        server.start().unwrap();
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_poll_error_ends_loop_and_releases() {
        let mut server = Server::new(test_config(BackendType::Select));
        server.set_multiplexer(Box::new(Scripted {
            poll: |_: &mut Vec<Event>| -> io::Result<()> {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            },
        }));

        let err = server.start().unwrap_err();
        match err {
            ServerError::Poll(e) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_empty_batches_keep_loop_running() {
        let mut server = Server::new(test_config(BackendType::Select));
        let handle = server.stop_handle();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        server.set_multiplexer(Box::new(Scripted {
            poll: move |events: &mut Vec<Event>| -> io::Result<()> {
                // Same shape as an interrupted wait: nothing ready.
                events.clear();
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    handle.stop();
                }
                Ok(())
            },
        }));

        server.start().unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_running());
    }

    #[test]
    fn test_bind_failure_reported_by_start() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(BackendType::Select);
        config.port = holder.local_addr().unwrap().port();

        let mut server = Server::new(config);
        let err = server.start().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(!server.is_running());
    }

    #[test]
    fn test_stop_handle_ends_loop_and_closes_clients() {
        let mut server = Server::new(test_config(BackendType::Select));
        let addr = server.bind().unwrap();
        let handle = server.stop_handle();

        let runner = thread::spawn(move || {
            let result = server.start();
            (result.is_ok(), server.connection_count())
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut greeting = [0u8; 8];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"Welcome ");

        handle.stop();
        let (ok, remaining) = runner.join().unwrap();
        assert!(ok);
        assert_eq!(remaining, 0);
        assert!(!handle.is_running());

        // Rest of the greeting may still be buffered, then EOF.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.ends_with(b"echo it back.\n"));
    }
}
