//! echo-reactor: command-line driver.
//!
//! Loads configuration, initializes logging, wires SIGINT/SIGTERM to a
//! graceful stop and runs the server on the current thread.

use echo_reactor::config::Config;
use echo_reactor::{Server, StopHandle};
use std::io;
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

static STOP: OnceLock<StopHandle> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    // Only an atomic store happens here, which is async-signal-safe.
    if let Some(handle) = STOP.get() {
        handle.stop();
    }
}

fn install_signal_handlers(handle: StopHandle) -> io::Result<()> {
    let _ = STOP.set(handle);
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backend = ?config.backend,
        poll_timeout_ms = config.poll_timeout_ms,
        read_chunk_size = config.read_chunk_size,
        max_connections = config.max_connections,
        "Starting echo-reactor"
    );

    let mut server = Server::new(config);
    install_signal_handlers(server.stop_handle())?;

    server.start()?;

    info!("Shut down cleanly");
    Ok(())
}
