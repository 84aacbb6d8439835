//! query-counter-server: counts GET requests received over UDP
//!
//! Features:
//! - Persisted count that survives restarts
//! - Choice of tokio or mio runtime
//! - Configuration via CLI arguments or TOML file

use query_counter::config::{Config, RuntimeType};
use query_counter::dispatcher::RequestDispatcher;
use query_counter::storage::CounterStore;
use query_counter::{logging, runtime};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        work_directory = %config.work_directory.display(),
        fsync = config.fsync,
        runtime = ?config.runtime,
        log_level = %config.log_level,
        "Starting query counter server"
    );

    if let Err(e) = serve(&config) {
        error!(error = %e, "Server aborting");
        return Err(e);
    }

    info!("Server shutdown");
    Ok(())
}

/// Open the store and run the configured runtime until shutdown
fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;

    // The store must be usable before any datagram is accepted
    let store = CounterStore::open(&config.work_directory, config.fsync)?;
    let dispatcher = Arc::new(RequestDispatcher::new(Arc::new(store)));

    match config.runtime {
        RuntimeType::Tokio => run_tokio(addr, dispatcher),
        RuntimeType::Mio => run_mio(addr, dispatcher),
    }
}

/// Run with tokio runtime
fn run_tokio(
    addr: SocketAddr,
    dispatcher: Arc<RequestDispatcher>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime");
    runtime::run_tokio(addr, dispatcher)?;
    Ok(())
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(
    addr: SocketAddr,
    dispatcher: Arc<RequestDispatcher>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run_mio(addr, dispatcher)?;
    Ok(())
}
