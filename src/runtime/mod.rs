//! Datagram server runtimes.
//!
//! Two interchangeable backends drive the same receive → dispatch → reply
//! cycle:
//! - `tokio`: async receive loop (default)
//! - `mio`: readiness-based event loop (epoll on Linux, kqueue on macOS)
//!
//! Both share common pieces:
//! - `bind_udp`: socket construction through socket2
//! - `ServerState`: the Receiving/Replying alternation
//! - `shutdown_signal`: SIGINT/SIGTERM handling

mod mio_impl;
mod server;
mod signal;
mod socket;
mod state;

pub use mio_impl::MioServer;
pub use server::DatagramServer;
pub use signal::shutdown_signal;
pub(crate) use socket::bind_udp;
pub(crate) use state::ServerState;

use crate::dispatcher::RequestDispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Run the tokio backend until a shutdown signal arrives.
pub fn run_tokio(addr: SocketAddr, dispatcher: Arc<RequestDispatcher>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = DatagramServer::bind(addr, dispatcher).await?;
        server.run_until(shutdown_signal()).await;
        Ok::<(), std::io::Error>(())
    })
}

/// Run the mio backend until a shutdown signal arrives.
///
/// Signals are awaited on a dedicated thread which wakes the event loop.
pub fn run_mio(addr: SocketAddr, dispatcher: Arc<RequestDispatcher>) -> std::io::Result<()> {
    let server = MioServer::bind(addr, dispatcher)?;
    let waker = server.waker();

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Signal handling unavailable");
                    return;
                }
            };
            runtime.block_on(shutdown_signal());
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake the event loop");
            }
        })?;

    server.run()
}
