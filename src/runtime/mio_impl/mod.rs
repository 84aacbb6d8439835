//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

pub use event_loop::MioServer;
