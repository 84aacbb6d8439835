//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when the socket is ready,
//! then we perform non-blocking receive/send syscalls.
//!
//! The socket is registered READABLE while receiving. If a reply cannot be
//! sent immediately it is kept pending and the socket is re-registered
//! WRITABLE until the reply goes out; no further request is read meanwhile.
//!
//! At most `MAX_REQUESTS_PER_WAKEUP` requests are handled before returning
//! to poll, so a steady stream of datagrams cannot hide the waker. Requests
//! left queued are picked up after a zero-timeout poll.

use crate::dispatcher::RequestDispatcher;
use crate::protocol::BUFFER_SIZE;
use crate::runtime::{bind_udp, ServerState};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

const EVENTS_CAPACITY: usize = 64;
const MAX_REQUESTS_PER_WAKEUP: usize = 64;

/// Why `drive` handed control back to the event loop
#[derive(Debug, PartialEq, Eq)]
enum Progress {
    /// The socket would block; wait for the next readiness event
    Blocked,
    /// The request budget ran out with datagrams possibly still queued
    Backlogged,
}

/// Single-socket mio server
pub struct MioServer {
    poll: Poll,
    socket: UdpSocket,
    waker: Arc<Waker>,
    interest: Interest,
    dispatcher: Arc<RequestDispatcher>,
}

impl MioServer {
    /// Bind the server socket and register it with a new poll instance
    pub fn bind(addr: SocketAddr, dispatcher: Arc<RequestDispatcher>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::from_std(bind_udp(addr)?);
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(address = %socket.local_addr()?, "Server listening");

        Ok(Self {
            poll,
            socket,
            waker,
            interest: Interest::READABLE,
            dispatcher,
        })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle that stops the event loop when woken
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Run the event loop until the waker fires
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut state = ServerState::Receiving;
        let mut backlogged = false;

        loop {
            // Readiness is edge-triggered; a backlog is not reported again
            let timeout = backlogged.then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut socket_ready = backlogged;
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if !state.is_receiving() {
                            debug!("Shutdown requested with a reply still pending");
                        }
                        info!("Shutdown requested, no longer receiving");
                        return Ok(());
                    }
                    SOCKET_TOKEN => socket_ready = true,
                    _ => {}
                }
            }

            if socket_ready {
                let (next, progress) = self.drive(state, &mut buf)?;
                state = next;
                backlogged = progress == Progress::Backlogged;
            }
        }
    }

    /// Advance the state machine until the socket would block or the
    /// request budget is spent
    fn drive(
        &mut self,
        mut state: ServerState,
        buf: &mut [u8],
    ) -> io::Result<(ServerState, Progress)> {
        let mut handled = 0;
        loop {
            state = match state {
                ServerState::Receiving if handled == MAX_REQUESTS_PER_WAKEUP => {
                    return Ok((ServerState::Receiving, Progress::Backlogged));
                }
                ServerState::Receiving => match self.socket.recv_from(buf) {
                    Ok((len, peer)) => {
                        handled += 1;
                        trace!(peer = %peer, len, "Received request");
                        ServerState::reply_to(peer, self.dispatcher.handle(&buf[..len]))
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok((ServerState::Receiving, Progress::Blocked));
                    }
                    Err(e) => {
                        handled += 1;
                        warn!(error = %e, "Received a request in error, ignored");
                        ServerState::Receiving
                    }
                },
                ServerState::Replying { peer, reply } => {
                    match self.socket.send_to(&reply, peer) {
                        Ok(sent) if sent == reply.len() => {
                            trace!(peer = %peer, sent, "Reply sent");
                        }
                        Ok(sent) => {
                            warn!(peer = %peer, sent, expected = reply.len(), "Reply truncated");
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.set_interest(Interest::WRITABLE)?;
                            return Ok((ServerState::Replying { peer, reply }, Progress::Blocked));
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to send reply");
                        }
                    }
                    self.set_interest(Interest::READABLE)?;
                    ServerState::Receiving
                }
            };
        }
    }

    fn set_interest(&mut self, interest: Interest) -> io::Result<()> {
        if self.interest != interest {
            self.poll
                .registry()
                .reregister(&mut self.socket, SOCKET_TOKEN, interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}
