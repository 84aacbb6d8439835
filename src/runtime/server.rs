//! Tokio UDP server.
//!
//! Receives request datagrams, hands them to the dispatcher, and sends the
//! reply back to the sender before receiving again.

use crate::dispatcher::RequestDispatcher;
use crate::protocol::BUFFER_SIZE;
use crate::runtime::{bind_udp, ServerState};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

/// Server instance
pub struct DatagramServer {
    socket: UdpSocket,
    dispatcher: Arc<RequestDispatcher>,
}

impl DatagramServer {
    /// Bind the server socket
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<RequestDispatcher>) -> io::Result<Self> {
        let socket = UdpSocket::from_std(bind_udp(addr)?)?;
        info!(address = %socket.local_addr()?, "Server listening");

        Ok(Self { socket, dispatcher })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until `shutdown` completes.
    ///
    /// Shutdown is only observed while waiting for a request; a reply that
    /// is already being sent completes first.
    pub async fn run_until<F: Future>(&self, shutdown: F) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut state = ServerState::Receiving;
        tokio::pin!(shutdown);

        loop {
            state = match state {
                ServerState::Receiving => {
                    let received = tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested, no longer receiving");
                            return;
                        }
                        received = self.socket.recv_from(&mut buf) => received,
                    };

                    match received {
                        Ok((len, peer)) => {
                            trace!(peer = %peer, len, "Received request");
                            ServerState::reply_to(peer, self.dispatcher.handle(&buf[..len]))
                        }
                        Err(e) => {
                            warn!(error = %e, "Received a request in error, ignored");
                            ServerState::Receiving
                        }
                    }
                }
                ServerState::Replying { peer, reply } => {
                    self.send_reply(peer, &reply).await;
                    ServerState::Receiving
                }
            };
        }
    }

    async fn send_reply(&self, peer: SocketAddr, reply: &[u8]) {
        match self.socket.send_to(reply, peer).await {
            Ok(sent) if sent == reply.len() => trace!(peer = %peer, sent, "Reply sent"),
            Ok(sent) => warn!(peer = %peer, sent, expected = reply.len(), "Reply truncated"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to send reply"),
        }
    }
}
