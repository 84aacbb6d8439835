//! Server loop state machine.
//!
//! The server alternates strictly between two states and never holds more
//! than one request in flight.

use bytes::Bytes;
use std::net::SocketAddr;

/// Current state of the datagram server loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerState {
    /// Waiting for the next request datagram.
    Receiving,
    /// Sending the reply for the last request.
    Replying {
        /// Return address recorded on receive.
        peer: SocketAddr,
        /// Encoded reply.
        reply: Bytes,
    },
}

impl ServerState {
    /// Transition to replying with the dispatcher's output.
    pub(crate) fn reply_to(peer: SocketAddr, reply: Bytes) -> Self {
        ServerState::Replying { peer, reply }
    }

    /// Whether the loop is waiting for a request.
    pub(crate) fn is_receiving(&self) -> bool {
        matches!(self, ServerState::Receiving)
    }
}
