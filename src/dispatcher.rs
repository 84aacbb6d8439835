//! Request dispatch.
//!
//! Turns a request datagram into a reply datagram: parse the command,
//! execute it against the counter store, and encode the outcome. Every
//! failure is converted into an `ERROR:` reply, so callers always get bytes
//! to send back.

use crate::protocol::{Command, ParseError, Parser, Response};
use crate::storage::{CounterStore, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Errors raised while deriving a single reply
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Stateless dispatcher bound to one counter store
pub struct RequestDispatcher {
    store: Arc<CounterStore>,
}

impl RequestDispatcher {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self { store }
    }

    /// Handle one request and produce the reply bytes
    pub fn handle(&self, request: &[u8]) -> Bytes {
        match self.dispatch(request) {
            Ok(count) => {
                debug!(count, "Command was successfully processed");
                Response::ok(count).freeze()
            }
            Err(e) => {
                error!(error = %e, "Command failed");
                Response::error(&e.to_string()).freeze()
            }
        }
    }

    fn dispatch(&self, request: &[u8]) -> Result<u64, DispatchError> {
        let command = Parser::parse(request)?;
        debug!(?command, "Received a command, dispatching");
        self.execute(command)
    }

    fn execute(&self, command: Command) -> Result<u64, DispatchError> {
        match command {
            Command::Get => Ok(self.store.increment_and_get()?),
        }
    }

    /// The store requests are dispatched to
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }
}
