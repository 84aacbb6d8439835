//! Query counter text protocol parser and response generator.
//!
//! One datagram carries one message, so there is no framing beyond an
//! optional trailing line feed on requests:
//!
//! ```text
//! Request:  GET[\n]
//! Response: OK: <count>\n
//! Response: ERROR: <message>\n
//! ```

use bytes::BytesMut;
use std::borrow::Cow;
use thiserror::Error;

/// Size of the datagram receive buffers on both sides
pub const BUFFER_SIZE: usize = 1024;

/// Literal request for the `Get` command
pub const GET_COMMAND: &str = "GET";

const OK_PREFIX: &str = "OK:";
const ERROR_PREFIX: &str = "ERROR:";

/// Parsed query counter command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Count this request and return the new total
    Get,
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unrecognized command: '{0}'")]
    UnknownCommand(String),
}

/// Parser for request datagrams
pub struct Parser;

impl Parser {
    /// Extract the command token from a request buffer.
    ///
    /// A single trailing `\n` is dropped. Nothing else is trimmed and the
    /// token is not case-folded.
    pub fn token(buffer: &[u8]) -> Cow<'_, str> {
        let line = buffer.strip_suffix(b"\n").unwrap_or(buffer);
        String::from_utf8_lossy(line)
    }

    /// Parse a command from the buffer
    pub fn parse(buffer: &[u8]) -> Result<Command, ParseError> {
        let token = Self::token(buffer);
        match token.as_ref() {
            GET_COMMAND => Ok(Command::Get),
            _ => Err(ParseError::UnknownCommand(token.into_owned())),
        }
    }
}

/// Response generator for the query counter protocol
pub struct Response;

impl Response {
    /// Generate an `OK:` response carrying the count
    pub fn ok(count: u64) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("{} {}\n", OK_PREFIX, count).as_bytes());
        response
    }

    /// Generate an `ERROR:` response
    pub fn error(msg: &str) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("{} {}\n", ERROR_PREFIX, msg).as_bytes());
        response
    }
}

/// Reply as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The server counted the request
    Count(u64),
    /// The server reported an error
    Error(String),
}

/// Reply decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("Could not parse the server's response (invalid or corrupt): {0:?}")]
    Malformed(String),
}

impl Reply {
    /// Decode a reply datagram.
    ///
    /// Whitespace around the payload is ignored; the prefixes must match
    /// exactly.
    pub fn parse(buffer: &[u8]) -> Result<Self, ReplyError> {
        let text = String::from_utf8_lossy(buffer);

        if let Some(count) = text.strip_prefix(OK_PREFIX) {
            count
                .trim()
                .parse::<u64>()
                .map(Reply::Count)
                .map_err(|_| ReplyError::Malformed(text.to_string()))
        } else if let Some(msg) = text.strip_prefix(ERROR_PREFIX) {
            Ok(Reply::Error(msg.trim().to_string()))
        } else {
            Err(ReplyError::Malformed(text.to_string()))
        }
    }
}
