//! query-counter: a UDP query counter service
//!
//! The server counts `GET` requests received over UDP:
//! - Every request increments a counter persisted in a text file
//! - The new count is replied as `OK: <count>`
//! - Anything else is answered with `ERROR: <message>`
//!
//! A companion client polls the server on a fixed interval and logs the
//! returned count.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod storage;
