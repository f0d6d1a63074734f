use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::{ProtocolError, TransportError};

/// Error kinds surfaced to users of the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no reply to request {request_id} within {timeout:?}")]
    Timeout { request_id: i32, timeout: Duration },

    #[error("cursor {cursor_id} is no longer known to the server")]
    StaleCursor { cursor_id: i64 },

    #[error("failed to allocate an id block for '{collection}': {source}")]
    Allocation {
        collection: String,
        #[source]
        source: Box<Error>,
    },

    #[error("counter '{key}' is unusable: {reason}")]
    Counter { key: String, reason: String },

    #[error("query failed: {0}")]
    QueryFailure(String),

    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("duplicate key in '{collection}': {message}")]
    DuplicateKey { collection: String, message: String },

    #[error("connection is unusable until reset: {0}")]
    Broken(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::DuplicateKey { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Protocol(e) => Error::Protocol(e),
            TransportError::Io(e) => Error::Io(e),
        }
    }
}
