//! Wire protocol between docwire clients and a document database server.
//!
//! This module defines the binary frames exchanged over a connection, the codec that
//! turns operations into frames and frames back into replies, and a transport that moves
//! whole frames over any byte stream.
//!
//! # Binary Format
//!
//! Every frame starts with a fixed-size header:
//!
//! ```text
//! [int32 totalLength][int32 requestId][int32 responseTo][int32 opcode][body...]
//! ```
//!
//! - `totalLength` counts the header itself.
//! - `responseTo` is zero on requests and carries the answered `requestId` on replies.
//! - All integers are little-endian; documents are BSON; collection names are
//!   NUL-terminated strings.
//!
//! Decoding is strict: a frame whose declared length disagrees with the bytes read, whose
//! opcode is unknown, or whose body has leftover bytes is rejected with a
//! [`ProtocolError`].
//!
//! # Key Components
//!
//! - [`WireMessage`]: a [`Request`] stamped with its request id.
//! - [`Reply`]: a decoded server reply, including cursor handle and status flags.
//! - [`ProtocolTransport`]: frame-at-a-time reader/writer over a stream.
//! - [`DocumentServer`]: in-memory server speaking the same protocol.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): serializes requests from many threads onto one transport.
mod error;
mod header;
mod reply;
mod request;
mod server;
mod thread;
mod transport;

use thread::{ConnectionHandler, ConnectionWorkers};

pub use error::ProtocolError;
pub use header::{HEADER_SIZE, MAX_MESSAGE_SIZE, MessageHeader, OpCode};
pub use reply::{Reply, ReplyFlags};
pub use request::{Request, WireMessage};
pub use server::{DEFAULT_BACKLOG, DocumentServer, ServerObserver};
pub use transport::{ProtocolTransport, ReadTimeout, TransportError};
