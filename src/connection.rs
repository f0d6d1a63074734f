//! Persistent request/reply channel to one server.
//!
//! The wire protocol is strictly sequential: a frame's bytes must never interleave with
//! another frame's, and a reply is only meaningful to the caller whose request it answers.
//! [`Connection`] enforces both by performing every write and every read-for-my-reply
//! while holding one mutex. Concurrent callers queue behind it; there is at most one
//! exchange in flight.
//!
//! # Call shapes
//!
//! - [`Connection::send`]: Insert, Update, Delete and KillCursors. Returns once the frame
//!   is written.
//! - [`Connection::call`]: Query and GetMore. Blocks until the matching reply arrives or
//!   the reply timeout passes.
//! - [`Connection::send_and_call`]: a write immediately followed by a query, with no
//!   other caller's frames in between. Used for acknowledged writes.
//!
//! # Failure
//!
//! A timeout, a reply answering some other request, a malformed frame or an I/O error
//! leaves bytes of unknown provenance on the socket. The channel then refuses every call
//! with [`Error::Broken`] until [`Connection::reset`] opens a fresh socket.
use std::{
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicI32, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    ClientConfig, Error,
    protocol::{ProtocolError, ProtocolTransport, Reply, Request, TransportError, WireMessage},
};

struct Channel {
    transport: ProtocolTransport<TcpStream>,
    broken: Option<String>,
}

impl Channel {
    fn usable(&self) -> Result<(), Error> {
        match &self.broken {
            Some(reason) => Err(Error::Broken(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: TransportError) -> Error {
        warn!("channel marked broken: {e}");
        self.broken = Some(e.to_string());
        e.into()
    }

    fn shutdown(&self) {
        if let Err(e) = self.transport.get_ref().shutdown(Shutdown::Both) {
            debug!("shutdown of old socket failed: {e}");
        }
    }
}

pub struct Connection {
    address: SocketAddr,
    connect_timeout: Duration,
    reply_timeout: Option<Duration>,
    channel: Mutex<Channel>,
    next_request_id: AtomicI32,
}

fn open_stream(
    address: SocketAddr,
    connect_timeout: Duration,
    reply_timeout: Option<Duration>,
) -> Result<TcpStream, Error> {
    let stream = TcpStream::connect_timeout(&address, connect_timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(reply_timeout)?;
    stream.set_write_timeout(reply_timeout)?;
    Ok(stream)
}

fn one_way(request: &Request) -> Result<(), Error> {
    if request.expects_reply() {
        return Err(Error::InvalidRequest(format!(
            "{:?} expects a reply",
            request.op_code()
        )));
    }
    Ok(())
}

fn two_way(request: &Request) -> Result<(), Error> {
    if !request.expects_reply() {
        return Err(Error::InvalidRequest(format!(
            "{:?} has no reply",
            request.op_code()
        )));
    }
    Ok(())
}

impl Connection {
    pub fn connect(config: &ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        Self::open(
            config.address,
            config.connect_timeout(),
            config.reply_timeout(),
        )
    }

    pub fn open(
        address: SocketAddr,
        connect_timeout: Duration,
        reply_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        if reply_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("reply timeout must be positive".into()));
        }

        let stream = open_stream(address, connect_timeout, reply_timeout)?;
        debug!("connected to {address}");

        Ok(Self {
            address,
            connect_timeout,
            reply_timeout,
            channel: Mutex::new(Channel {
                transport: ProtocolTransport::new(stream),
                broken: None,
            }),
            next_request_id: AtomicI32::new(1),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout
    }

    /// False once a failure left the channel unsynchronized.
    pub fn is_usable(&self) -> bool {
        self.lock().is_ok_and(|channel| channel.broken.is_none())
    }

    /// Writes a request that the server does not answer.
    pub fn send(&self, request: Request) -> Result<i32, Error> {
        one_way(&request)?;

        let mut channel = self.lock()?;
        channel.usable()?;
        self.write(&mut channel, request)
    }

    /// Writes a request and blocks for the reply that answers it.
    pub fn call(&self, request: Request) -> Result<Reply, Error> {
        two_way(&request)?;

        let mut channel = self.lock()?;
        channel.usable()?;
        self.round_trip(&mut channel, request)
    }

    /// Writes `write` and then performs `query` without letting another
    /// caller in between, so the query observes exactly that write.
    pub fn send_and_call(&self, write: Request, query: Request) -> Result<Reply, Error> {
        one_way(&write)?;
        two_way(&query)?;

        let mut channel = self.lock()?;
        channel.usable()?;
        self.write(&mut channel, write)?;
        self.round_trip(&mut channel, query)
    }

    fn write(&self, channel: &mut Channel, request: Request) -> Result<i32, Error> {
        let message = WireMessage::new(self.next_request_id(), request);
        let frame = message.encode()?;

        trace!(
            "sending {:?} request {}",
            message.op_code(),
            message.request_id
        );
        if let Err(e) = channel.transport.write_frame(&frame) {
            return Err(self.failed(channel, message.request_id, e));
        }
        Ok(message.request_id)
    }

    fn round_trip(&self, channel: &mut Channel, request: Request) -> Result<Reply, Error> {
        let started = Instant::now();
        let op = request.op_code();
        let request_id = self.write(channel, request)?;

        // The whole reply must arrive by the deadline, not just each read.
        let read = match self.reply_timeout {
            Some(timeout) => channel.transport.read_reply_by(started + timeout),
            None => channel.transport.read_reply(),
        };
        let reply = match read {
            Ok(reply) => reply,
            Err(e) => return Err(self.failed(channel, request_id, e)),
        };

        if reply.response_to != request_id {
            let e = ProtocolError::ResponseMismatch {
                expected: request_id,
                found: reply.response_to,
            };
            return Err(channel.fail(e.into()));
        }

        trace!(
            "{op:?} request {request_id} answered in {:?}",
            started.elapsed()
        );
        Ok(reply)
    }

    /// Drops the current socket and connects again. Clears a broken state.
    pub fn reset(&self) -> Result<(), Error> {
        let stream = open_stream(self.address, self.connect_timeout, self.reply_timeout)?;

        self.channel.clear_poison();
        let mut channel = self.lock()?;
        channel.shutdown();
        channel.transport = ProtocolTransport::new(stream);
        channel.broken = None;
        debug!("channel to {} reset", self.address);
        Ok(())
    }

    /// Shuts the socket down. Later calls fail until [`Self::reset`].
    pub fn close(&self) {
        self.channel.clear_poison();
        if let Ok(mut channel) = self.lock() {
            channel.shutdown();
            channel.broken = Some("connection closed".into());
        }
    }

    /// Ids stay positive: after `i32::MAX` the counter wraps to 1.
    fn next_request_id(&self) -> i32 {
        self.next_request_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Channel>, Error> {
        self.channel
            .lock()
            .map_err(|_| Error::Broken("channel lock poisoned".into()))
    }

    fn failed(&self, channel: &mut Channel, request_id: i32, e: TransportError) -> Error {
        if e.is_timeout() {
            let timeout = self.reply_timeout.unwrap_or_default();
            warn!("request {request_id} timed out after {timeout:?}; channel needs a reset");
            channel.broken = Some(format!("request {request_id} timed out"));
            return Error::Timeout {
                request_id,
                timeout,
            };
        }
        channel.fail(e)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(channel) = self.channel.get_mut() {
            channel.shutdown();
        }
    }
}
