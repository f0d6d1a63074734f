use std::{
    io::{self, Read, Write},
    mem,
    net::TcpStream,
    time::{Duration, Instant},
};

use log::trace;
use thiserror::Error;

use super::{
    ProtocolError, Reply, WireMessage,
    header::{HEADER_SIZE, MAX_MESSAGE_SIZE},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when the underlying read gave up because its deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// A stream whose reads can be given a timeout, so a whole frame can be
/// read against one deadline.
pub trait ReadTimeout: Read {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Reads and writes whole frames on a byte stream. A frame is always written
/// with a single `write_all` so concurrent writers cannot interleave bytes as
/// long as they share one transport behind a lock.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_message(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let frame = message.encode()?;
        trace!(
            "writing {:?} request {} ({} bytes)",
            message.op_code(),
            message.request_id,
            frame.len()
        );
        self.write_frame(&frame)
    }

    pub fn write_reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let frame = reply.encode()?;
        self.write_frame(&frame)
    }

    pub fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let frame = self.read_frame()?;
        Ok(Reply::decode(&frame)?)
    }

    pub fn read_message(&mut self) -> Result<WireMessage, TransportError> {
        let frame = self.read_frame()?;
        Ok(WireMessage::decode(&frame)?)
    }

    /// Writes an already encoded frame in one piece.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        self.read_frame_with(|stream, buf| stream.read_exact(buf))
    }

    /// Reads exactly the number of bytes the length prefix declares, filling
    /// each part of the frame through `fill`.
    fn read_frame_with<F>(&mut self, mut fill: F) -> Result<Vec<u8>, TransportError>
    where
        F: FnMut(&mut T, &mut [u8]) -> io::Result<()>,
    {
        let mut prefix = [0_u8; 4];
        fill(&mut self.stream, &mut prefix)?;

        let declared = i32::from_le_bytes(prefix);
        let len = usize::try_from(declared).map_err(|_| ProtocolError::FrameTooSmall(0))?;
        if len < HEADER_SIZE {
            return Err(ProtocolError::FrameTooSmall(len).into());
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }

        let mut frame = vec![0_u8; len];
        frame[..4].copy_from_slice(&prefix);
        fill(&mut self.stream, &mut frame[4..])?;
        Ok(frame)
    }
}

impl<T: ReadTimeout + Write> ProtocolTransport<T> {
    /// Like [`Self::read_reply`], but gives up with [`io::ErrorKind::TimedOut`]
    /// once `deadline` passes, however the bytes trickle in.
    pub fn read_reply_by(&mut self, deadline: Instant) -> Result<Reply, TransportError> {
        let frame = self.read_frame_with(|stream, buf| read_exact_by(stream, buf, deadline))?;
        Ok(Reply::decode(&frame)?)
    }
}

fn read_exact_by<T: ReadTimeout>(
    stream: &mut T,
    mut buf: &mut [u8],
    deadline: Instant,
) -> io::Result<()> {
    while !buf.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "reply deadline passed",
            ));
        }

        stream.set_read_timeout(Some(remaining))?;
        match stream.read(buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => buf = &mut mem::take(&mut buf)[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
