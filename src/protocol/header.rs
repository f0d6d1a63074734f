use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_into_std_write,
};
use bson::Document;

use super::ProtocolError;

pub const HEADER_SIZE: usize = 16;
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

pub(crate) type WireConfig = Configuration<LittleEndian, Fixint>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Operation tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

impl From<OpCode> for i32 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }
}

/// Fixed 16 byte prologue of every frame. `message_length` counts the
/// header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

/// Checks the frame contract and splits a complete frame into its header,
/// opcode and body.
pub(crate) fn split_frame(bytes: &[u8]) -> Result<(MessageHeader, OpCode, &[u8]), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::FrameTooSmall(bytes.len()));
    }

    let (header, _): (MessageHeader, usize) = decode_from_slice(&bytes[..HEADER_SIZE], wire_config())?;
    let declared = usize::try_from(header.message_length)
        .map_err(|_| ProtocolError::FrameTooSmall(0))?;

    if declared < HEADER_SIZE {
        return Err(ProtocolError::FrameTooSmall(declared));
    }
    if declared > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge(declared));
    }
    if declared != bytes.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let op = OpCode::try_from(header.op_code)?;
    Ok((header, op, &bytes[HEADER_SIZE..]))
}

/// Accumulates a frame body and patches the header in once the final length
/// is known.
pub(crate) struct FrameWriter {
    buf: Vec<u8>,
    config: WireConfig,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: vec![0; HEADER_SIZE],
            config: wire_config(),
        }
    }

    pub fn put<E: Encode>(&mut self, value: E) -> Result<(), ProtocolError> {
        encode_into_std_write(value, &mut self.buf, self.config)?;
        Ok(())
    }

    pub fn put_cstring(&mut self, value: &str) -> Result<(), ProtocolError> {
        if value.as_bytes().contains(&0) {
            return Err(ProtocolError::MissingCString);
        }
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn put_document(&mut self, doc: &Document) -> Result<(), ProtocolError> {
        doc.to_writer(&mut self.buf)?;
        Ok(())
    }

    pub fn finish(
        mut self,
        request_id: i32,
        response_to: i32,
        op: OpCode,
    ) -> Result<Vec<u8>, ProtocolError> {
        let len = self.buf.len();
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let header = MessageHeader {
            message_length: len as i32,
            request_id,
            response_to,
            op_code: op.into(),
        };
        let mut prologue = Vec::with_capacity(HEADER_SIZE);
        encode_into_std_write(header, &mut prologue, self.config)?;
        self.buf[..HEADER_SIZE].copy_from_slice(&prologue);
        Ok(self.buf)
    }
}

/// Cursor over a frame body. Every read is bounds checked; nothing is ever
/// padded.
pub(crate) struct FrameReader<'a> {
    bytes: &'a [u8],
    config: WireConfig,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            config: wire_config(),
        }
    }

    pub fn get<D: Decode<()>>(&mut self) -> Result<D, ProtocolError> {
        let (value, read) = decode_from_slice(self.bytes, self.config)?;
        self.bytes = &self.bytes[read..];
        Ok(value)
    }

    pub fn get_cstring(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::MissingCString)?;
        let value = std::str::from_utf8(&self.bytes[..end])
            .map_err(|_| ProtocolError::MissingCString)?
            .to_string();
        self.bytes = &self.bytes[end + 1..];
        Ok(value)
    }

    pub fn get_document(&mut self) -> Result<Document, ProtocolError> {
        let mut rest = self.bytes;
        let doc = Document::from_reader(&mut rest)?;
        self.bytes = rest;
        Ok(doc)
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.bytes.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
