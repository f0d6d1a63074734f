use thiserror::Error;

use super::OpCode;

/// Everything that can go wrong while turning bytes into frames or frames
/// into bytes. A protocol error leaves the channel that produced it suspect.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame declares {declared} bytes but {actual} are available")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame of {0} bytes is smaller than the message header")]
    FrameTooSmall(usize),

    #[error("frame of {0} bytes exceeds the maximum message size")]
    FrameTooLarge(usize),

    #[error("unrecognized opcode {0}")]
    UnknownOpCode(i32),

    #[error("unexpected opcode {found:?}, wanted {expected}")]
    UnexpectedOpCode { found: OpCode, expected: &'static str },

    #[error("reply announces {declared} documents but carries {actual}")]
    DocumentCount { declared: i32, actual: usize },

    #[error("{0} bytes left over after decoding the frame body")]
    TrailingBytes(usize),

    #[error("collection name is not a terminated utf-8 string")]
    MissingCString,

    #[error("reply answers request {found}, expected {expected}")]
    ResponseMismatch { expected: i32, found: i32 },

    #[error("failed to encode integers: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode integers: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] bson::ser::Error),

    #[error("failed to deserialize document: {0}")]
    Deserialize(#[from] bson::de::Error),
}
