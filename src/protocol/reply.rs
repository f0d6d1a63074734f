use bincode::{Decode, Encode};
use bson::Document;

use super::{
    OpCode, ProtocolError,
    header::{FrameReader, FrameWriter, split_frame},
};

/// Response flag bits as sent by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags(pub i32);

impl ReplyFlags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;

    pub fn cursor_not_found(&self) -> bool {
        self.0 & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn query_failure(&self) -> bool {
        self.0 & Self::QUERY_FAILURE != 0
    }

    pub fn shard_config_stale(&self) -> bool {
        self.0 & Self::SHARD_CONFIG_STALE != 0
    }

    pub fn await_capable(&self) -> bool {
        self.0 & Self::AWAIT_CAPABLE != 0
    }
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct ReplyPrologue {
    flags: i32,
    cursor_id: i64,
    starting_from: i32,
    number_returned: i32,
}

/// A decoded server reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Builds a reply answering `response_to`.
    pub fn to(response_to: i32, documents: Vec<Document>) -> Self {
        Self {
            response_to,
            documents,
            ..Default::default()
        }
    }

    pub fn with_cursor(mut self, cursor_id: i64, starting_from: i32) -> Self {
        self.cursor_id = cursor_id;
        self.starting_from = starting_from;
        self
    }

    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags = ReplyFlags(self.flags.0 | flags);
        self
    }

    /// The `$err` text a failed query carries in its single document.
    pub fn error_message(&self) -> Option<String> {
        self.documents
            .first()
            .and_then(|doc| doc.get_str("$err").ok())
            .map(str::to_string)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = FrameWriter::new();
        w.put(ReplyPrologue {
            flags: self.flags.0,
            cursor_id: self.cursor_id,
            starting_from: self.starting_from,
            number_returned: self.documents.len() as i32,
        })?;
        for doc in &self.documents {
            w.put_document(doc)?;
        }
        w.finish(self.request_id, self.response_to, OpCode::Reply)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, op, body) = split_frame(bytes)?;
        if op != OpCode::Reply {
            return Err(ProtocolError::UnexpectedOpCode {
                found: op,
                expected: "Reply",
            });
        }

        let mut r = FrameReader::new(body);
        let prologue: ReplyPrologue = r.get()?;
        if prologue.number_returned < 0 {
            return Err(ProtocolError::DocumentCount {
                declared: prologue.number_returned,
                actual: 0,
            });
        }

        let mut documents = Vec::with_capacity(prologue.number_returned.min(1024) as usize);
        while documents.len() < prologue.number_returned as usize {
            if r.remaining() == 0 {
                return Err(ProtocolError::DocumentCount {
                    declared: prologue.number_returned,
                    actual: documents.len(),
                });
            }
            documents.push(r.get_document()?);
        }
        r.finish()?;

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags: ReplyFlags(prologue.flags),
            cursor_id: prologue.cursor_id,
            starting_from: prologue.starting_from,
            documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::protocol::{Request, WireMessage};

    #[test]
    fn reply_answers_the_decoded_request() {
        let msg = WireMessage::new(
            77,
            Request::Query {
                collection: "shop.orders".into(),
                flags: 0,
                skip: 0,
                number_to_return: 2,
                query: doc! {},
                fields: None,
            },
        );

        let received = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        let reply = Reply::to(received.request_id, vec![doc! { "_id": 1 }, doc! { "_id": 2 }])
            .with_cursor(99, 0);
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();

        assert_eq!(decoded.response_to, 77);
        assert_eq!(decoded.cursor_id, 99);
        assert_eq!(decoded.documents.len(), 2);
    }

    #[test]
    fn flags_are_read_bitwise() {
        let reply = Reply::to(1, vec![]).with_flags(ReplyFlags::CURSOR_NOT_FOUND);
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();

        assert!(decoded.flags.cursor_not_found());
        assert!(!decoded.flags.query_failure());
    }

    #[test]
    fn query_failure_message() {
        let reply = Reply::to(1, vec![doc! { "$err": "bad operator" }])
            .with_flags(ReplyFlags::QUERY_FAILURE);

        assert!(reply.flags.query_failure());
        assert_eq!(reply.error_message().as_deref(), Some("bad operator"));
    }

    #[test]
    fn truncated_reply_fails() {
        let reply = Reply::to(4, vec![doc! { "a": 1 }]);
        let frame = reply.encode().unwrap();

        assert!(matches!(
            Reply::decode(&frame[..frame.len() - 1]),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn document_count_must_match_body() {
        let mut frame = Reply::to(4, vec![doc! { "a": 1 }]).encode().unwrap();
        // number_returned sits after flags, cursor id and starting_from
        frame[32..36].copy_from_slice(&2_i32.to_le_bytes());

        assert!(matches!(
            Reply::decode(&frame),
            Err(ProtocolError::DocumentCount {
                declared: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn request_frame_is_not_a_reply() {
        let frame = WireMessage::new(1, Request::KillCursors { cursor_ids: vec![] })
            .encode()
            .unwrap();

        assert!(matches!(
            Reply::decode(&frame),
            Err(ProtocolError::UnexpectedOpCode { .. })
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = Reply::to(4, vec![]).encode().unwrap();
        frame[12..16].copy_from_slice(&2013_i32.to_le_bytes());

        assert!(matches!(
            Reply::decode(&frame),
            Err(ProtocolError::UnknownOpCode(2013))
        ));
    }
}
