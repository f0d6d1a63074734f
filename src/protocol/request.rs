use bson::Document;

use super::{
    OpCode, ProtocolError,
    header::{FrameReader, FrameWriter, split_frame},
};

pub const UPDATE_UPSERT: i32 = 1;
pub const UPDATE_MULTI: i32 = 1 << 1;
pub const INSERT_CONTINUE_ON_ERROR: i32 = 1;
pub const DELETE_SINGLE_REMOVE: i32 = 1;

/// Body of an outbound operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Insert {
        collection: String,
        documents: Vec<Document>,
        continue_on_error: bool,
    },
    Update {
        collection: String,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    },
    Delete {
        collection: String,
        selector: Document,
        single: bool,
    },
    Query {
        collection: String,
        flags: i32,
        skip: i32,
        number_to_return: i32,
        query: Document,
        fields: Option<Document>,
    },
    GetMore {
        collection: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Insert { .. } => OpCode::Insert,
            Request::Update { .. } => OpCode::Update,
            Request::Delete { .. } => OpCode::Delete,
            Request::Query { .. } => OpCode::Query,
            Request::GetMore { .. } => OpCode::GetMore,
            Request::KillCursors { .. } => OpCode::KillCursors,
        }
    }

    /// Whether the server answers this operation with a reply frame.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query { .. } | Request::GetMore { .. })
    }

    /// Fully qualified `<db>.<collection>` target, if the operation has one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Request::Insert { collection, .. }
            | Request::Update { collection, .. }
            | Request::Delete { collection, .. }
            | Request::Query { collection, .. }
            | Request::GetMore { collection, .. } => Some(collection),
            Request::KillCursors { .. } => None,
        }
    }

    fn encode_body(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
        match self {
            Request::Insert {
                collection,
                documents,
                continue_on_error,
            } => {
                let flags = if *continue_on_error {
                    INSERT_CONTINUE_ON_ERROR
                } else {
                    0
                };
                w.put(flags)?;
                w.put_cstring(collection)?;
                for doc in documents {
                    w.put_document(doc)?;
                }
            }
            Request::Update {
                collection,
                selector,
                update,
                upsert,
                multi,
            } => {
                let mut flags = 0;
                if *upsert {
                    flags |= UPDATE_UPSERT;
                }
                if *multi {
                    flags |= UPDATE_MULTI;
                }
                w.put(0_i32)?;
                w.put_cstring(collection)?;
                w.put(flags)?;
                w.put_document(selector)?;
                w.put_document(update)?;
            }
            Request::Delete {
                collection,
                selector,
                single,
            } => {
                w.put(0_i32)?;
                w.put_cstring(collection)?;
                w.put(if *single { DELETE_SINGLE_REMOVE } else { 0 })?;
                w.put_document(selector)?;
            }
            Request::Query {
                collection,
                flags,
                skip,
                number_to_return,
                query,
                fields,
            } => {
                w.put(*flags)?;
                w.put_cstring(collection)?;
                w.put(*skip)?;
                w.put(*number_to_return)?;
                w.put_document(query)?;
                if let Some(fields) = fields {
                    w.put_document(fields)?;
                }
            }
            Request::GetMore {
                collection,
                number_to_return,
                cursor_id,
            } => {
                w.put(0_i32)?;
                w.put_cstring(collection)?;
                w.put(*number_to_return)?;
                w.put(*cursor_id)?;
            }
            Request::KillCursors { cursor_ids } => {
                w.put(0_i32)?;
                w.put(cursor_ids.len() as i32)?;
                for id in cursor_ids {
                    w.put(*id)?;
                }
            }
        }
        Ok(())
    }

    fn decode_body(op: OpCode, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = FrameReader::new(body);

        let request = match op {
            OpCode::Insert => {
                let flags: i32 = r.get()?;
                let collection = r.get_cstring()?;
                let mut documents = Vec::new();
                while r.remaining() > 0 {
                    documents.push(r.get_document()?);
                }
                Request::Insert {
                    collection,
                    documents,
                    continue_on_error: flags & INSERT_CONTINUE_ON_ERROR != 0,
                }
            }
            OpCode::Update => {
                let _reserved: i32 = r.get()?;
                let collection = r.get_cstring()?;
                let flags: i32 = r.get()?;
                Request::Update {
                    collection,
                    selector: r.get_document()?,
                    update: r.get_document()?,
                    upsert: flags & UPDATE_UPSERT != 0,
                    multi: flags & UPDATE_MULTI != 0,
                }
            }
            OpCode::Delete => {
                let _reserved: i32 = r.get()?;
                let collection = r.get_cstring()?;
                let flags: i32 = r.get()?;
                Request::Delete {
                    collection,
                    selector: r.get_document()?,
                    single: flags & DELETE_SINGLE_REMOVE != 0,
                }
            }
            OpCode::Query => {
                let flags: i32 = r.get()?;
                let collection = r.get_cstring()?;
                let skip: i32 = r.get()?;
                let number_to_return: i32 = r.get()?;
                let query = r.get_document()?;
                let fields = if r.remaining() > 0 {
                    Some(r.get_document()?)
                } else {
                    None
                };
                Request::Query {
                    collection,
                    flags,
                    skip,
                    number_to_return,
                    query,
                    fields,
                }
            }
            OpCode::GetMore => {
                let _reserved: i32 = r.get()?;
                let collection = r.get_cstring()?;
                Request::GetMore {
                    collection,
                    number_to_return: r.get()?,
                    cursor_id: r.get()?,
                }
            }
            OpCode::KillCursors => {
                let _reserved: i32 = r.get()?;
                let count: i32 = r.get()?;
                let mut cursor_ids = Vec::with_capacity(count.clamp(0, 1024) as usize);
                for _ in 0..count {
                    cursor_ids.push(r.get()?);
                }
                Request::KillCursors { cursor_ids }
            }
            OpCode::Reply => {
                return Err(ProtocolError::UnexpectedOpCode {
                    found: op,
                    expected: "a request opcode",
                });
            }
        };

        r.finish()?;
        Ok(request)
    }
}

/// A request stamped with the id the channel assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub request_id: i32,
    pub request: Request,
}

impl WireMessage {
    pub fn new(request_id: i32, request: Request) -> Self {
        Self {
            request_id,
            request,
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.request.op_code()
    }

    /// Produces one complete frame; requests always carry `responseTo = 0`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut writer = FrameWriter::new();
        self.request.encode_body(&mut writer)?;
        writer.finish(self.request_id, 0, self.op_code())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, op, body) = split_frame(bytes)?;
        Ok(Self {
            request_id: header.request_id,
            request: Request::decode_body(op, body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn kill_cursors_body_layout() {
        let msg = WireMessage::new(
            9,
            Request::KillCursors {
                cursor_ids: vec![42, -7],
            },
        );
        let frame = msg.encode().unwrap();

        assert_eq!(frame.len(), 16 + 4 + 4 + 16);
        assert_eq!(&frame[12..16], &2007_i32.to_le_bytes());
        assert_eq!(&frame[16..20], &0_i32.to_le_bytes());
        assert_eq!(&frame[20..24], &2_i32.to_le_bytes());
        assert_eq!(&frame[24..32], &42_i64.to_le_bytes());
        assert_eq!(&frame[32..40], &(-7_i64).to_le_bytes());
    }

    #[test]
    fn query_frame_decodes_back() {
        let msg = WireMessage::new(
            11,
            Request::Query {
                collection: "shop.orders".into(),
                flags: 0,
                skip: 5,
                number_to_return: 20,
                query: doc! { "status": "open" },
                fields: Some(doc! { "total": 1 }),
            },
        );

        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn update_flags_survive_encoding() {
        let msg = WireMessage::new(
            1,
            Request::Update {
                collection: "shop.orders".into(),
                selector: doc! { "_id": 1 },
                update: doc! { "$set": { "paid": true } },
                upsert: true,
                multi: false,
            },
        );

        match WireMessage::decode(&msg.encode().unwrap()).unwrap().request {
            Request::Update { upsert, multi, .. } => {
                assert!(upsert);
                assert!(!multi);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn corrupted_length_is_rejected() {
        let msg = WireMessage::new(
            2,
            Request::Delete {
                collection: "shop.orders".into(),
                selector: doc! {},
                single: true,
            },
        );
        let mut frame = msg.encode().unwrap();
        let bogus = (frame.len() as i32 + 3).to_le_bytes();
        frame[..4].copy_from_slice(&bogus);

        assert!(matches!(
            WireMessage::decode(&frame),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn reply_expectation_by_opcode() {
        let get_more = Request::GetMore {
            collection: "a.b".into(),
            number_to_return: 0,
            cursor_id: 1,
        };
        let kill = Request::KillCursors { cursor_ids: vec![1] };

        assert!(get_more.expects_reply());
        assert!(!kill.expects_reply());
        assert_eq!(kill.collection(), None);
        assert_eq!(get_more.collection(), Some("a.b"));
    }
}
