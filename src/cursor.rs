//! Lazy, forward-only iteration over a server-side result set.
//!
//! A [`Cursor`] starts from the reply to a query: the first batch of documents plus a
//! server cursor id (0 when the server already sent everything). Documents are handed
//! out one at a time; when the local batch runs dry the cursor asks the server for the
//! next one with a GetMore frame.
//!
//! Dropping a cursor that may still hold server resources sends a best-effort
//! KillCursors frame, so the server cursor is released on every exit path: natural
//! exhaustion, an early `break`, a `?` that propagates out of the consuming loop, or a
//! panic unwinding through it.
use std::collections::VecDeque;

use bson::Document;
use log::{debug, warn};

use crate::{
    Connection, Error,
    protocol::{Reply, Request},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// More documents may follow, locally buffered or on the server.
    Open,
    /// Everything was read; nothing is left to release.
    Exhausted,
    /// Released explicitly, by drop, or after the server lost the cursor.
    Closed,
}

pub struct Cursor<'c> {
    connection: &'c Connection,
    collection: String,
    cursor_id: i64,
    batch_size: i32,
    batch: VecDeque<Document>,
    state: CursorState,
}

impl<'c> Cursor<'c> {
    /// Wraps the reply to a query sent for `collection` (fully qualified).
    pub fn from_reply(
        connection: &'c Connection,
        collection: impl Into<String>,
        batch_size: i32,
        reply: Reply,
    ) -> Result<Self, Error> {
        if reply.flags.query_failure() {
            return Err(Error::QueryFailure(
                reply
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(Self {
            connection,
            collection: collection.into(),
            cursor_id: reply.cursor_id,
            batch_size,
            batch: reply.documents.into(),
            state: CursorState::Open,
        })
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Server handle; 0 once the server has nothing more to send.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Documents already received but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    pub fn next_document(&mut self) -> Result<Option<Document>, Error> {
        if self.state != CursorState::Open {
            return Ok(None);
        }

        if let Some(doc) = self.batch.pop_front() {
            return Ok(Some(doc));
        }

        if self.cursor_id == 0 {
            self.state = CursorState::Exhausted;
            return Ok(None);
        }

        self.fetch_more()?;
        match self.batch.pop_front() {
            Some(doc) => Ok(Some(doc)),
            None => {
                debug!(
                    "cursor {} on {} returned an empty batch",
                    self.cursor_id, self.collection
                );
                self.cursor_id = 0;
                self.state = CursorState::Exhausted;
                Ok(None)
            }
        }
    }

    /// Releases the server cursor now instead of at drop.
    pub fn close(mut self) {
        self.release();
    }

    fn fetch_more(&mut self) -> Result<(), Error> {
        let request = Request::GetMore {
            collection: self.collection.clone(),
            number_to_return: self.batch_size,
            cursor_id: self.cursor_id,
        };

        let reply = match self.connection.call(request) {
            Ok(reply) => reply,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        if reply.flags.cursor_not_found() {
            let cursor_id = self.cursor_id;
            self.cursor_id = 0;
            self.state = CursorState::Closed;
            return Err(Error::StaleCursor { cursor_id });
        }

        if reply.flags.query_failure() {
            self.release();
            return Err(Error::QueryFailure(
                reply
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        self.cursor_id = reply.cursor_id;
        self.batch.extend(reply.documents);
        Ok(())
    }

    fn release(&mut self) {
        if self.state == CursorState::Open && self.cursor_id != 0 {
            let cursor_id = self.cursor_id;
            let request = Request::KillCursors {
                cursor_ids: vec![cursor_id],
            };
            match self.connection.send(request) {
                Ok(_) => debug!("killed cursor {cursor_id} on {}", self.collection),
                Err(e) => warn!("failed to kill cursor {cursor_id}: {e}"),
            }
        }

        self.cursor_id = 0;
        self.batch.clear();
        if self.state == CursorState::Open {
            self.state = CursorState::Closed;
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Document, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::{
        protocol::{OpCode, ReplyFlags, WireMessage},
        testing,
    };

    fn docs(range: std::ops::Range<i32>) -> Vec<Document> {
        range.map(|i| doc! { "_id": i }).collect()
    }

    fn query(connection: &Connection, batch_size: i32) -> Cursor<'_> {
        let reply = connection
            .call(Request::Query {
                collection: "shop.orders".into(),
                flags: 0,
                skip: 0,
                number_to_return: batch_size,
                query: doc! {},
                fields: None,
            })
            .unwrap();
        Cursor::from_reply(connection, "shop.orders", batch_size, reply).unwrap()
    }

    fn seed(connection: &Connection, count: i32) {
        connection
            .send(Request::Insert {
                collection: "shop.orders".into(),
                documents: docs(0..count),
                continue_on_error: false,
            })
            .unwrap();
    }

    fn kills(messages: &[WireMessage]) -> Vec<Vec<i64>> {
        messages
            .iter()
            .filter_map(|m| match &m.request {
                Request::KillCursors { cursor_ids } => Some(cursor_ids.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn iterates_across_batches() {
        let (address, observer) = testing::document_server();
        let connection = testing::connect(address);
        seed(&connection, 7);

        let mut cursor = query(&connection, 3);
        assert_ne!(cursor.cursor_id(), 0);

        let ids: Vec<i32> = cursor
            .by_ref()
            .map(|d| d.unwrap().get_i32("_id").unwrap())
            .collect();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert_eq!(observer.op_count(OpCode::GetMore), 2);

        drop(cursor);
        assert!(observer.killed_cursors().is_empty());
    }

    #[test]
    fn exhausted_cursor_stays_terminated() {
        let (address, _) = testing::document_server();
        let connection = testing::connect(address);
        seed(&connection, 2);

        let mut cursor = query(&connection, 0);
        assert_eq!(cursor.cursor_id(), 0);
        assert_eq!(cursor.by_ref().count(), 2);
        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[test]
    fn empty_get_more_ends_without_kill() {
        let (address, rx) = testing::scripted(|m| match &m.request {
            Request::Query { .. } => {
                Some(Reply::to(m.request_id, docs(0..2)).with_cursor(55, 0))
            }
            Request::GetMore { .. } => Some(Reply::to(m.request_id, vec![]).with_cursor(55, 2)),
            _ => None,
        });
        let connection = testing::connect(address);

        let mut cursor = query(&connection, 2);
        assert_eq!(cursor.by_ref().count(), 2);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        drop(cursor);

        // a round-trip guarantees anything sent before it was received
        connection
            .call(Request::GetMore {
                collection: "shop.orders".into(),
                number_to_return: 0,
                cursor_id: 1,
            })
            .unwrap();
        let received: Vec<WireMessage> = rx.try_iter().collect();
        assert!(kills(&received).is_empty());
    }

    #[test]
    fn abandoned_cursor_kills_exactly_once() {
        let (address, observer) = testing::document_server();
        let connection = testing::connect(address);
        seed(&connection, 10);

        let mut cursor = query(&connection, 4);
        let cursor_id = cursor.cursor_id();
        cursor.next().unwrap().unwrap();
        cursor.next().unwrap().unwrap();
        assert_eq!(cursor.buffered(), 2);
        drop(cursor);

        connection
            .call(Request::Query {
                collection: "shop.$cmd".into(),
                flags: 0,
                skip: 0,
                number_to_return: -1,
                query: doc! { "ping": 1 },
                fields: None,
            })
            .unwrap();
        assert_eq!(observer.killed_cursors(), vec![cursor_id]);
        assert_eq!(observer.open_cursors(), 0);
    }

    #[test]
    fn early_exit_from_loop_releases_cursor() {
        let (address, observer) = testing::document_server();
        let connection = testing::connect(address);
        seed(&connection, 10);

        let find_three = || -> Result<Option<Document>, Error> {
            for doc in query(&connection, 4) {
                let doc = doc?;
                if doc.get_i32("_id").unwrap_or_default() == 3 {
                    return Ok(Some(doc));
                }
            }
            Ok(None)
        };
        assert!(find_three().unwrap().is_some());

        let mut cursor = query(&connection, 0);
        cursor.next();
        cursor.close();
        assert_eq!(observer.killed_cursors().len(), 1);
    }

    #[test]
    fn lost_server_cursor_is_stale() {
        let (address, observer) = testing::document_server();
        let connection = testing::connect(address);
        seed(&connection, 6);

        let mut cursor = query(&connection, 2);
        assert_eq!(cursor.by_ref().take(2).count(), 2);
        observer.forget_cursors();

        match cursor.next() {
            Some(Err(Error::StaleCursor { cursor_id })) => assert_ne!(cursor_id, 0),
            other => panic!("expected stale cursor, got {other:?}"),
        }
        assert_eq!(cursor.state(), CursorState::Closed);
        assert!(cursor.next().is_none());
        drop(cursor);
        assert!(observer.killed_cursors().is_empty());
    }

    #[test]
    fn failed_query_surfaces_server_message() {
        let (address, _) = testing::scripted(|m| {
            Some(
                Reply::to(m.request_id, vec![doc! { "$err": "bad operator" }])
                    .with_flags(ReplyFlags::QUERY_FAILURE),
            )
        });
        let connection = testing::connect(address);
        let reply = connection
            .call(Request::Query {
                collection: "shop.orders".into(),
                flags: 0,
                skip: 0,
                number_to_return: 0,
                query: doc! { "$where": "1" },
                fields: None,
            })
            .unwrap();

        match Cursor::from_reply(&connection, "shop.orders", 0, reply) {
            Err(Error::QueryFailure(message)) => assert_eq!(message, "bad operator"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("query should fail"),
        }
    }

    #[test]
    fn kill_failure_is_not_propagated() {
        let (address, _) = testing::scripted(|m| match &m.request {
            Request::Query { .. } => {
                Some(Reply::to(m.request_id, docs(0..3)).with_cursor(8, 0))
            }
            _ => None,
        });
        let connection = testing::connect(address);

        let mut cursor = query(&connection, 3);
        cursor.next().unwrap().unwrap();
        connection.close();
        // KillCursors fails on the closed channel; drop must still succeed
        drop(cursor);
        assert!(!connection.is_usable());
    }
}
