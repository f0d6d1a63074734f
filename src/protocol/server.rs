use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use bson::{Bson, Document, doc, oid::ObjectId};
use log::{debug, info, warn};

use super::{
    ConnectionHandler, ConnectionWorkers, OpCode, ProtocolTransport, Reply, ReplyFlags, Request,
    TransportError,
};

const DEFAULT_BATCH_SIZE: usize = 101;
/// Accepted connections allowed to wait for a free worker.
pub const DEFAULT_BACKLOG: usize = 64;
const DUPLICATE_KEY: i32 = 11000;

/// In-memory document server speaking the wire protocol. It keeps every
/// collection in a vector behind one mutex and is meant for tests and local
/// experiments, not for production data.
pub struct DocumentServer {
    listener: TcpListener,
    store: Arc<Mutex<Store>>,
    workers: usize,
    backlog: usize,
    active: Arc<AtomicUsize>,
}

/// Read-only window into a running server's state.
#[derive(Clone)]
pub struct ServerObserver {
    store: Arc<Mutex<Store>>,
    active: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Store {
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, OpenCursor>,
    next_cursor_id: i64,
    ops: HashMap<OpCode, usize>,
    killed: Vec<i64>,
    malformed: usize,
}

struct OpenCursor {
    remaining: VecDeque<Document>,
    returned: i32,
}

/// Per-connection outcome of the last write, reported by `getlasterror`.
#[derive(Default)]
struct LastError {
    err: Option<(i32, String)>,
    n: i32,
}

fn lock(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DocumentServer {
    pub fn bind<A: ToSocketAddrs>(address: A, workers: usize) -> io::Result<Self> {
        if workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server needs at least one worker",
            ));
        }

        Ok(Self {
            listener: TcpListener::bind(address)?,
            store: Arc::new(Mutex::new(Store {
                next_cursor_id: 1,
                ..Default::default()
            })),
            workers,
            backlog: DEFAULT_BACKLOG,
            active: Arc::default(),
        })
    }

    /// Sets how many accepted connections may wait for a worker. Beyond that
    /// new connections are closed straight away. Zero means a connection is
    /// only taken when a worker is idle.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn observer(&self) -> ServerObserver {
        ServerObserver {
            store: Arc::clone(&self.store),
            active: Arc::clone(&self.active),
        }
    }

    pub fn listen(self) -> Result<(), TransportError> {
        let store = Arc::clone(&self.store);
        let handler: ConnectionHandler = Arc::new(move |stream: TcpStream| {
            if let Err(e) = handle_connection(stream, Arc::clone(&store)) {
                warn!("connection ended with error: {e}");
            }
        });
        let workers =
            ConnectionWorkers::spawn(self.workers, self.backlog, Arc::clone(&self.active), handler)?;

        info!(
            "listening at {} with {} workers and a backlog of {}",
            self.listener.local_addr()?,
            workers.size(),
            self.backlog
        );

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(stream) = workers.dispatch(stream) {
                        refuse(stream);
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }

    /// Runs [`Self::listen`] on a detached thread and returns the bound
    /// address.
    pub fn spawn(self) -> io::Result<SocketAddr> {
        let address = self.local_addr()?;
        thread::spawn(move || {
            if let Err(e) = self.listen() {
                warn!("server stopped: {e}");
            }
        });
        Ok(address)
    }
}

fn refuse(stream: TcpStream) {
    warn!(
        "workers busy and backlog full, refusing {:?}",
        stream.peer_addr()
    );
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("shutdown of refused connection failed: {e}");
    }
}

impl ServerObserver {
    /// Connections a worker is serving right now.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cursor ids received in KillCursors frames, in arrival order.
    pub fn killed_cursors(&self) -> Vec<i64> {
        lock(&self.store).killed.clone()
    }

    pub fn op_count(&self, op: OpCode) -> usize {
        lock(&self.store).ops.get(&op).copied().unwrap_or(0)
    }

    pub fn open_cursors(&self) -> usize {
        lock(&self.store).cursors.len()
    }

    pub fn malformed_frames(&self) -> usize {
        lock(&self.store).malformed
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.store)
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every open server cursor, as a server restart would.
    pub fn forget_cursors(&self) {
        lock(&self.store).cursors.clear();
    }
}

fn handle_connection(stream: TcpStream, store: Arc<Mutex<Store>>) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    let mut transport = ProtocolTransport::new(stream);
    let mut last_error = LastError::default();
    debug!("accepted connection from {peer}");

    loop {
        let message = match transport.read_message() {
            Ok(message) => message,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("connection from {peer} closed");
                return Ok(());
            }
            Err(e) => {
                if let TransportError::Protocol(_) = e {
                    lock(&store).malformed += 1;
                }
                return Err(e);
            }
        };

        let request_id = message.request_id;
        let mut guard = lock(&store);
        *guard.ops.entry(message.op_code()).or_default() += 1;

        let reply = match message.request {
            Request::Insert {
                collection,
                documents,
                continue_on_error,
            } => {
                last_error = guard.insert(&collection, documents, continue_on_error);
                None
            }
            Request::Update {
                collection,
                selector,
                update,
                upsert,
                multi,
            } => {
                last_error = guard.update(&collection, &selector, &update, upsert, multi);
                None
            }
            Request::Delete {
                collection,
                selector,
                single,
            } => {
                last_error = guard.delete(&collection, &selector, single);
                None
            }
            Request::KillCursors { cursor_ids } => {
                for id in cursor_ids {
                    guard.cursors.remove(&id);
                    guard.killed.push(id);
                }
                None
            }
            Request::Query {
                collection,
                skip,
                number_to_return,
                query,
                ..
            } => Some(match collection.strip_suffix(".$cmd") {
                Some(db) => {
                    Reply::to(request_id, vec![guard.command(db, &query, &last_error)])
                }
                None => guard.query(request_id, &collection, &query, skip, number_to_return),
            }),
            Request::GetMore {
                number_to_return,
                cursor_id,
                ..
            } => Some(guard.get_more(request_id, cursor_id, number_to_return)),
        };
        drop(guard);

        if let Some(reply) = reply {
            transport.write_reply(&reply)?;
        }
    }
}

impl Store {
    fn insert(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
        continue_on_error: bool,
    ) -> LastError {
        let docs = self.collections.entry(collection.to_string()).or_default();
        let mut outcome = LastError::default();

        for mut doc in documents {
            if !doc.contains_key("_id") {
                doc.insert("_id", ObjectId::new());
            }
            let id = doc.get("_id").cloned();
            if docs.iter().any(|d| d.get("_id") == id.as_ref()) {
                outcome.err = Some((
                    DUPLICATE_KEY,
                    format!("E11000 duplicate key error index: {collection}.$_id_"),
                ));
                if continue_on_error {
                    continue;
                }
                break;
            }
            docs.push(doc);
            outcome.n += 1;
        }
        outcome
    }

    fn update(
        &mut self,
        collection: &str,
        selector: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> LastError {
        let docs = self.collections.entry(collection.to_string()).or_default();
        let mut outcome = LastError::default();

        for doc in docs.iter_mut().filter(|d| matches(d, selector)) {
            if let Err(e) = apply_update(doc, update) {
                outcome.err = Some((0, e));
                return outcome;
            }
            outcome.n += 1;
            if !multi {
                break;
            }
        }

        if outcome.n == 0 && upsert {
            match upserted(selector, update) {
                Ok(doc) => {
                    docs.push(doc);
                    outcome.n = 1;
                }
                Err(e) => outcome.err = Some((0, e)),
            }
        }
        outcome
    }

    fn delete(&mut self, collection: &str, selector: &Document, single: bool) -> LastError {
        let mut outcome = LastError::default();
        if let Some(docs) = self.collections.get_mut(collection) {
            if single {
                if let Some(pos) = docs.iter().position(|d| matches(d, selector)) {
                    docs.remove(pos);
                    outcome.n = 1;
                }
            } else {
                let before = docs.len();
                docs.retain(|d| !matches(d, selector));
                outcome.n = (before - docs.len()) as i32;
            }
        }
        outcome
    }

    fn query(
        &mut self,
        request_id: i32,
        collection: &str,
        selector: &Document,
        skip: i32,
        number_to_return: i32,
    ) -> Reply {
        if let Some(op) = selector.keys().find(|k| k.starts_with('$')) {
            return Reply::to(
                request_id,
                vec![doc! { "$err": format!("unsupported operator {op}"), "code": 10068 }],
            )
            .with_flags(ReplyFlags::QUERY_FAILURE);
        }

        let mut found: VecDeque<Document> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, selector))
                    .skip(skip.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let single = number_to_return < 0 || number_to_return == 1;
        let batch = take_batch(&mut found, number_to_return);
        let returned = batch.len() as i32;

        if single || found.is_empty() {
            return Reply::to(request_id, batch);
        }

        let cursor_id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors.insert(
            cursor_id,
            OpenCursor {
                remaining: found,
                returned,
            },
        );
        Reply::to(request_id, batch).with_cursor(cursor_id, 0)
    }

    fn get_more(&mut self, request_id: i32, cursor_id: i64, number_to_return: i32) -> Reply {
        let Some(cursor) = self.cursors.get_mut(&cursor_id) else {
            return Reply::to(request_id, vec![]).with_flags(ReplyFlags::CURSOR_NOT_FOUND);
        };

        let starting_from = cursor.returned;
        let batch = take_batch(&mut cursor.remaining, number_to_return);
        cursor.returned += batch.len() as i32;

        if cursor.remaining.is_empty() {
            self.cursors.remove(&cursor_id);
            Reply::to(request_id, batch).with_cursor(0, starting_from)
        } else {
            Reply::to(request_id, batch).with_cursor(cursor_id, starting_from)
        }
    }

    fn command(&mut self, db: &str, command: &Document, last_error: &LastError) -> Document {
        let Some((name, value)) = command.iter().next() else {
            return doc! { "ok": 0.0, "errmsg": "empty command" };
        };

        match name.to_lowercase().as_str() {
            "ping" => doc! { "ok": 1.0 },
            "getlasterror" => {
                let mut reply = doc! { "n": last_error.n, "ok": 1.0 };
                match &last_error.err {
                    Some((code, message)) => {
                        reply.insert("err", message.clone());
                        reply.insert("code", *code);
                    }
                    None => {
                        reply.insert("err", Bson::Null);
                    }
                }
                reply
            }
            "count" => {
                let collection = format!("{db}.{}", value.as_str().unwrap_or_default());
                let selector = command.get_document("query").cloned().unwrap_or_default();
                let n = self
                    .collections
                    .get(&collection)
                    .map(|docs| docs.iter().filter(|d| matches(d, &selector)).count())
                    .unwrap_or(0);
                doc! { "n": n as i64, "ok": 1.0 }
            }
            "findandmodify" => {
                let collection = format!("{db}.{}", value.as_str().unwrap_or_default());
                self.find_and_modify(&collection, command)
            }
            other => doc! { "ok": 0.0, "errmsg": format!("no such cmd: {other}") },
        }
    }

    fn find_and_modify(&mut self, collection: &str, command: &Document) -> Document {
        let selector = command.get_document("query").cloned().unwrap_or_default();
        let update = command.get_document("update").cloned().unwrap_or_default();
        let return_new = command.get_bool("new").unwrap_or(false);
        let upsert = command.get_bool("upsert").unwrap_or(false);

        let docs = self.collections.entry(collection.to_string()).or_default();
        let value = match docs.iter().position(|d| matches(d, &selector)) {
            Some(pos) => {
                let doc = &mut docs[pos];
                let before = doc.clone();
                if let Err(e) = apply_update(doc, &update) {
                    return doc! { "ok": 0.0, "errmsg": e };
                }
                Bson::Document(if return_new { doc.clone() } else { before })
            }
            None if upsert => match upserted(&selector, &update) {
                Ok(doc) => {
                    docs.push(doc.clone());
                    if return_new {
                        Bson::Document(doc)
                    } else {
                        Bson::Null
                    }
                }
                Err(e) => return doc! { "ok": 0.0, "errmsg": e },
            },
            None => Bson::Null,
        };

        doc! { "value": value, "ok": 1.0 }
    }
}

fn take_batch(docs: &mut VecDeque<Document>, number_to_return: i32) -> Vec<Document> {
    let size = match number_to_return.unsigned_abs() as usize {
        0 => DEFAULT_BATCH_SIZE,
        n => n,
    };
    let size = size.min(docs.len());
    docs.drain(..size).collect()
}

fn matches(doc: &Document, selector: &Document) -> bool {
    selector
        .iter()
        .all(|(key, expected)| doc.get(key).is_some_and(|v| values_equal(v, expected)))
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn add(current: Option<&Bson>, delta: &Bson) -> Result<Bson, String> {
    let current = current.cloned().unwrap_or(Bson::Int32(0));
    match (&current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => Ok(a
            .checked_add(*b)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(*a as i64 + *b as i64))),
        (Bson::Int64(a), Bson::Int32(b)) => Ok(Bson::Int64(a + *b as i64)),
        (Bson::Int32(a), Bson::Int64(b)) => Ok(Bson::Int64(*a as i64 + b)),
        (Bson::Int64(a), Bson::Int64(b)) => Ok(Bson::Int64(a + b)),
        _ => match (as_f64(&current), as_f64(delta)) {
            (Some(a), Some(b)) => Ok(Bson::Double(a + b)),
            _ => Err(format!("cannot $inc a non-numeric value {current}")),
        },
    }
}

fn apply_update(doc: &mut Document, update: &Document) -> Result<(), String> {
    if !update.keys().any(|k| k.starts_with('$')) {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id", id);
        }
        return Ok(());
    }

    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| format!("modifier {op} expects a document"))?;
        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    doc.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    doc.remove(field);
                }
                "$inc" => {
                    let sum = add(doc.get(field), value)?;
                    doc.insert(field.clone(), sum);
                }
                other => return Err(format!("unknown modifier {other}")),
            }
        }
    }
    Ok(())
}

fn upserted(selector: &Document, update: &Document) -> Result<Document, String> {
    let mut doc = selector.clone();
    apply_update(&mut doc, update)?;
    if !doc.contains_key("_id") {
        doc.insert("_id", ObjectId::new());
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, testing};

    fn store() -> Store {
        Store {
            next_cursor_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn inc_preserves_integer_width() {
        let mut doc = doc! { "_id": "orders", "serverHi": 2_i64 };
        apply_update(&mut doc, &doc! { "$inc": { "serverHi": 1 } }).unwrap();
        assert_eq!(doc.get("serverHi"), Some(&Bson::Int64(3)));
    }

    #[test]
    fn duplicate_id_is_reported() {
        let mut store = store();
        let first = store.insert("db.c", vec![doc! { "_id": 1 }], false);
        let second = store.insert("db.c", vec![doc! { "_id": 1 }], false);

        assert!(first.err.is_none());
        assert_eq!(second.err.map(|(code, _)| code), Some(DUPLICATE_KEY));
    }

    #[test]
    fn find_and_modify_returns_pre_image() {
        let mut store = store();
        store.insert("db.keys", vec![doc! { "_id": "orders", "serverHi": 2_i64 }], false);

        let reply = store.command(
            "db",
            &doc! {
                "findandmodify": "keys",
                "query": { "_id": "orders" },
                "update": { "$inc": { "serverHi": 1 } },
            },
            &LastError::default(),
        );

        let value = reply.get_document("value").unwrap();
        assert_eq!(value.get_i64("serverHi").unwrap(), 2);
        assert_eq!(
            store.collections["db.keys"][0].get_i64("serverHi").unwrap(),
            3
        );
    }

    #[test]
    fn query_opens_cursor_when_more_remain() {
        let mut store = store();
        store.insert(
            "db.c",
            (0..5).map(|i| doc! { "_id": i }).collect(),
            false,
        );

        let reply = store.query(1, "db.c", &doc! {}, 0, 2);
        assert_eq!(reply.documents.len(), 2);
        assert_ne!(reply.cursor_id, 0);

        let more = store.get_more(2, reply.cursor_id, 10);
        assert_eq!(more.documents.len(), 3);
        assert_eq!(more.starting_from, 2);
        assert_eq!(more.cursor_id, 0);
        assert!(store.cursors.is_empty());
    }

    #[test]
    fn unknown_cursor_sets_flag() {
        let mut store = store();
        let reply = store.get_more(1, 404, 0);
        assert!(reply.flags.cursor_not_found());
    }

    #[test]
    fn busy_server_refuses_past_its_backlog() {
        let server = DocumentServer::bind("127.0.0.1:0", 1)
            .unwrap()
            .with_backlog(0);
        let observer = server.observer();
        let address = server.spawn().unwrap();

        let held = Database::connect(&testing::config(address)).unwrap();
        held.ping().unwrap();
        assert_eq!(observer.active_connections(), 1);

        let refused = Database::connect(&testing::config(address)).unwrap();
        assert!(refused.ping().is_err());

        held.ping().unwrap();
        assert_eq!(observer.active_connections(), 1);
    }
}
