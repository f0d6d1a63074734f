//! Thin typed operations on top of a [`Connection`].
//!
//! [`Database`] qualifies collection names and runs commands through the `<db>.$cmd`
//! pseudo-collection; [`Collection`] maps the familiar insert/update/remove/find calls
//! onto wire requests. Writes are fire-and-forget unless the `_safe` variant is used,
//! which follows the write with `getlasterror` on the same channel.
use std::sync::Arc;

use bson::{Bson, Document, doc};
use log::debug;

use crate::{
    ClientConfig, Connection, Cursor, Error,
    mapping::{MetadataProvider, TypeKey},
    protocol::{Reply, Request},
};

const DUPLICATE_KEY_CODES: [i32; 3] = [11000, 11001, 12582];

/// Options for [`Collection::find_with`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: i32,
    /// Documents per batch; 0 lets the server decide.
    pub batch_size: i32,
    pub fields: Option<Document>,
}

#[derive(Clone)]
pub struct Database {
    connection: Arc<Connection>,
    name: String,
    batch_size: i32,
    mapping: Option<Arc<dyn MetadataProvider>>,
}

impl Database {
    pub fn connect(config: &ClientConfig) -> Result<Self, Error> {
        let connection = Arc::new(Connection::connect(config)?);
        Ok(Self::new(connection, &config.database).with_batch_size(config.batch_size))
    }

    pub fn new(connection: Arc<Connection>, name: impl Into<String>) -> Self {
        Self {
            connection,
            name: name.into(),
            batch_size: 0,
            mapping: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Installs the provider used by [`Self::collection_for`].
    pub fn with_mapping(mut self, mapping: Arc<dyn MetadataProvider>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn mapping(&self) -> Option<&Arc<dyn MetadataProvider>> {
        self.mapping.as_ref()
    }

    pub fn collection(&self, name: &str) -> Collection<'_> {
        Collection {
            database: self,
            name: name.to_string(),
            full_name: format!("{}.{}", self.name, name),
        }
    }

    /// Collection that stores documents of type `T`, as named by the
    /// configured metadata provider.
    pub fn collection_for<T: 'static>(&self) -> Collection<'_> {
        let key = TypeKey::of::<T>();
        let name = match &self.mapping {
            Some(mapping) => mapping.collection_name(key),
            None => key.scrubbed_name(),
        };
        self.collection(&name)
    }

    /// Runs a command and returns its reply document. A reply with `ok`
    /// other than 1 becomes [`Error::Command`].
    pub fn run_command(&self, command: Document) -> Result<Document, Error> {
        let name = command_name(&command)?;
        let reply = self.connection.call(self.command_request(command))?;
        command_result(name, reply)
    }

    pub fn ping(&self) -> Result<(), Error> {
        self.run_command(doc! { "ping": 1 }).map(|_| ())
    }

    /// Outcome of the last write on this channel. Only meaningful while no
    /// other thread writes through the same connection; the `_safe` writes
    /// hold the channel across both frames instead.
    pub fn last_error(&self) -> Result<Option<(i32, String)>, Error> {
        let reply = self.run_command(doc! { "getlasterror": 1 })?;
        Ok(write_error(&reply))
    }

    fn command_request(&self, command: Document) -> Request {
        Request::Query {
            collection: format!("{}.$cmd", self.name),
            flags: 0,
            skip: 0,
            number_to_return: -1,
            query: command,
            fields: None,
        }
    }

    /// Sends `write` and its `getlasterror` back to back.
    fn confirmed(&self, write: Request) -> Result<Option<(i32, String)>, Error> {
        let reply = self
            .connection
            .send_and_call(write, self.command_request(doc! { "getlasterror": 1 }))?;
        let result = command_result("getlasterror".into(), reply)?;
        Ok(write_error(&result))
    }
}

fn command_name(command: &Document) -> Result<String, Error> {
    command
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| Error::InvalidRequest("empty command".into()))
}

fn command_result(name: String, reply: Reply) -> Result<Document, Error> {
    if reply.flags.query_failure() {
        return Err(Error::QueryFailure(
            reply
                .error_message()
                .unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    let result = reply
        .documents
        .into_iter()
        .next()
        .ok_or_else(|| Error::Command {
            command: name.clone(),
            message: "empty reply".into(),
        })?;
    if !command_ok(&result) {
        let message = result
            .get_str("errmsg")
            .unwrap_or("command failed")
            .to_string();
        return Err(Error::Command {
            command: name,
            message,
        });
    }
    Ok(result)
}

fn write_error(reply: &Document) -> Option<(i32, String)> {
    match reply.get("err") {
        Some(Bson::String(message)) => {
            let code = match reply.get("code") {
                Some(Bson::Int32(code)) => *code,
                Some(Bson::Int64(code)) => *code as i32,
                _ => 0,
            };
            Some((code, message.clone()))
        }
        _ => None,
    }
}

fn command_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok == 1.0,
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

pub struct Collection<'d> {
    database: &'d Database,
    name: String,
    full_name: String,
}

impl<'d> Collection<'d> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<db>.<collection>` as written on the wire.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn insert(&self, documents: Vec<Document>) -> Result<(), Error> {
        self.database.connection.send(self.insert_request(documents))?;
        Ok(())
    }

    /// Inserts and confirms with `getlasterror`; a key collision becomes
    /// [`Error::DuplicateKey`].
    pub fn insert_safe(&self, documents: Vec<Document>) -> Result<(), Error> {
        let outcome = self.database.confirmed(self.insert_request(documents))?;
        self.check_write(outcome)
    }

    pub fn update(
        &self,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Result<(), Error> {
        let request = self.update_request(selector, update, upsert, multi);
        self.database.connection.send(request)?;
        Ok(())
    }

    pub fn update_safe(
        &self,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Result<(), Error> {
        let request = self.update_request(selector, update, upsert, multi);
        let outcome = self.database.confirmed(request)?;
        self.check_write(outcome)
    }

    pub fn remove(&self, selector: Document, single: bool) -> Result<(), Error> {
        self.database.connection.send(Request::Delete {
            collection: self.full_name.clone(),
            selector,
            single,
        })?;
        Ok(())
    }

    pub fn find(&self, query: Document) -> Result<Cursor<'d>, Error> {
        self.find_with(
            query,
            FindOptions {
                batch_size: self.database.batch_size,
                ..Default::default()
            },
        )
    }

    pub fn find_with(&self, query: Document, options: FindOptions) -> Result<Cursor<'d>, Error> {
        let connection: &'d Connection = &self.database.connection;
        let reply = connection.call(Request::Query {
            collection: self.full_name.clone(),
            flags: 0,
            skip: options.skip,
            number_to_return: options.batch_size,
            query,
            fields: options.fields,
        })?;
        Cursor::from_reply(connection, self.full_name.clone(), options.batch_size, reply)
    }

    /// First matching document; the server closes the cursor itself.
    pub fn find_one(&self, query: Document) -> Result<Option<Document>, Error> {
        let connection: &'d Connection = &self.database.connection;
        let reply = connection.call(Request::Query {
            collection: self.full_name.clone(),
            flags: 0,
            skip: 0,
            number_to_return: -1,
            query,
            fields: None,
        })?;
        let mut cursor = Cursor::from_reply(connection, self.full_name.clone(), -1, reply)?;
        cursor.next_document()
    }

    pub fn count(&self, query: Document) -> Result<i64, Error> {
        let reply = self
            .database
            .run_command(doc! { "count": self.name.clone(), "query": query })?;
        match reply.get("n") {
            Some(Bson::Int32(n)) => Ok(*n as i64),
            Some(Bson::Int64(n)) => Ok(*n),
            Some(Bson::Double(n)) => Ok(*n as i64),
            _ => Err(Error::Command {
                command: "count".into(),
                message: "reply has no count".into(),
            }),
        }
    }

    /// Atomically applies `update` to the first match and returns the
    /// document as it was before (or after, with `return_new`). `None` when
    /// nothing matched and nothing was upserted.
    pub fn find_and_modify(
        &self,
        query: Document,
        update: Document,
        return_new: bool,
        upsert: bool,
    ) -> Result<Option<Document>, Error> {
        let reply = self.database.run_command(doc! {
            "findandmodify": self.name.clone(),
            "query": query,
            "update": update,
            "new": return_new,
            "upsert": upsert,
        })?;
        match reply.get("value") {
            Some(Bson::Document(doc)) => Ok(Some(doc.clone())),
            _ => Ok(None),
        }
    }

    fn insert_request(&self, documents: Vec<Document>) -> Request {
        Request::Insert {
            collection: self.full_name.clone(),
            documents,
            continue_on_error: false,
        }
    }

    fn update_request(
        &self,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Request {
        Request::Update {
            collection: self.full_name.clone(),
            selector,
            update,
            upsert,
            multi,
        }
    }

    fn check_write(&self, outcome: Option<(i32, String)>) -> Result<(), Error> {
        match outcome {
            None => Ok(()),
            Some((code, message)) if DUPLICATE_KEY_CODES.contains(&code) => {
                debug!("duplicate key on {}: {message}", self.full_name);
                Err(Error::DuplicateKey {
                    collection: self.full_name.clone(),
                    message,
                })
            }
            Some((_, message)) => Err(Error::Command {
                command: "getlasterror".into(),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn database() -> Database {
        let (address, _) = testing::document_server();
        Database::connect(&testing::config(address)).unwrap()
    }

    #[test]
    fn names_are_qualified() {
        let db = database();
        assert_eq!(db.collection("orders").full_name(), "shop.orders");
        db.ping().unwrap();
    }

    #[test]
    fn insert_find_update_remove() {
        let db = database();
        let orders = db.collection("orders");

        orders
            .insert_safe(vec![
                doc! { "_id": 1, "status": "open" },
                doc! { "_id": 2, "status": "open" },
                doc! { "_id": 3, "status": "paid" },
            ])
            .unwrap();
        assert_eq!(orders.count(doc! { "status": "open" }).unwrap(), 2);

        orders
            .update_safe(
                doc! { "status": "open" },
                doc! { "$set": { "status": "paid" } },
                false,
                true,
            )
            .unwrap();
        let paid: Vec<Document> = orders
            .find(doc! { "status": "paid" })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(paid.len(), 3);

        orders.remove(doc! { "_id": 2 }, true).unwrap();
        assert!(orders.find_one(doc! { "_id": 2 }).unwrap().is_none());
        assert_eq!(orders.count(doc! {}).unwrap(), 2);
    }

    #[test]
    fn safe_insert_reports_duplicate_key() {
        let db = database();
        let keys = db.collection("keys");

        keys.insert_safe(vec![doc! { "_id": "orders" }]).unwrap();
        let err = keys.insert_safe(vec![doc! { "_id": "orders" }]).unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn find_and_modify_returns_previous_value() {
        let db = database();
        let keys = db.collection("keys");

        assert!(
            keys.find_and_modify(
                doc! { "_id": "orders" },
                doc! { "$inc": { "serverHi": 1 } },
                false,
                false
            )
            .unwrap()
            .is_none()
        );

        keys.insert_safe(vec![doc! { "_id": "orders", "serverHi": 2_i64 }])
            .unwrap();
        let before = keys
            .find_and_modify(
                doc! { "_id": "orders" },
                doc! { "$inc": { "serverHi": 1 } },
                false,
                false,
            )
            .unwrap()
            .unwrap();
        assert_eq!(before.get_i64("serverHi").unwrap(), 2);

        let after = keys.find_one(doc! { "_id": "orders" }).unwrap().unwrap();
        assert_eq!(after.get_i64("serverHi").unwrap(), 3);
    }

    #[test]
    fn unknown_command_fails() {
        let db = database();
        assert!(matches!(
            db.run_command(doc! { "frobnicate": 1 }),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn unsupported_selector_is_a_query_failure() {
        let db = database();
        let result = db.collection("orders").find(doc! { "$where": "true" });
        assert!(matches!(result, Err(Error::QueryFailure(_))));
    }
}
