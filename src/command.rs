//! Commands understood by the interactive shell.
//!
//! Each line is either a dot command or a collection operation:
//!
//! - `.exit`: close the session.
//! - `.ping`: round-trip to the server.
//! - `.nextid <collection>`: draw an id from the collection's HiLo block.
//! - `insert <collection> key=value...`: insert one document; `_id` is generated when
//!   missing.
//! - `find <collection> [key=value...]`: print every matching document.
//! - `count <collection> [key=value...]`
//! - `remove <collection> [key=value...]`: delete all matching documents.
//!
//! Values are parsed as integers, then booleans, and otherwise kept as strings.
//!
//! # Example
//! ```rust
//! use bson::doc;
//! use docwire::Command;
//!
//! let cmd = Command::try_from("find orders status=open").unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Find {
//!         collection: "orders".into(),
//!         query: doc! { "status": "open" },
//!     }
//! );
//! ```
use std::io;

use bson::{Bson, Document};
use thiserror::Error;

/// List of possible error that a command can throw.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Exit,
    Ping,
    NextId(String),
    Insert {
        collection: String,
        document: Document,
    },
    Find {
        collection: String,
        query: Document,
    },
    Count {
        collection: String,
        query: Document,
    },
    Remove {
        collection: String,
        selector: Document,
    },
}

fn parse_value(raw: &str) -> Bson {
    if let Ok(n) = raw.parse::<i64>() {
        return Bson::Int64(n);
    }
    match raw {
        "true" => Bson::Boolean(true),
        "false" => Bson::Boolean(false),
        s => Bson::String(s.trim_matches('"').to_string()),
    }
}

fn parse_document(command: &str, pairs: &[&str]) -> Result<Document, CommandError> {
    let mut doc = Document::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CommandError::InvalidCommandArguments {
                command: command.to_string(),
                reason: format!("expected key=value, found '{pair}'"),
            })?;
        if key.is_empty() {
            return Err(CommandError::InvalidCommandArguments {
                command: command.to_string(),
                reason: format!("empty field name in '{pair}'"),
            });
        }
        doc.insert(key, parse_value(value));
    }
    Ok(doc)
}

fn collection_argument(command: &str, parts: &[&str]) -> Result<String, CommandError> {
    match parts.get(1) {
        Some(collection) => Ok(collection.to_string()),
        None => Err(CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("requires a collection name. Example: {command} orders"),
        }),
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let parts = value.split_whitespace().collect::<Vec<&str>>();
        let Some(head) = parts.first() else {
            return Err(CommandError::Empty);
        };

        match head.to_lowercase().as_str() {
            ".exit" => Ok(Command::Exit),
            ".ping" => Ok(Command::Ping),
            ".nextid" => Ok(Command::NextId(collection_argument(".nextid", &parts)?)),
            "insert" => {
                let collection = collection_argument("insert", &parts)?;
                let document = parse_document("insert", &parts[2..])?;
                if document.is_empty() {
                    return Err(CommandError::InvalidCommandArguments {
                        command: "insert".to_string(),
                        reason: "requires at least one field. Example: insert orders total=10"
                            .to_string(),
                    });
                }
                Ok(Command::Insert {
                    collection,
                    document,
                })
            }
            "find" => Ok(Command::Find {
                collection: collection_argument("find", &parts)?,
                query: parse_document("find", &parts[2..])?,
            }),
            "count" => Ok(Command::Count {
                collection: collection_argument("count", &parts)?,
                query: parse_document("count", &parts[2..])?,
            }),
            "remove" => Ok(Command::Remove {
                collection: collection_argument("remove", &parts)?,
                selector: parse_document("remove", &parts[2..])?,
            }),
            _ => Err(CommandError::UnrecognizedCommand(value.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            (".ping", Command::Ping),
            (".nextid orders", Command::NextId("orders".into())),
            (
                "insert orders total=10 paid=false note=\"gift\"",
                Command::Insert {
                    collection: "orders".into(),
                    document: doc! { "total": 10_i64, "paid": false, "note": "gift" },
                },
            ),
            (
                "FIND orders",
                Command::Find {
                    collection: "orders".into(),
                    query: doc! {},
                },
            ),
            (
                "count orders status=open",
                Command::Count {
                    collection: "orders".into(),
                    query: doc! { "status": "open" },
                },
            ),
            (
                "remove orders _id=4",
                Command::Remove {
                    collection: "orders".into(),
                    selector: doc! { "_id": 4_i64 },
                },
            ),
        ];

        for (cmd, expected) in inputs {
            let command = Command::try_from(cmd).unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    fn invalid_commands() {
        assert!(matches!(Command::try_from("   "), Err(CommandError::Empty)));
        assert!(matches!(
            Command::try_from(".nextid"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from("insert orders"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from("find orders status"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from("select * from orders"),
            Err(CommandError::UnrecognizedCommand(_))
        ));
    }
}
