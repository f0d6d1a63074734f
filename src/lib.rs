pub mod cli;
pub mod command;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod database;
pub mod error;
pub mod hilo;
pub mod mapping;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use cli::prompt;
pub use command::{Command, CommandError};
pub use config::{ClientConfig, ServerConfig};
pub use connection::Connection;
pub use cursor::{Cursor, CursorState};
pub use database::{Collection, Database, FindOptions};
pub use error::Error;
pub use hilo::{CounterStore, HiLoIdGenerator, IdBlock};
pub use mapping::{MappingRegistry, MetadataProvider, TypeKey, TypeMapping};
