//! Client and server settings.
//!
//! Both structs derive [`clap::Args`] so binaries can flatten them into their
//! command line, and both implement [`Default`] for library users that build
//! them in code.
use std::{net::SocketAddr, time::Duration};

use clap::Args;

use crate::{Error, protocol::DEFAULT_BACKLOG};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:27017";

#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    /// Server address to connect to
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: SocketAddr,

    /// Database every collection name is qualified with
    #[arg(long, default_value = "test")]
    pub database: String,

    /// Milliseconds to wait for the TCP handshake
    #[arg(long, default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Milliseconds to wait for a reply before the channel gives up (0 waits forever)
    #[arg(long, default_value_t = 30_000)]
    pub reply_timeout_ms: u64,

    /// Documents requested per batch (0 lets the server decide)
    #[arg(long, default_value_t = 0)]
    pub batch_size: i32,

    /// Ids handed out locally per server round-trip
    #[arg(long, default_value_t = 100)]
    pub hilo_capacity: u64,

    /// How often a lost counter-creation race is retried before giving up
    #[arg(long, default_value_t = 16)]
    pub max_counter_races: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 27017)),
            database: "test".into(),
            connect_timeout_ms: 5_000,
            reply_timeout_ms: 30_000,
            batch_size: 0,
            hilo_capacity: 100,
            max_counter_races: 16,
        }
    }
}

impl ClientConfig {
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout_ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        match self.reply_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.database.is_empty() || self.database.contains(['.', '\0', ' ']) {
            return Err(Error::Config(format!(
                "invalid database name '{}'",
                self.database
            )));
        }
        if self.hilo_capacity == 0 {
            return Err(Error::Config("hilo capacity must be at least 1".into()));
        }
        if self.batch_size < 0 {
            return Err(Error::Config("batch size cannot be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Listen for new connections at address
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: SocketAddr,

    /// Worker threads; each serves one connection at a time
    #[arg(long, default_value_t = 15)]
    pub workers: usize,

    /// Accepted connections that may wait for a busy worker before new ones are refused
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 27017)),
            workers: 15,
            backlog: DEFAULT_BACKLOG,
        }
    }
}
