//! tcp-fanout: a bounded-connection TCP broadcast relay.
//!
//! The server accepts up to a fixed number of connections and relays every
//! payload it receives to all of them. The client connects, sends lines of
//! text, and prints whatever the server relays back.
//!
//! Both sides run on the same engine:
//! - One contiguous buffer arena, sliced into fixed-size segments at startup
//! - A pool of reusable I/O contexts, one segment each
//! - An admission gate bounding concurrent connections
//! - A registry of live connections for fan-out and cleanup

pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod server;

pub use client::{Client, PayloadSink};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use error::{Error, Result};
pub use server::{Server, ServerStats};
