//! Error types for the relay engine.

use crate::runtime::OpKind;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the arena, the context pool, and the engines.
#[derive(Debug, Error)]
pub enum Error {
    /// The arena size is zero or cannot be addressed.
    #[error("cannot reserve an arena of {count} segments of {segment_size} bytes")]
    Capacity { count: usize, segment_size: usize },

    /// Every segment of the arena has already been issued.
    #[error("buffer arena exhausted after issuing {issued} segments")]
    Exhausted { issued: usize },

    /// All contexts are in flight. Indicates a resource-accounting bug.
    #[error("I/O context pool is empty ({capacity} contexts in flight)")]
    PoolEmpty { capacity: usize },

    /// A payload does not fit into one buffer segment.
    #[error("payload of {len} bytes exceeds the {max} byte segment")]
    PayloadTooLarge { len: usize, max: usize },

    /// A finished context carried an operation no handler accepts.
    #[error("cannot route completed operation {0:?}")]
    UnexpectedOperation(Option<OpKind>),

    /// Socket-level failure, including peer reset and idle timeout.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer shut down its side of the connection.
    #[error("peer closed the connection")]
    ZeroLengthTransfer,

    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,

    /// The admission gate was closed for shutdown.
    #[error("admission gate closed")]
    GateClosed,
}
