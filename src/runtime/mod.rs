//! Connection and I/O resource engine shared by the server and client.
//!
//! - `BufferArena`: one contiguous block sliced into fixed-size segments
//! - `IoContextPool`: reusable operation contexts, one segment each
//! - `AdmissionGate`: bound on concurrently accepted connections
//! - `ConnectionRegistry`: live connections for fan-out and cleanup
//! - `NetworkEngine`: posting operations and routing their completions

mod arena;
mod connection;
mod context;
mod engine;
mod gate;
mod op;

pub use arena::{BufferArena, Segment};
pub use connection::{ConnId, ConnState, Connection, ConnectionRegistry, SendSlot, CLIENT_CONN_ID};
pub use context::{IoContext, IoContextPool};
pub use engine::{dispatch, post_send, CompletionHandler, NetworkEngine, OPS_PER_CONNECTION};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use op::{IoStatus, Next, OpKind};
