//! Shared network engine: arena and pool ownership, operation posting,
//! and routing of finished operations to completion handlers.

use crate::error::{Error, Result};
use crate::runtime::arena::BufferArena;
use crate::runtime::connection::{Connection, SendSlot};
use crate::runtime::context::{IoContext, IoContextPool};
use crate::runtime::op::{Next, OpKind};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error};

/// One receive and one send outstanding per connection.
pub const OPS_PER_CONNECTION: usize = 2;

/// Behavior the server and client plug into the engine.
pub trait CompletionHandler: Send + Sync + Sized + 'static {
    /// Engine that owns the contexts this handler receives.
    fn engine(&self) -> &NetworkEngine;

    /// A receive finished. Return the context to re-arm, or
    /// [`Next::Done`] after returning it to the pool.
    fn on_receive_complete(
        self: Arc<Self>,
        ctx: IoContext,
    ) -> impl Future<Output = Next<IoContext>> + Send;

    /// A send finished. The handler owns `ctx` and must return it to
    /// the pool.
    fn on_send_complete(&self, ctx: IoContext);
}

/// Owner of the buffer arena and the context pool.
#[derive(Debug)]
pub struct NetworkEngine {
    arena: BufferArena,
    pool: IoContextPool,
    max_connections: usize,
}

impl NetworkEngine {
    /// Reserve the arena and fill the pool with
    /// `max_connections * OPS_PER_CONNECTION` contexts.
    ///
    /// This is the only allocation of I/O buffers for the engine's life.
    pub fn init(max_connections: usize, segment_size: usize) -> Result<Self> {
        let count = max_connections
            .checked_mul(OPS_PER_CONNECTION)
            .ok_or(Error::Capacity {
                count: max_connections,
                segment_size,
            })?;

        let mut arena = BufferArena::allocate(count, segment_size)?;
        let pool = IoContextPool::fill(&mut arena, count)?;

        debug!(
            contexts = count,
            segment_size,
            arena_bytes = arena.total_bytes(),
            "Network engine initialized"
        );

        Ok(Self {
            arena,
            pool,
            max_connections,
        })
    }

    pub fn pool(&self) -> &IoContextPool {
        &self.pool
    }

    pub fn segment_size(&self) -> usize {
        self.arena.segment_size()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena.total_bytes()
    }

    /// Receive into the full segment of `ctx` and record the completion.
    ///
    /// With `idle_timeout` set, a receive that sees no data for that long
    /// completes with `TimedOut`.
    pub async fn receive(
        &self,
        conn: &Connection,
        mut ctx: IoContext,
        idle_timeout: Option<Duration>,
    ) -> IoContext {
        ctx.reset_window();
        let result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, read_into(conn.stream(), ctx.window_mut())).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => read_into(conn.stream(), ctx.window_mut()).await,
        };
        ctx.complete(OpKind::Receive, result);
        ctx
    }
}

/// Route a finished operation to the handler for its kind.
///
/// A context carrying any other kind goes back to the pool and the call
/// fails with [`Error::UnexpectedOperation`].
pub async fn dispatch<H: CompletionHandler>(handler: Arc<H>, ctx: IoContext) -> Result<Next<IoContext>> {
    match ctx.last_op() {
        Some(OpKind::Receive) => Ok(handler.on_receive_complete(ctx).await),
        Some(OpKind::Send) => {
            handler.on_send_complete(ctx);
            Ok(Next::Done)
        }
        other => {
            error!(op = ?other, slot = ctx.slot(), "Completed operation has no handler");
            handler.engine().pool().push(ctx);
            Err(Error::UnexpectedOperation(other))
        }
    }
}

/// Send the window of `ctx` on `conn`.
///
/// The write is attempted immediately. If it finishes without blocking,
/// the send handler runs inline before this returns; otherwise the rest
/// is written by a spawned task which then runs the same handler. The
/// send slot is held until the handler has returned the context.
pub async fn post_send<H: CompletionHandler>(
    handler: Arc<H>,
    conn: Arc<Connection>,
    mut ctx: IoContext,
    slot: SendSlot,
) {
    let total = ctx.window().len();
    let written = match write_now(conn.stream(), ctx.window()) {
        Ok(n) if n == total => {
            ctx.complete(OpKind::Send, Ok(n));
            handler.on_send_complete(ctx);
            drop(slot);
            return;
        }
        Ok(n) => n,
        Err(e) => {
            ctx.complete(OpKind::Send, Err(e));
            handler.on_send_complete(ctx);
            drop(slot);
            return;
        }
    };

    tokio::spawn(async move {
        let result = write_all_from(conn.stream(), ctx.window(), written).await;
        ctx.complete(OpKind::Send, result.map(|()| total));
        handler.on_send_complete(ctx);
        drop(slot);
    });
}

async fn read_into(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write as much as the socket takes without blocking.
fn write_now(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match stream.try_write(&buf[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

async fn write_all_from(stream: &TcpStream, buf: &[u8], mut written: usize) -> io::Result<()> {
    while written < buf.len() {
        stream.writable().await?;
        match stream.try_write(&buf[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
