//! Relay client: one outbound connection, sends on demand, and a receive
//! loop that hands every payload to a [`PayloadSink`].

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::runtime::{
    dispatch, post_send, CompletionHandler, ConnState, Connection, IoContext, NetworkEngine, Next,
    CLIENT_CONN_ID,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Receiver of payloads relayed by the server.
pub trait PayloadSink: Send + Sync + 'static {
    fn deliver(&self, payload: &[u8]);
}

impl<F> PayloadSink for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn deliver(&self, payload: &[u8]) {
        self(payload)
    }
}

/// Connected client handle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    engine: NetworkEngine,
    conn: Arc<Connection>,
    sink: Box<dyn PayloadSink>,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Connect to `config.connect` and start receiving.
    pub async fn connect<S: PayloadSink>(config: &ClientConfig, sink: S) -> Result<Self> {
        let addr = SocketAddr::V4(config.connect);
        Self::connect_to(addr, config.max_connections, config.buffer_size, sink).await
    }

    /// Connect to `addr` with a pool sized for `max_connections`.
    pub async fn connect_to<S: PayloadSink>(
        addr: SocketAddr,
        max_connections: usize,
        buffer_size: usize,
        sink: S,
    ) -> Result<Self> {
        let engine = NetworkEngine::init(max_connections, buffer_size)?;
        let stream = TcpStream::connect(addr).await?;
        let conn = Arc::new(Connection::new(CLIENT_CONN_ID, stream, None)?);
        info!(server = %addr, "Connection to server established");

        let mut ctx = engine.pool().pop()?;
        ctx.bind(CLIENT_CONN_ID);

        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            engine,
            conn,
            sink: Box::new(sink),
            closed,
        });

        tokio::spawn(Arc::clone(&inner).receive_loop(ctx));
        Ok(Client { inner })
    }

    /// Send `message` as UTF-8.
    ///
    /// Waits for the previous send to finish, so messages leave in order.
    pub async fn send(&self, message: &str) -> Result<()> {
        let inner = &self.inner;
        let payload = message.as_bytes();
        let max = inner.engine.segment_size();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let slot = inner.conn.reserve_send().await.ok_or(Error::Closed)?;
        let mut ctx = inner.engine.pool().pop()?;
        ctx.bind(CLIENT_CONN_ID);
        ctx.clear_residue();
        ctx.load(payload)?;

        post_send(Arc::clone(inner), Arc::clone(&inner.conn), ctx, slot).await;
        Ok(())
    }

    /// Close the connection without notifying the server beyond the
    /// transport shutdown.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // Only fails if the sender is gone, which means the client is too.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.conn.stream().local_addr()?)
    }

    pub fn engine(&self) -> &NetworkEngine {
        &self.inner.engine
    }
}

impl Inner {
    async fn receive_loop(self: Arc<Self>, mut ctx: IoContext) {
        self.conn.transition(ConnState::Connected, ConnState::Receiving);

        loop {
            ctx = self.engine.receive(&self.conn, ctx, None).await;
            match dispatch(Arc::clone(&self), ctx).await {
                Ok(Next::Receive(next)) => ctx = next,
                Ok(Next::Done) => break,
                Err(e) => {
                    error!(error = %e, "Receive dispatch failed");
                    self.close();
                    break;
                }
            }
        }
    }

    fn close(&self) {
        if !self.conn.begin_close() {
            return;
        }
        self.conn.shutdown_transport();
        self.conn.finish_close();
        self.closed.send_replace(true);
        info!(server = %self.conn.peer_addr(), "Connection to server closed");
    }
}

impl CompletionHandler for Inner {
    fn engine(&self) -> &NetworkEngine {
        &self.engine
    }

    async fn on_receive_complete(self: Arc<Self>, ctx: IoContext) -> Next<IoContext> {
        match ctx.outcome() {
            Ok(n) => {
                debug!(bytes = n, "Received from server");
                self.sink.deliver(ctx.payload());
                if self.conn.is_closed() {
                    self.engine.pool().push(ctx);
                    return Next::Done;
                }
                Next::Receive(ctx)
            }
            Err(e) => {
                debug!(reason = %e, "Receive ended");
                self.engine.pool().push(ctx);
                self.close();
                Next::Done
            }
        }
    }

    fn on_send_complete(&self, ctx: IoContext) {
        match ctx.outcome() {
            Ok(n) => debug!(bytes = n, "Sent to server"),
            Err(e) => {
                debug!(reason = %e, "Send failed");
                self.engine.pool().push(ctx);
                self.close();
                return;
            }
        }
        self.engine.pool().push(ctx);
    }
}
