//! Broadcast relay server.
//!
//! Accepts connections up to the admission gate's capacity and relays
//! every payload received from one connection to all registered
//! connections, the sender included.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::runtime::{
    dispatch, post_send, AdmissionGate, AdmissionPermit, CompletionHandler, ConnState, Connection,
    ConnId, ConnectionRegistry, IoContext, NetworkEngine, Next,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pending connections the kernel queues while the gate is full.
pub const LISTEN_BACKLOG: i32 = 100;

/// Point-in-time view of the server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections currently open.
    pub connected: usize,
    /// Connections admitted since start. Accepted sockets dropped before
    /// registration are not counted.
    pub accepted: u64,
    /// Payload bytes received across all connections.
    pub total_bytes_read: u64,
}

/// Server instance
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    engine: NetworkEngine,
    registry: ConnectionRegistry,
    gate: AdmissionGate,
    idle_timeout: Option<Duration>,
    next_id: AtomicU64,
    accepted: AtomicU64,
    connected: AtomicUsize,
    total_bytes_read: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a server and fill its buffer arena and context pool.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let engine = NetworkEngine::init(config.max_connections, config.buffer_size)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            inner: Arc::new(Inner {
                engine,
                registry: ConnectionRegistry::new(config.max_connections),
                gate: AdmissionGate::new(config.max_connections),
                idle_timeout: config.idle_timeout,
                next_id: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                connected: AtomicUsize::new(0),
                total_bytes_read: AtomicU64::new(0),
                shutdown,
            }),
        })
    }

    /// Bind `addr` and accept connections until [`Server::shutdown`].
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        let listener = create_listener(addr)?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.run(listener).await
    }

    /// Accept on `listener` until [`Server::shutdown`].
    ///
    /// A slot is taken from the admission gate before each accept, so at
    /// most `max_connections` are open and further peers wait in the
    /// listen backlog.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.inner.gate.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            match accepted {
                Ok((stream, peer)) => Arc::clone(&self.inner).admit(stream, peer, permit),
                Err(e) => {
                    // The permit is dropped here, so the slot is reusable.
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.gate.close();
        self.inner.registry.for_each(|conn| self.inner.close(conn));
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connected: self.inner.connected.load(Ordering::Acquire),
            accepted: self.inner.accepted.load(Ordering::Acquire),
            total_bytes_read: self.inner.total_bytes_read.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    pub fn engine(&self) -> &NetworkEngine {
        &self.inner.engine
    }

    /// Close connection `id`. Returns false if it is not registered.
    pub fn disconnect(&self, id: ConnId) -> bool {
        match self.inner.registry.get(id) {
            Some(conn) => {
                self.inner.close(&conn);
                true
            }
            None => false,
        }
    }
}

impl Inner {
    /// Register an accepted stream and start its receive loop.
    fn admit(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, permit: AdmissionPermit) {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;

        let mut ctx = match self.engine.pool().pop() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(conn_id = id, peer = %peer, error = %e, "No receive context for accepted connection");
                return;
            }
        };

        let conn = match Connection::new(id, stream, Some(permit)) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(conn_id = id, peer = %peer, error = %e, "Accepted connection unusable");
                self.engine.pool().push(ctx);
                return;
            }
        };

        ctx.bind(id);
        // Counted before it becomes visible to `close` through the registry.
        let connected = self.connected.fetch_add(1, Ordering::AcqRel) + 1;
        self.accepted.fetch_add(1, Ordering::AcqRel);
        self.registry.register(Arc::clone(&conn));

        info!(conn_id = id, peer = %peer, connected, "Client connection accepted");

        tokio::spawn(self.receive_loop(conn, ctx));
    }

    /// Keep one receive outstanding on `conn` until it closes.
    async fn receive_loop(self: Arc<Self>, conn: Arc<Connection>, mut ctx: IoContext) {
        conn.transition(ConnState::Connected, ConnState::Receiving);

        loop {
            ctx = self.engine.receive(&conn, ctx, self.idle_timeout).await;
            match dispatch(Arc::clone(&self), ctx).await {
                Ok(Next::Receive(next)) => ctx = next,
                Ok(Next::Done) => break,
                Err(e) => {
                    error!(conn_id = conn.id(), error = %e, "Receive dispatch failed");
                    self.close(&conn);
                    break;
                }
            }
        }
    }

    /// Copy `payload` into a send context for every registered
    /// connection and post the sends.
    ///
    /// Never waits on a peer: a connection whose previous send is still
    /// in flight is not reading, and misses this payload.
    async fn broadcast(this: &Arc<Self>, payload: &[u8]) {
        for peer in this.registry.snapshot() {
            let Some(slot) = peer.try_reserve_send() else {
                if !peer.state().is_closing() {
                    warn!(conn_id = peer.id(), bytes = payload.len(), "Peer send still pending, payload skipped");
                }
                continue;
            };

            let mut ctx = match this.engine.pool().pop() {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(conn_id = peer.id(), error = %e, "No send context for broadcast");
                    continue;
                }
            };

            ctx.bind(peer.id());
            if let Err(e) = ctx.load(payload) {
                error!(conn_id = peer.id(), error = %e, "Payload does not fit send context");
                this.engine.pool().push(ctx);
                continue;
            }

            post_send(Arc::clone(this), peer, ctx, slot).await;
        }
    }

    /// Tear down `conn`. Only the first call for a connection has effect.
    fn close(&self, conn: &Connection) {
        if !conn.begin_close() {
            return;
        }

        conn.shutdown_transport();
        let connected = self.connected.fetch_sub(1, Ordering::AcqRel) - 1;
        conn.release_permit();
        self.registry.unregister(conn.id());
        conn.finish_close();

        let session = chrono::Utc::now() - conn.connected_at();
        info!(
            conn_id = conn.id(),
            peer = %conn.peer_addr(),
            connected,
            session_ms = session.num_milliseconds(),
            "Client disconnected"
        );
    }
}

impl CompletionHandler for Inner {
    fn engine(&self) -> &NetworkEngine {
        &self.engine
    }

    async fn on_receive_complete(self: Arc<Self>, ctx: IoContext) -> Next<IoContext> {
        let Some(conn) = ctx.conn().and_then(|id| self.registry.get(id)) else {
            // Closed from a send failure while this receive was pending.
            self.engine.pool().push(ctx);
            return Next::Done;
        };

        let n = match ctx.outcome() {
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id = conn.id(), reason = %e, "Receive ended");
                self.close(&conn);
                self.engine.pool().push(ctx);
                return Next::Done;
            }
        };

        let total = self.total_bytes_read.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        debug!(conn_id = conn.id(), bytes = n, total_bytes_read = total, "Received payload");

        conn.transition(ConnState::Receiving, ConnState::Sending);
        Inner::broadcast(&self, ctx.payload()).await;

        if !conn.transition(ConnState::Sending, ConnState::Receiving) {
            self.engine.pool().push(ctx);
            return Next::Done;
        }
        Next::Receive(ctx)
    }

    fn on_send_complete(&self, ctx: IoContext) {
        if let Err(e) = ctx.outcome() {
            if let Some(conn) = ctx.conn().and_then(|id| self.registry.get(id)) {
                debug!(conn_id = conn.id(), reason = %e, "Send failed");
                self.close(&conn);
            }
        }
        self.engine.pool().push(ctx);
    }
}

/// Create the listening socket with the fixed backlog.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Resolve `host` and take its first IPv4 address.
pub async fn resolve_ipv4(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for host '{host}'"),
            )
        })
}
