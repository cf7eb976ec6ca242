//! Connection state machine and the registry of live connections.
//!
//! A connection owns its transport, a one-permit send slot, and (on the
//! server) the admission permit it was accepted under. Closing is guarded
//! by the state machine so the permit and registry entry are released
//! exactly once whichever completion path gets there first.

use crate::runtime::gate::AdmissionPermit;
use chrono::{DateTime, Utc};
use socket2::SockRef;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Connection identifier. The server assigns them from 1 upward; the
/// client's single connection uses [`CLIENT_CONN_ID`].
pub type ConnId = u64;

/// Identifier of the client's implicit connection.
pub const CLIENT_CONN_ID: ConnId = 0;

/// Current state of a connection.
///
/// Accepting happens before a `Connection` exists, so the lifecycle
/// starts at `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Transport established, receive not yet armed.
    Connected = 0,
    /// Waiting for the next receive to complete.
    Receiving = 1,
    /// Fanning a received payload out to peers.
    Sending = 2,
    /// Close has started.
    Closing = 3,
    /// Transport shut down and resources released.
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connected,
            1 => ConnState::Receiving,
            2 => ConnState::Sending,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub fn is_closing(self) -> bool {
        matches!(self, ConnState::Closing | ConnState::Closed)
    }
}

/// Exclusive right to have one send in flight on a connection.
#[derive(Debug)]
pub struct SendSlot {
    _permit: OwnedSemaphorePermit,
}

/// A single accepted or outbound connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    send_slot: Arc<Semaphore>,
    permit: Mutex<Option<AdmissionPermit>>,
}

impl Connection {
    /// Wrap a connected stream. `permit` is the admission slot the
    /// server accepted it under; clients pass `None`.
    pub fn new(id: ConnId, stream: TcpStream, permit: Option<AdmissionPermit>) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            stream,
            peer_addr,
            connected_at: Utc::now(),
            state: AtomicU8::new(ConnState::Connected as u8),
            send_slot: Arc::new(Semaphore::new(1)),
            permit: Mutex::new(permit),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails if the state changed underneath,
    /// which is how a concurrent close wins over receive/send bookkeeping.
    pub fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closing()
    }

    /// Wait for the send slot. Fails once the connection is closing.
    pub async fn reserve_send(&self) -> Option<SendSlot> {
        let permit = Arc::clone(&self.send_slot).acquire_owned().await.ok()?;
        Some(SendSlot { _permit: permit })
    }

    /// Take the send slot only if it is free right now.
    ///
    /// Returns `None` while a send is in flight or once the connection
    /// has closed.
    pub fn try_reserve_send(&self) -> Option<SendSlot> {
        let permit = Arc::clone(&self.send_slot).try_acquire_owned().ok()?;
        Some(SendSlot { _permit: permit })
    }

    /// Enter `Closing`. Returns false if a close already started.
    pub fn begin_close(&self) -> bool {
        let prev = self.state.swap(ConnState::Closing as u8, Ordering::AcqRel);
        if ConnState::from_u8(prev).is_closing() {
            // Restore `Closed` if the earlier close already finished.
            if prev == ConnState::Closed as u8 {
                self.state.store(prev, Ordering::Release);
            }
            return false;
        }
        true
    }

    /// Shut the socket down in both directions.
    ///
    /// The outbound shutdown may fail on a peer that already vanished;
    /// that error is swallowed. The inbound shutdown wakes any pending
    /// receive so its loop observes the close. The descriptor itself is
    /// closed when the last reference to the connection is dropped.
    pub fn shutdown_transport(&self) {
        let sock = SockRef::from(&self.stream);
        if let Err(e) = sock.shutdown(Shutdown::Write) {
            trace!(conn_id = self.id, error = %e, "Outbound shutdown failed");
        }
        if let Err(e) = sock.shutdown(Shutdown::Read) {
            trace!(conn_id = self.id, error = %e, "Inbound shutdown failed");
        }
        self.send_slot.close();
    }

    /// Hand back the admission permit, if this connection holds one.
    pub fn release_permit(&self) -> bool {
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match permit {
            Some(permit) => {
                permit.release();
                true
            }
            None => false,
        }
    }

    pub fn finish_close(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }
}

/// Registry of live connections keyed by identifier.
///
/// Iteration works on a snapshot, so handlers may register or unregister
/// connections while a fan-out is walking the previous set.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create a registry sized for `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::with_capacity(max_connections)),
        }
    }

    /// Insert a connection. Returns false if the identifier is taken.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let mut connections = self.write();
        if connections.contains_key(&conn.id()) {
            return false;
        }
        connections.insert(conn.id(), conn);
        true
    }

    pub fn unregister(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current set of connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read().values().cloned().collect()
    }

    /// Call `f` on every connection registered at the time of the call.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnId, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnId, Arc<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::gate::AdmissionGate;
    use tokio::net::TcpListener;

    async fn pair(id: ConnId, permit: Option<AdmissionPermit>) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(id, server, permit).unwrap(), client)
    }

    #[tokio::test]
    async fn test_connection_state_transitions() {
        let (conn, _peer) = pair(1, None).await;
        assert_eq!(conn.state(), ConnState::Connected);

        assert!(conn.transition(ConnState::Connected, ConnState::Receiving));
        assert!(conn.transition(ConnState::Receiving, ConnState::Sending));
        assert!(!conn.transition(ConnState::Receiving, ConnState::Sending));
        assert!(conn.transition(ConnState::Sending, ConnState::Receiving));

        assert!(conn.begin_close());
        assert!(!conn.transition(ConnState::Receiving, ConnState::Sending));
        conn.finish_close();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_begin_close_once() {
        let gate = AdmissionGate::new(1);
        let (conn, _peer) = pair(1, gate.try_acquire()).await;
        assert_eq!(gate.available(), 0);

        assert!(conn.begin_close());
        assert!(conn.release_permit());
        conn.finish_close();
        assert_eq!(gate.available(), 1);

        assert!(!conn.begin_close());
        assert!(!conn.release_permit());
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_send_slot_is_exclusive() {
        let (conn, _peer) = pair(1, None).await;
        let slot = conn.reserve_send().await.unwrap();

        let mut waiter = tokio_test::task::spawn(conn.reserve_send());
        tokio_test::assert_pending!(waiter.poll());

        drop(slot);
        assert!(tokio_test::assert_ready!(waiter.poll()).is_some());
    }

    #[tokio::test]
    async fn test_try_reserve_send_never_waits() {
        let (conn, _peer) = pair(1, None).await;
        let slot = conn.try_reserve_send().unwrap();
        assert!(conn.try_reserve_send().is_none());

        drop(slot);
        let slot = conn.try_reserve_send().unwrap();
        drop(slot);

        conn.shutdown_transport();
        assert!(conn.try_reserve_send().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_send_slot_and_peer_sees_eof() {
        use tokio::io::AsyncReadExt;

        let (conn, mut peer) = pair(1, None).await;
        conn.shutdown_transport();
        assert!(conn.reserve_send().await.is_none());

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_registry() {
        let registry = ConnectionRegistry::new(2);
        let (c1, _p1) = pair(1, None).await;
        let (c2, _p2) = pair(2, None).await;
        let (dup, _p3) = pair(1, None).await;

        assert!(registry.register(Arc::new(c1)));
        assert!(registry.register(Arc::new(c2)));
        assert!(!registry.register(Arc::new(dup)));
        assert_eq!(registry.len(), 2);

        let mut seen = Vec::new();
        registry.for_each(|conn| {
            seen.push(conn.id());
            // Mutating during iteration is safe; the walk uses a snapshot.
            registry.unregister(conn.id());
        });
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert!(registry.is_empty());
        assert!(registry.unregister(1).is_none());
    }
}
