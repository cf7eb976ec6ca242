//! End-to-end relay scenarios over loopback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcp_fanout::server::create_listener;
use tcp_fanout::{Client, PayloadSink, Server, ServerConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;

fn server_config(max_connections: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        buffer_size: 2048,
        idle_timeout: None,
        log_level: "info".to_string(),
    }
}

async fn spawn_server(max_connections: usize) -> (Server, SocketAddr) {
    let server = Server::new(&server_config(max_connections)).unwrap();
    let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move { runner.run(listener).await });
    (server, addr)
}

fn channel_sink() -> (impl PayloadSink, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |payload: &[u8]| {
        let _ = tx.send(payload.to_vec());
    };
    (sink, rx)
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no payload within 5s")
        .expect("sink dropped")
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let (server, addr) = spawn_server(2).await;

    let (sink1, mut rx1) = channel_sink();
    let client1 = Client::connect_to(addr, 2, 2048, sink1).await.unwrap();
    let (sink2, mut rx2) = channel_sink();
    let _client2 = Client::connect_to(addr, 2, 2048, sink2).await.unwrap();
    wait_for(|| server.stats().connected == 2).await;

    client1.send("hello").await.unwrap();

    assert_eq!(next_payload(&mut rx2).await, b"hello");
    // The sender is a registered connection too.
    assert_eq!(next_payload(&mut rx1).await, b"hello");
    assert_eq!(server.stats().total_bytes_read, 5);
}

#[tokio::test]
async fn test_payload_bytes_arrive_unmodified() {
    let (_server, addr) = spawn_server(1).await;
    let (sink, mut rx) = channel_sink();
    let client = Client::connect_to(addr, 1, 2048, sink).await.unwrap();

    let message = "héllo wörld ✓";
    client.send(message).await.unwrap();
    assert_eq!(next_payload(&mut rx).await, message.as_bytes());
}

#[tokio::test]
async fn test_excess_client_waits_for_free_slot() {
    let (server, addr) = spawn_server(2).await;

    let (sink1, _rx1) = channel_sink();
    let client1 = Client::connect_to(addr, 2, 2048, sink1).await.unwrap();
    let (sink2, _rx2) = channel_sink();
    let _client2 = Client::connect_to(addr, 2, 2048, sink2).await.unwrap();
    wait_for(|| server.stats().connected == 2).await;

    // Completes the handshake from the backlog but is not admitted.
    let (sink3, mut rx3) = channel_sink();
    let client3 = Client::connect_to(addr, 2, 2048, sink3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.registry().len(), 2);
    assert_eq!(server.stats().accepted, 2);
    assert!(!server.registry().contains(3));

    client1.close();
    wait_for(|| server.registry().contains(3)).await;
    assert_eq!(server.stats().connected, 2);
    assert!(!server.registry().contains(1));

    client3.send("admitted").await.unwrap();
    assert_eq!(next_payload(&mut rx3).await, b"admitted");
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (server, addr) = spawn_server(2).await;
    let (sink, _rx) = channel_sink();
    let client = Client::connect_to(addr, 2, 2048, sink).await.unwrap();
    wait_for(|| server.stats().connected == 1).await;

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client did not observe shutdown");
    assert!(client.is_closed());
    assert_eq!(server.stats().connected, 0);
}

/// Counts every byte delivered and keeps only those that are not filler.
#[derive(Default)]
struct Tally {
    bytes: AtomicUsize,
    marked: Mutex<Vec<u8>>,
}

impl Tally {
    fn sink(this: &Arc<Self>) -> impl PayloadSink {
        let tally = Arc::clone(this);
        move |payload: &[u8]| {
            tally.bytes.fetch_add(payload.len(), Ordering::Relaxed);
            tally
                .marked
                .lock()
                .unwrap()
                .extend(payload.iter().filter(|b| **b != b'x'));
        }
    }

    fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn saw(&self, needle: &[u8]) -> bool {
        self.marked
            .lock()
            .unwrap()
            .windows(needle.len())
            .any(|w| w == needle)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_reading_peer_does_not_stall_relay() {
    let (server, addr) = spawn_server(3).await;

    let tally_a = Arc::new(Tally::default());
    let client_a = Client::connect_to(addr, 3, 2048, Tally::sink(&tally_a)).await.unwrap();
    let tally_b = Arc::new(Tally::default());
    let _client_b = Client::connect_to(addr, 3, 2048, Tally::sink(&tally_b)).await.unwrap();

    // Sends far more than its socket buffers hold and never reads, so the
    // relay back to it blocks for good.
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let mut stalled = socket.connect(addr).await.unwrap();
    wait_for(|| server.stats().connected == 3).await;

    let chunk = vec![b'x'; 64 * 1024];
    tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..256 {
            stalled.write_all(&chunk).await.unwrap();
        }
    })
    .await
    .expect("server stopped reading from the flooding peer");

    // Let in-flight relays to the reading clients drain.
    let mut last = (usize::MAX, usize::MAX);
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let now = (tally_a.bytes(), tally_b.bytes());
        if now == last {
            break;
        }
        last = now;
    }

    client_a.send("PING").await.unwrap();
    wait_for(|| tally_a.saw(b"PING") && tally_b.saw(b"PING")).await;
    assert_eq!(server.stats().connected, 3);
}
