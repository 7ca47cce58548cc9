//! End-to-end echo tests over loopback.
//!
//! Every test runs a real server on an ephemeral port with its own buffer
//! pool, so rental counts can be checked in isolation.

use quic_echo::client::spawn_sessions;
use quic_echo::config::{ClientConfig, ServerConfig, STREAM_ERROR_CODE};
use quic_echo::{transport, BufferPool, Client, Server, ServerStats};
use quinn::VarInt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_server(pool: Arc<BufferPool>) -> (SocketAddr, Arc<ServerStats>) {
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let server = Server::with_pool(&config, pool).expect("Server bind failed");
    let addr = server.local_addr().unwrap();
    let stats = server.stats();

    tokio::spawn(async move { server.run().await });

    (addr, stats)
}

/// Poll until every accepted connection has been torn down.
async fn wait_for_disconnects(stats: &ServerStats, expected: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while stats.disconnected() < expected || stats.accepted() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handlers did not finish in time");
}

async fn echo_once(addr: SocketAddr, message: &[u8]) -> Vec<u8> {
    let endpoint = transport::client_endpoint(addr).unwrap();
    let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();
    let (mut send, mut recv) = connection.open_bi().await.unwrap();

    send.write_all(message).await.unwrap();
    let mut reply = vec![0u8; message.len()];
    recv.read_exact(&mut reply).await.unwrap();

    connection.close(VarInt::from_u32(0x0B), b"");
    reply
}

#[tokio::test]
async fn test_hello_world_round_trip() {
    let pool = BufferPool::new(16);
    let (addr, stats) = start_server(Arc::clone(&pool)).await;

    let reply = echo_once(addr, b"Hello, World! (0)").await;
    assert_eq!(reply, b"Hello, World! (0)");

    wait_for_disconnects(&stats, 1).await;
    assert_eq!(stats.bytes_echoed(), 17);
    assert_eq!(pool.stats().outstanding(), 0);
}

#[tokio::test]
async fn test_chunk_larger_than_buffer_is_echoed_intact() {
    let pool = BufferPool::new(16);
    let (addr, stats) = start_server(Arc::clone(&pool)).await;

    // Spans several 4096-byte server reads
    let message: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let reply = echo_once(addr, &message).await;
    assert_eq!(reply, message);

    wait_for_disconnects(&stats, 1).await;
    assert_eq!(pool.stats().outstanding(), 0);
}

#[tokio::test]
async fn test_echo_delivered_after_half_close() {
    const ROUNDS: u64 = 20;

    let pool = BufferPool::new(16);
    let (addr, stats) = start_server(Arc::clone(&pool)).await;
    let endpoint = transport::client_endpoint(addr).unwrap();

    for i in 0..ROUNDS {
        let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();
        let (mut send, mut recv) = connection.open_bi().await.unwrap();

        let message = format!("Hello, World! ({i})");
        send.write_all(message.as_bytes()).await.unwrap();
        send.finish().unwrap();

        let reply = recv.read_to_end(1024).await.unwrap();
        assert_eq!(reply, message.as_bytes(), "round {i}");
    }

    wait_for_disconnects(&stats, ROUNDS).await;
    assert_eq!(stats.last_session(), ROUNDS);
    assert_eq!(pool.stats().outstanding(), 0);
}

#[tokio::test]
async fn test_acceptor_survives_handler_failures() {
    const FAILURES: u64 = 5;

    let pool = BufferPool::new(16);
    let (addr, stats) = start_server(Arc::clone(&pool)).await;
    let endpoint = transport::client_endpoint(addr).unwrap();

    for i in 0..FAILURES {
        let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();
        if i % 2 == 0 {
            // Abort the stream mid-conversation
            let (mut send, _recv) = connection.open_bi().await.unwrap();
            send.write_all(b"partial").await.unwrap();
            send.reset(VarInt::from_u32(STREAM_ERROR_CODE)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Hang up without a goodbye
        connection.close(VarInt::from_u32(0x0B), b"");
    }

    wait_for_disconnects(&stats, FAILURES).await;

    let reply = echo_once(addr, b"Hello, World! (5)").await;
    assert_eq!(reply, b"Hello, World! (5)");

    wait_for_disconnects(&stats, FAILURES + 1).await;
    assert_eq!(stats.accepted(), FAILURES + 1);
    assert_eq!(stats.last_session(), FAILURES + 1);
    assert_eq!(pool.stats().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_sessions() {
    const SESSIONS: usize = 200;

    let server_pool = BufferPool::new(64);
    let (addr, server_stats) = start_server(Arc::clone(&server_pool)).await;

    let client_pool = BufferPool::new(64);
    let config = ClientConfig {
        remote: addr.to_string(),
        send_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let client = Client::with_pool(&config, Arc::clone(&client_pool)).unwrap();

    let handles = spawn_sessions(&client, SESSIONS, Duration::from_millis(1), 3, Some(2024)).await;
    for handle in handles {
        handle.await.unwrap();
    }

    let client_stats = client.stats();
    assert_eq!(client_stats.failed(), 0);
    assert_eq!(client_stats.connected(), SESSIONS as u64);
    assert_eq!(client_stats.voluntary_closes(), SESSIONS as u64);

    // One session counter per connection, one disconnect per connection
    wait_for_disconnects(&server_stats, SESSIONS as u64).await;
    assert_eq!(server_stats.accepted(), SESSIONS as u64);
    assert_eq!(server_stats.disconnected(), SESSIONS as u64);
    assert_eq!(server_stats.accept_failures(), 0);
    // Counter values 1..=SESSIONS, each handed out once
    assert_eq!(server_stats.last_session(), SESSIONS as u64);

    assert_eq!(server_pool.stats().outstanding(), 0);
    assert_eq!(client_pool.stats().outstanding(), 0);
    assert_eq!(client_pool.stats().rented, SESSIONS as u64);
}
