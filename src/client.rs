//! Load-generating echo client.
//!
//! Each session owns one connection and one outbound bidirectional stream.
//! It sends `Hello, World! (<n>)`, waits for the identical bytes to come
//! back, and before every message asks its `DisconnectPolicy` whether to
//! hang up instead. Sessions never reconnect.

use crate::buffer::BufferPool;
use crate::config::{ClientConfig, CLOSE_CODE};
use crate::error::{Error, Result};
use crate::transport;
use bytes::BytesMut;
use quinn::{Endpoint, VarInt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decides, once per iteration, whether a session closes its connection
/// instead of sending the next message.
pub trait DisconnectPolicy: Send {
    fn should_disconnect(&mut self, sequence: u64) -> bool;
}

/// Disconnects with probability `1 / one_in` on every iteration.
///
/// `one_in == 0` never disconnects.
#[derive(Debug)]
pub struct RandomDisconnect<R = StdRng> {
    rng: R,
    one_in: u32,
}

impl RandomDisconnect<StdRng> {
    /// Seeded from OS entropy.
    pub fn from_entropy(one_in: u32) -> Self {
        Self::with_rng(StdRng::from_entropy(), one_in)
    }

    /// Deterministic sequence of decisions for a given seed.
    pub fn seeded(seed: u64, one_in: u32) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), one_in)
    }
}

impl<R: Rng> RandomDisconnect<R> {
    pub fn with_rng(rng: R, one_in: u32) -> Self {
        Self { rng, one_in }
    }
}

impl<R: Rng + Send> DisconnectPolicy for RandomDisconnect<R> {
    fn should_disconnect(&mut self, _sequence: u64) -> bool {
        self.one_in > 0 && self.rng.gen_ratio(1, self.one_in)
    }
}

/// Client-wide counters across all sessions.
#[derive(Debug, Default)]
pub struct ClientStats {
    connected: AtomicU64,
    round_trips: AtomicU64,
    voluntary_closes: AtomicU64,
    failed: AtomicU64,
}

impl ClientStats {
    /// Sessions that completed the handshake.
    pub fn connected(&self) -> u64 {
        self.connected.load(Ordering::Acquire)
    }

    /// Messages echoed back and verified.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Acquire)
    }

    /// Sessions that ended by their own disconnect decision.
    pub fn voluntary_closes(&self) -> u64 {
        self.voluntary_closes.load(Ordering::Acquire)
    }

    /// Sessions that ended with an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }
}

/// How a session that closed voluntarily went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Completed request/response round trips.
    pub round_trips: u64,
    /// Sequence number of the iteration that closed the connection.
    pub closed_at: u64,
}

/// Shared client state: one endpoint multiplexes every session's
/// connection over a single UDP socket.
#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
    remote: SocketAddr,
    server_name: String,
    send_interval: Duration,
    buffer_size: usize,
    pool: Arc<BufferPool>,
    stats: Arc<ClientStats>,
}

impl Client {
    /// Create a client using the process-wide buffer pool.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_pool(config, BufferPool::shared())
    }

    /// Create a client renting buffers from `pool`.
    pub fn with_pool(config: &ClientConfig, pool: Arc<BufferPool>) -> Result<Self> {
        let remote: SocketAddr = config.remote.parse()?;
        let endpoint = transport::client_endpoint(remote)?;

        Ok(Client {
            endpoint,
            remote,
            server_name: config.server_name.clone(),
            send_interval: config.send_interval,
            buffer_size: config.buffer_size,
            pool,
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Drive one connection until `policy` hangs up or the transport fails.
    pub async fn run_session<P: DisconnectPolicy>(&self, mut policy: P) -> Result<SessionSummary> {
        let connection = self.endpoint.connect(self.remote, &self.server_name)?.await?;
        self.stats.connected.fetch_add(1, Ordering::AcqRel);
        info!(
            local = ?self.endpoint.local_addr().ok(),
            remote = %connection.remote_address(),
            alpn = ?transport::negotiated_protocol(&connection),
            "Connected"
        );

        let (mut send, mut recv) = connection.open_bi().await?;
        let mut reply = self.pool.rent(self.buffer_size);
        let mut payload = BytesMut::with_capacity(32);
        let mut sequence: u64 = 0;

        loop {
            let current = sequence;
            sequence += 1;

            if policy.should_disconnect(current) {
                connection.close(VarInt::from_u32(CLOSE_CODE), b"");
                self.stats.voluntary_closes.fetch_add(1, Ordering::AcqRel);
                debug!(sequence = current, "Closing connection");
                return Ok(SessionSummary {
                    round_trips: current,
                    closed_at: current,
                });
            }

            write_payload(&mut payload, current);
            let len = payload.len();
            send.write_all(&payload).await?;

            if reply.capacity() < len {
                reply = self.pool.rent(len);
            }
            recv.read_exact(&mut reply[..len])
                .await
                .map_err(|e| Error::from_read_exact(e, len))?;

            if reply[..len] != payload[..] {
                return Err(Error::EchoMismatch { sequence: current });
            }
            self.stats.round_trips.fetch_add(1, Ordering::AcqRel);
            debug!(message = %String::from_utf8_lossy(&reply[..len]), "Echo received");

            tokio::time::sleep(self.send_interval).await;
        }
    }
}

/// Encode message `sequence` into `payload`, replacing its contents.
fn write_payload(payload: &mut BytesMut, sequence: u64) {
    payload.clear();
    // BytesMut grows on demand, so formatting into it cannot fail.
    let _ = write!(payload, "Hello, World! ({sequence})");
}

/// Launch `count` detached sessions, `interval` apart.
///
/// Each session logs its own terminal error; none of them can stop the
/// spawner or a sibling. With a `seed`, session `i` draws its disconnect
/// decisions from `seed + i`.
pub async fn spawn_sessions(
    client: &Client,
    count: usize,
    interval: Duration,
    disconnect_one_in: u32,
    seed: Option<u64>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count);

    for i in 0..count {
        let policy = match seed {
            Some(seed) => RandomDisconnect::seeded(seed.wrapping_add(i as u64), disconnect_one_in),
            None => RandomDisconnect::from_entropy(disconnect_one_in),
        };

        let client = client.clone();
        handles.push(tokio::spawn(async move {
            match client.run_session(policy).await {
                Ok(summary) => debug!(
                    session = i,
                    round_trips = summary.round_trips,
                    "Session closed"
                ),
                Err(e) => {
                    client.stats.failed.fetch_add(1, Ordering::AcqRel);
                    warn!(session = i, error = %e, "Session failed");
                }
            }
        }));

        if i + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }

    info!(count, "All sessions spawned");
    handles
}

/// Spawn the configured sessions, then keep the process alive for them.
pub async fn run(client: &Client, config: &ClientConfig) {
    tokio::time::sleep(config.startup_delay).await;

    spawn_sessions(
        client,
        config.sessions,
        config.spawn_interval,
        config.disconnect_one_in,
        config.seed,
    )
    .await;

    std::future::pending::<()>().await;
}
