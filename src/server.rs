//! QUIC echo server.
//!
//! The acceptor hands every inbound connection to its own task and goes
//! straight back to accepting. Each task owns exactly one connection and
//! its single inbound bidirectional stream, echoing every chunk it reads
//! until the stream ends or the peer goes away.

use crate::buffer::BufferPool;
use crate::config::{ServerConfig, CLOSE_CODE, STREAM_ERROR_CODE};
use crate::error::Result;
use crate::transport;
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Server instance
pub struct Server {
    endpoint: Endpoint,
    buffer_size: usize,
    idle_timeout: Duration,
    pool: Arc<BufferPool>,
    stats: Arc<ServerStats>,
}

/// Counters shared between the acceptor and its connection tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    accept_failures: AtomicU64,
    disconnected: AtomicU64,
    bytes_echoed: AtomicU64,
    last_session: AtomicU64,
}

impl ServerStats {
    /// Connections that completed the handshake.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    /// Connections refused or failed before reaching a handler.
    pub fn accept_failures(&self) -> u64 {
        self.accept_failures.load(Ordering::Acquire)
    }

    /// Handlers that ran to completion, whatever the exit path.
    pub fn disconnected(&self) -> u64 {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Total payload bytes written back to clients.
    pub fn bytes_echoed(&self) -> u64 {
        self.bytes_echoed.load(Ordering::Acquire)
    }

    /// Most recent session counter value, 0 before the first connection.
    pub fn last_session(&self) -> u64 {
        self.last_session.load(Ordering::Acquire)
    }
}

impl Server {
    /// Bind a new server using the process-wide buffer pool.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        Self::with_pool(config, BufferPool::shared())
    }

    /// Bind a new server renting buffers from `pool`.
    pub fn with_pool(config: &ServerConfig, pool: Arc<BufferPool>) -> Result<Self> {
        let endpoint = transport::server_endpoint(config)?;

        Ok(Server {
            endpoint,
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout,
            pool,
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Handle to the underlying endpoint, for shutdown.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the endpoint is closed.
    ///
    /// A failure on one connection is logged and never stops the loop.
    pub async fn run(&self) -> Result<()> {
        info!(address = %self.local_addr()?, "Server listening");

        let mut session_id: u64 = 0;

        while let Some(incoming) = self.endpoint.accept().await {
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    self.stats.accept_failures.fetch_add(1, Ordering::AcqRel);
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            session_id += 1;
            self.stats.last_session.store(session_id, Ordering::Release);
            let pool = Arc::clone(&self.pool);
            let stats = Arc::clone(&self.stats);
            let buffer_size = self.buffer_size;
            let linger = self.idle_timeout;

            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => {
                        stats.accepted.fetch_add(1, Ordering::AcqRel);
                        debug!(
                            session = session_id,
                            peer = %connection.remote_address(),
                            alpn = ?transport::negotiated_protocol(&connection),
                            "New connection"
                        );
                        let options = HandlerOptions {
                            buffer_size,
                            linger,
                        };
                        handle_connection(session_id, connection, &pool, options, &stats).await;
                    }
                    Err(e) => {
                        stats.accept_failures.fetch_add(1, Ordering::AcqRel);
                        warn!(session = session_id, error = %e, "Handshake failed");
                    }
                }
            });
        }

        info!("Endpoint closed, no longer accepting connections");
        Ok(())
    }
}

/// Closes the connection and records the disconnect when dropped, so every
/// exit path out of `handle_connection` (including cancellation) runs it
/// exactly once.
struct DisconnectGuard<'a> {
    session_id: u64,
    connection: &'a Connection,
    stats: &'a ServerStats,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        info!(session = self.session_id, "Disconnected");
        self.connection.close(VarInt::from_u32(CLOSE_CODE), b"");
        self.stats.disconnected.fetch_add(1, Ordering::AcqRel);
    }
}

/// Per-connection handler settings.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    /// Size of the buffer rented for reads.
    pub buffer_size: usize,
    /// Upper bound on waiting for the peer to acknowledge the final echo
    /// after a clean end of stream.
    pub linger: Duration,
}

/// Echo everything received on the connection's single inbound stream.
pub async fn handle_connection(
    session_id: u64,
    connection: Connection,
    pool: &Arc<BufferPool>,
    options: HandlerOptions,
    stats: &ServerStats,
) {
    let _guard = DisconnectGuard {
        session_id,
        connection: &connection,
        stats,
    };
    let mut buffer = pool.rent(options.buffer_size);

    let result = match connection.accept_bi().await {
        Ok((send, recv)) => echo_stream(send, recv, &mut buffer, options.linger, stats).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(bytes) => debug!(session = session_id, bytes, "Stream finished"),
        Err(e) if e.is_disconnect() => {
            debug!(session = session_id, error = %e, "Peer disconnected")
        }
        Err(e) => warn!(session = session_id, error = %e, "Echo failed"),
    }
}

/// Read-then-write until the peer finishes the stream.
///
/// Returns the number of bytes echoed. On error the stream is reset and
/// stopped with the stream error code; nothing already read is resent.
/// After a clean end the send side is finished and held open for up to
/// `linger` until the peer acknowledges it, since closing the connection
/// discards unacknowledged stream data.
async fn echo_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    buffer: &mut [u8],
    linger: Duration,
    stats: &ServerStats,
) -> Result<u64> {
    let mut echoed: u64 = 0;

    loop {
        let n = match recv.read(buffer).await {
            Ok(Some(n)) if n > 0 => n,
            Ok(_) => break,
            Err(e) => {
                abort_stream(&mut send, &mut recv);
                return Err(e.into());
            }
        };

        if let Err(e) = send.write_all(&buffer[..n]).await {
            abort_stream(&mut send, &mut recv);
            return Err(e.into());
        }

        trace!(bytes = n, "Echoed chunk");
        echoed += n as u64;
        stats.bytes_echoed.fetch_add(n as u64, Ordering::AcqRel);
    }

    // Already-closed streams are fine here; the peer is gone either way.
    if send.finish().is_ok() {
        match tokio::time::timeout(linger, send.stopped()).await {
            Ok(Ok(None)) => trace!("Echo acknowledged"),
            Ok(Ok(Some(code))) => debug!(%code, "Peer stopped reading"),
            Ok(Err(e)) => debug!(error = %e, "Connection lost before echo acknowledged"),
            Err(_) => warn!(?linger, "Echo not acknowledged in time"),
        }
    }
    Ok(echoed)
}

fn abort_stream(send: &mut SendStream, recv: &mut RecvStream) {
    let code = VarInt::from_u32(STREAM_ERROR_CODE);
    let _ = send.reset(code);
    let _ = recv.stop(code);
}
