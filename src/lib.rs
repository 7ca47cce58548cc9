//! quic-echo: a QUIC echo server and load-generating client
//!
//! The server accepts any number of concurrent connections and echoes the
//! bytes of each connection's single bidirectional stream back to the
//! sender. The client opens many staggered connections, each sending
//! sequence-numbered messages and verifying the echo until it randomly
//! decides to hang up.
//!
//! Features:
//! - quinn/rustls transport with a self-signed server certificate
//! - Shared buffer pool with exactly-once return
//! - Per-connection failure isolation on both sides
//! - Configuration via CLI arguments or TOML file

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
pub mod transport;

pub use buffer::{BufferPool, PoolStats, RentedBuffer};
pub use client::{Client, ClientStats, DisconnectPolicy, RandomDisconnect, SessionSummary};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::{HandlerOptions, Server, ServerStats};
