//! Error types for endpoints, connections and sessions.

use std::io;
use std::net::AddrParseError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up endpoints or driving a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or endpoint setup failed.
    #[error("endpoint I/O error: {0}")]
    Io(#[from] io::Error),

    /// An address from configuration could not be parsed.
    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),

    /// The self-signed server certificate could not be generated.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    /// TLS configuration was rejected.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// The TLS configuration has no cipher suite usable by QUIC.
    #[error("TLS configuration has no QUIC initial cipher suite")]
    NoInitialCipherSuite(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    /// The connection attempt was refused before any packet was sent.
    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// Handshake failure, idle timeout, or peer-initiated close.
    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// Reading from a stream failed.
    #[error("stream read failed: {0}")]
    Read(#[from] quinn::ReadError),

    /// Writing to a stream failed.
    #[error("stream write failed: {0}")]
    Write(#[from] quinn::WriteError),

    /// The stream was finished before the full echo arrived.
    #[error("short read: expected {expected} bytes, stream finished after {received}")]
    ShortRead { expected: usize, received: usize },

    /// The echoed bytes differ from the bytes sent.
    #[error("echo mismatch on message {sequence}")]
    EchoMismatch { sequence: u64 },
}

impl Error {
    /// Map a `read_exact` failure for a reply of `expected` bytes.
    pub(crate) fn from_read_exact(err: quinn::ReadExactError, expected: usize) -> Self {
        match err {
            quinn::ReadExactError::FinishedEarly(received) => {
                Error::ShortRead { expected, received }
            }
            quinn::ReadExactError::ReadError(e) => Error::Read(e),
        }
    }

    /// Whether this error is an ordinary peer disconnect rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Connection(e) => is_peer_close(e),
            Error::Read(quinn::ReadError::ConnectionLost(e))
            | Error::Write(quinn::WriteError::ConnectionLost(e)) => is_peer_close(e),
            Error::Read(quinn::ReadError::Reset(_))
            | Error::Write(quinn::WriteError::Stopped(_)) => true,
            _ => false,
        }
    }
}

fn is_peer_close(err: &quinn::ConnectionError) -> bool {
    matches!(
        err,
        quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::ConnectionClosed(_)
            | quinn::ConnectionError::LocallyClosed
            | quinn::ConnectionError::TimedOut
            | quinn::ConnectionError::Reset
    )
}
