//! QUIC endpoint construction.
//!
//! Everything below the echo protocol (handshake, encryption, congestion
//! control, stream multiplexing) is quinn's job. This module only
//! configures it:
//!
//! - TLS 1.3 with the ring provider, ALPN `h3`
//! - Server: in-memory self-signed certificate, idle timeout from config,
//!   one inbound bidirectional stream and no unidirectional streams per
//!   connection
//! - Client: accepts any server certificate, one inbound bidirectional
//!   stream and no unidirectional streams

use crate::config::{ServerConfig, ALPN_PROTOCOL};
use crate::error::Result;
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig, QuicServerConfig};
use quinn::{
    Connection, Endpoint, EndpointConfig, IdleTimeout, TokioRuntime, TransportConfig, VarInt,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Name the self-signed server certificate is issued for.
const CERTIFICATE_SUBJECT: &str = "localhost";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a server endpoint bound to `config.listen`.
pub fn server_endpoint(config: &ServerConfig) -> Result<Endpoint> {
    let addr: SocketAddr = config.listen.parse()?;

    let certified = rcgen::generate_simple_self_signed(vec![CERTIFICATE_SUBJECT.into()])?;
    let cert_chain = vec![certified.cert.der().clone()];
    let priv_key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(cert_chain, priv_key.into())?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    server_crypto.max_early_data_size = 0;

    let mut transport = TransportConfig::default();
    let idle_timeout = IdleTimeout::try_from(config.idle_timeout)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    transport.max_idle_timeout(Some(idle_timeout));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    let mut server_config =
        quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(server_crypto)?));
    server_config.transport_config(Arc::new(transport));

    let socket = bind_udp_socket(addr, config.recv_buffer_size)?;
    let endpoint = Endpoint::new(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(TokioRuntime),
    )?;

    debug!(addr = %endpoint.local_addr()?, "Server endpoint bound");
    Ok(endpoint)
}

/// Build a client endpoint able to reach `remote`.
pub fn client_endpoint(remote: SocketAddr) -> Result<Endpoint> {
    client_endpoint_with_alpn(remote, ALPN_PROTOCOL)
}

fn client_endpoint_with_alpn(remote: SocketAddr, alpn: &[u8]) -> Result<Endpoint> {
    let bind_addr: SocketAddr = match remote {
        SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
        SocketAddr::V6(_) => "[::]:0".parse()?,
    };
    let mut endpoint = Endpoint::client(bind_addr)?;

    let provider = crypto_provider();
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![alpn.to_vec()];

    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    let mut client_config =
        quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(client_crypto)?));
    client_config.transport_config(Arc::new(transport));
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// ALPN protocol negotiated on `connection`, if any.
pub fn negotiated_protocol(connection: &Connection) -> Option<String> {
    let data = connection.handshake_data()?.downcast::<HandshakeData>().ok()?;
    data.protocol
        .as_deref()
        .map(|p| String::from_utf8_lossy(p).into_owned())
}

/// Create a UDP socket for the server endpoint.
fn bind_udp_socket(
    addr: SocketAddr,
    recv_buffer_size: Option<usize>,
) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Accepts whatever certificate the server presents.
///
/// Only for the loopback test harness. Handshake signatures are still
/// checked so the TLS exchange itself stays well-formed.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
