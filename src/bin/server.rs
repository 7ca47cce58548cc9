//! quic-echo-server: accepts QUIC connections and echoes every stream.

use quic_echo::config::{ServerConfig, CLOSE_CODE};
use quic_echo::{runtime, Server};
use quinn::VarInt;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    runtime::init_logging(&config.log_level);

    info!(
        listen = %config.listen,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        buffer_size = config.buffer_size,
        workers = ?config.workers,
        "Starting quic-echo server"
    );

    runtime::build(config.workers)?.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config)?;
    let endpoint = server.endpoint().clone();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            endpoint.close(VarInt::from_u32(CLOSE_CODE), b"shutdown");
        }
    }

    endpoint.wait_idle().await;
    info!(
        accepted = server.stats().accepted(),
        disconnected = server.stats().disconnected(),
        "Server stopped"
    );
    Ok(())
}
