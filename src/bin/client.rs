//! quic-echo-client: opens many concurrent echo sessions against the server.

use quic_echo::config::{ClientConfig, CLOSE_CODE};
use quic_echo::{client, runtime, Client};
use quinn::VarInt;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ClientConfig::load()?;

    // Initialize logging
    runtime::init_logging(&config.log_level);

    info!(
        remote = %config.remote,
        sessions = config.sessions,
        spawn_interval_ms = config.spawn_interval.as_millis() as u64,
        seed = ?config.seed,
        "Starting quic-echo client"
    );

    runtime::build(config.workers)?.block_on(drive(config))
}

async fn drive(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(&config)?;

    tokio::select! {
        _ = client::run(&client, &config) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    let endpoint = client.endpoint();
    endpoint.close(VarInt::from_u32(CLOSE_CODE), b"shutdown");
    endpoint.wait_idle().await;

    let stats = client.stats();
    info!(
        connected = stats.connected(),
        round_trips = stats.round_trips(),
        voluntary_closes = stats.voluntary_closes(),
        failed = stats.failed(),
        "Client stopped"
    );
    Ok(())
}
