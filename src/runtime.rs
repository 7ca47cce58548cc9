//! Process runtime setup shared by both binaries.
//!
//! - `build`: multi-threaded Tokio runtime sized from configuration
//! - `init_logging`: tracing subscriber honouring `RUST_LOG`

use std::io;
use tracing_subscriber::EnvFilter;

/// Build the Tokio runtime.
///
/// `workers` defaults to the number of CPU cores.
pub fn build(workers: Option<usize>) -> io::Result<tokio::runtime::Runtime> {
    let workers = workers.unwrap_or_else(num_cpus).max(1);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("quic-echo-worker")
        .enable_all()
        .build()
}

/// Initialize logging.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
