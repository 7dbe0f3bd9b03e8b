//! accept-router server binary
//!
//! Listens for TCP connections and routes each one to the ping or echo
//! protocol, either by sniffing its first byte or by reading a
//! `PROTO <name>` preamble. Configuration via CLI arguments or TOML file.

use accept_router::config::Config;
use accept_router::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        routing_mode = ?config.routing_mode,
        routing_timeout_ms = config.routing_timeout_ms,
        max_routing_buffer = config.max_routing_buffer,
        max_connections = config.max_connections,
        "Starting accept-router"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder
        .enable_all()
        .thread_name("accept-router-worker")
        .build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        server.run().await
    })?;

    Ok(())
}
