//! framekv: a single-threaded key-value server.
//!
//! Clients speak a length-prefixed binary protocol and may pipeline
//! requests. One mio event loop multiplexes every connection.
//!
//! Commands:
//! - `GET key`
//! - `SET key value`
//! - `DEL key`

mod command;
mod config;
mod protocol;
mod runtime;
mod storage;

use config::Config;
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
        listen = %config.listen_addr(),
        max_connections = config.max_connections,
        events = config.events,
        "Starting framekv server"
    );

    runtime::run(&config)?;
    Ok(())
}
