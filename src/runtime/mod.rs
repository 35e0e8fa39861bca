//! Single-threaded readiness runtime.
//!
//! - `buffer`: fixed-capacity read/write buffers with fill and send cursors
//! - `connection`: per-connection state machine and the slab registry
//! - `reactor`: mio event loop owning the listener, registry and store

mod buffer;
mod connection;
mod reactor;

use reactor::Reactor;

use crate::config::Config;
use tracing::info;

/// Bind the configured address and serve until the process exits.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut reactor = Reactor::bind(config)?;
    reactor.run()?;
    info!(stats = ?reactor.stats(), "Reactor stopped");
    Ok(())
}
