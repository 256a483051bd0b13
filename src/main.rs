//! tally: a shared network counter
//!
//! Two processes from one binary:
//! - `tally server`: line protocol counter server (INCR, DECR, GET, RESET,
//!   QUIT) multiplexing every client on one thread
//! - `tally bridge`: HTTP/JSON front end that relays REST calls to the
//!   counter server
//!
//! Configuration via CLI arguments or TOML file.

mod bridge;
mod config;
mod counter;
mod protocol;
mod runtime;

use config::{Config, Mode};
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

    match config.mode {
        Mode::Server => run_server(config),
        Mode::Bridge => run_bridge(config),
    }
}

/// Run the counter server on the current thread
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.server.listen_addr(),
        max_connections = config.server.max_connections,
        "Starting counter server"
    );
    runtime::run(&config.server)?;
    Ok(())
}

/// Run the HTTP bridge on a single-threaded tokio runtime
fn run_bridge(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(listen = %config.bridge.listen_addr(), "Starting HTTP bridge");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(bridge::run(&config.bridge))?;
    Ok(())
}
