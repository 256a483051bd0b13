//! Single-threaded readiness runtime for the counter server.
//!
//! - `LineBuffer`: per-connection accumulation and line splitting
//! - `ConnectionTable`: fixed-capacity slab of live connections
//! - `Server`: mio poll loop (epoll on Linux, kqueue on macOS)

mod buffer;
mod connection;
mod event_loop;

pub use event_loop::Server;

use crate::config::ServerConfig;

/// Bind the listener and serve until a fatal poll error.
pub fn run(config: &ServerConfig) -> std::io::Result<()> {
    Server::bind(config)?.run()
}
