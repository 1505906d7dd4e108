//! mux-echo: a single-threaded readiness-based TCP echo server.
//!
//! Every client connection is multiplexed over one readiness facility
//! (epoll on Linux, kqueue on macOS) instead of a thread per connection.
//!
//! Features:
//! - Byte-for-byte echo, up to 1024 bytes per read cycle
//! - Pluggable readiness multiplexer, with a mio implementation
//! - Graceful shutdown on SIGINT/SIGTERM funneled through the event loop
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod runtime;
