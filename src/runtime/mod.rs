//! Readiness-based echo runtime.
//!
//! - `multiplexer`: the OS readiness facility contract
//! - `mio_impl`: that contract over mio (epoll on Linux, kqueue on macOS)
//! - `event_loop`: the `Server` that owns the listener and connections
//! - `shutdown`: signal handling funneled into the loop

pub mod connection;
pub mod error;
pub mod event_loop;
pub mod multiplexer;
pub mod shutdown;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod mio_impl;

#[cfg(test)]
mod testing;

pub use error::ServerError;
pub use event_loop::{Server, ServerState};
pub use multiplexer::{Multiplexer, MuxError};
pub use shutdown::{spawn_signal_listener, ShutdownHandle};

use crate::config::Config;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use tracing::info;

/// Run the server with the platform readiness facility until a termination
/// signal arrives.
pub fn run(config: Config) -> Result<(), ServerError> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let mut server = Server::<mio_impl::MioMultiplexer>::initialize(&config)?;
        spawn_signal_listener(server.shutdown_handle()).map_err(ServerError::Signal)?;
        server.serve()?;
        info!("Server stopped");
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = config;
        Err(ServerError::Socket(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unsupported platform: only Linux and macOS are supported",
        )))
    }
}
