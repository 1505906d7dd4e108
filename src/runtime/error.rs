//! Event loop error types.

use crate::runtime::multiplexer::MuxError;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Fatal server errors. Any of these aborts startup or the loop.
#[derive(Debug)]
pub enum ServerError {
    /// Host is not an IPv4 dotted-quad address.
    InvalidHost(String),
    /// Backlog must be a positive 32-bit value.
    InvalidBacklog(u32),
    Multiplexer(MuxError),
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    /// Termination signal handlers could not be installed.
    Signal(io::Error),
    /// Operation is not valid in the current lifecycle state.
    State {
        operation: &'static str,
        state: &'static str,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidHost(host) => write!(f, "invalid IPv4 host '{host}'"),
            ServerError::InvalidBacklog(backlog) => write!(f, "invalid backlog {backlog}"),
            ServerError::Multiplexer(e) => write!(f, "multiplexer failure: {e}"),
            ServerError::Socket(e) => write!(f, "failed to create listening socket: {e}"),
            ServerError::Bind(addr, e) => write!(f, "failed to bind {addr}: {e}"),
            ServerError::Listen(e) => write!(f, "failed to listen: {e}"),
            ServerError::Signal(e) => write!(f, "failed to install signal handlers: {e}"),
            ServerError::State { operation, state } => {
                write!(f, "cannot {operation} while {state}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Multiplexer(e) => Some(e),
            ServerError::Socket(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(e)
            | ServerError::Signal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MuxError> for ServerError {
    fn from(e: MuxError) -> Self {
        ServerError::Multiplexer(e)
    }
}

/// Why a connection was torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// Read returned zero bytes.
    PeerClosed,
    Read(io::Error),
    Write(io::Error),
    /// The socket stopped accepting bytes partway through an echo.
    PartialWrite { written: usize, total: usize },
    /// Non-blocking mode could not be set after accept.
    Setup(io::Error),
    Register(MuxError),
    /// Connection limit reached.
    Rejected,
    Shutdown,
}

impl CloseReason {
    /// Whether the close is routine rather than a failure worth a warning.
    pub fn is_orderly(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Rejected | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Read(e) => write!(f, "read failed: {e}"),
            CloseReason::Write(e) => write!(f, "write failed: {e}"),
            CloseReason::PartialWrite { written, total } => {
                write!(f, "partial write: {written} of {total} bytes")
            }
            CloseReason::Setup(e) => write!(f, "socket setup failed: {e}"),
            CloseReason::Register(e) => write!(f, "registration failed: {e}"),
            CloseReason::Rejected => write!(f, "connection limit reached"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}
