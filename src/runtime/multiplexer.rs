//! Readiness multiplexer abstraction.
//!
//! The event loop only needs a narrow contract from the OS readiness
//! facility: watch, modify and unwatch a descriptor, then block until some
//! of them are ready. Keeping that contract behind a trait lets the loop run
//! against a scripted fake in tests.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchInterest {
    Readable,
    Writable,
    Both,
}

impl WatchInterest {
    pub fn is_readable(self) -> bool {
        matches!(self, WatchInterest::Readable | WatchInterest::Both)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, WatchInterest::Writable | WatchInterest::Both)
    }
}

/// A descriptor reported ready by a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Peer shut down its write side (or the socket hung up).
    pub read_closed: bool,
}

impl ReadinessEvent {
    /// A plain readable event, as produced for level-style notification.
    pub fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            readable: true,
            writable: false,
            error: false,
            read_closed: false,
        }
    }

    /// Whether a read should be attempted on the descriptor.
    ///
    /// Error and hang-up conditions are surfaced by the read itself.
    pub fn wants_read(&self) -> bool {
        self.readable || self.error || self.read_closed
    }
}

/// Thread-safe handle that forces a pending wait to return.
pub trait Wakeup: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

/// OS readiness facility used by the event loop.
pub trait Multiplexer {
    /// Allocate a readiness context able to report `max_events` per wait.
    fn create(max_events: usize) -> Result<Self, MuxError>
    where
        Self: Sized;

    /// Start watching `fd`.
    fn watch(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError>;

    /// Change the interest of an already watched `fd`.
    fn modify(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError>;

    /// Stop watching `fd`. Succeeds if `fd` was never watched.
    fn unwatch(&mut self, fd: RawFd) -> Result<(), MuxError>;

    /// Block until a watched descriptor is ready, the timeout elapses or a
    /// wakeup fires. Ready descriptors replace the contents of `events`;
    /// an empty result means timeout or wakeup.
    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> Result<usize, MuxError>;

    /// Handle used by other threads to interrupt `wait`.
    fn wakeup(&self) -> Arc<dyn Wakeup>;
}

/// Errors reported by a [`Multiplexer`].
#[derive(Debug)]
pub enum MuxError {
    /// The OS could not allocate a readiness context.
    ResourceExhausted(io::Error),
    /// Descriptor is closed, already watched, or not watched.
    InvalidDescriptor { fd: RawFd, source: io::Error },
    /// Wait was interrupted by a signal. Retry.
    Interrupted,
    Io(io::Error),
}

impl MuxError {
    /// Classify an error from context creation.
    pub fn from_create(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => {
                MuxError::ResourceExhausted(e)
            }
            _ => MuxError::Io(e),
        }
    }

    /// Classify an error from a watch-table operation on `fd`.
    pub fn from_control(fd: RawFd, e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EBADF) | Some(libc::EEXIST) | Some(libc::ENOENT) | Some(libc::EPERM) => {
                MuxError::InvalidDescriptor { fd, source: e }
            }
            _ => MuxError::Io(e),
        }
    }

    /// Classify an error from a wait.
    pub fn from_wait(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::Interrupted {
            MuxError::Interrupted
        } else {
            MuxError::Io(e)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MuxError::Interrupted)
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::ResourceExhausted(e) => {
                write!(f, "cannot allocate readiness context: {e}")
            }
            MuxError::InvalidDescriptor { fd, source } => {
                write!(f, "invalid descriptor {fd}: {source}")
            }
            MuxError::Interrupted => write!(f, "wait interrupted by signal"),
            MuxError::Io(e) => write!(f, "multiplexer I/O error: {e}"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MuxError::ResourceExhausted(e) | MuxError::Io(e) => Some(e),
            MuxError::InvalidDescriptor { source, .. } => Some(source),
            MuxError::Interrupted => None,
        }
    }
}
