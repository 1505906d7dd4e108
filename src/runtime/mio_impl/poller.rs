//! [`Multiplexer`] over `mio::Poll`.
//!
//! Descriptors are registered through `SourceFd` with the descriptor itself
//! as the token, so readiness events map straight back to descriptors.
//! mio reports readiness edge-triggered; the event loop drains accepts and
//! reads, which keeps it correct under either mode.

use crate::runtime::multiplexer::{MuxError, Multiplexer, ReadinessEvent, WatchInterest, Wakeup};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Reserved token for the control wakeup. Descriptors are never this large.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Readiness multiplexer backed by epoll (Linux) or kqueue (macOS).
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    /// Descriptors currently in the kernel watch table.
    watched: HashSet<RawFd>,
}

impl Wakeup for Waker {
    fn wake(&self) -> io::Result<()> {
        Waker::wake(self)
    }
}

impl MioMultiplexer {
    /// Number of descriptors currently watched.
    #[cfg(test)]
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

fn to_mio(interest: WatchInterest) -> Interest {
    match interest {
        WatchInterest::Readable => Interest::READABLE,
        WatchInterest::Writable => Interest::WRITABLE,
        WatchInterest::Both => Interest::READABLE.add(Interest::WRITABLE),
    }
}

fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl Multiplexer for MioMultiplexer {
    fn create(max_events: usize) -> Result<Self, MuxError> {
        let poll = Poll::new().map_err(MuxError::from_create)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(MuxError::from_create)?;

        debug!(max_events, "Readiness context created");

        Ok(Self {
            poll,
            events: Events::with_capacity(max_events),
            waker: Arc::new(waker),
            watched: HashSet::new(),
        })
    }

    fn watch(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError> {
        if fd < 0 {
            return Err(MuxError::from_control(
                fd,
                io::Error::from_raw_os_error(libc::EBADF),
            ));
        }
        if self.watched.contains(&fd) {
            return Err(MuxError::from_control(
                fd,
                io::Error::from_raw_os_error(libc::EEXIST),
            ));
        }

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token_for(fd), to_mio(interest))
            .map_err(|e| MuxError::from_control(fd, e))?;
        self.watched.insert(fd);

        trace!(fd, ?interest, "Watching descriptor");
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: WatchInterest) -> Result<(), MuxError> {
        if !self.watched.contains(&fd) {
            return Err(MuxError::from_control(
                fd,
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }

        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token_for(fd), to_mio(interest))
            .map_err(|e| MuxError::from_control(fd, e))
    }

    fn unwatch(&mut self, fd: RawFd) -> Result<(), MuxError> {
        if !self.watched.remove(&fd) {
            debug!(fd, "Unwatch of descriptor that was not watched");
            return Ok(());
        }

        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                // Closing a descriptor drops it from the kernel table on its own.
                debug!(fd, "Descriptor already gone from watch table");
                Ok(())
            }
            Err(e) => Err(MuxError::from_control(fd, e)),
        }
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> Result<usize, MuxError> {
        events.clear();
        self.poll
            .poll(&mut self.events, timeout)
            .map_err(MuxError::from_wait)?;

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            events.push(ReadinessEvent {
                fd: event.token().0 as RawFd,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
            });
        }

        Ok(events.len())
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        Arc::clone(&self.waker) as Arc<dyn Wakeup>
    }
}
