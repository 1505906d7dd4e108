//! Connection manager and dispatch loop.
//!
//! One thread owns the listener, the multiplexer and every connection.
//! Each turn blocks in the multiplexer's wait, drains the control channel,
//! then dispatches ready descriptors: the listener accepts, anything else is
//! read and echoed back verbatim.
//!
//! ## Would-block policy
//!
//! A read that would block ends the read cycle and keeps the connection.
//! An echo that cannot be written in full without blocking closes the
//! connection with [`CloseReason::PartialWrite`]; there is no write queue.
//!
//! ## Fairness
//!
//! Each ready descriptor gets a bounded number of reads (or accepts) per
//! turn. A descriptor that still has work when its budget runs out goes on
//! the pending list; while that list is non-empty the loop waits with a zero
//! timeout and services it alongside the next batch. mio readiness is
//! edge-triggered, so nothing else would report that descriptor again.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::error::{CloseReason, ServerError};
use crate::runtime::multiplexer::{Multiplexer, ReadinessEvent, WatchInterest, Wakeup};
use crate::runtime::shutdown::{Control, ShutdownHandle};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Bytes read per read cycle.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Read cycles per connection per turn.
const READS_PER_EVENT: usize = 16;

/// Accepts per listener event per turn.
const ACCEPTS_PER_EVENT: usize = 64;

/// Lifecycle of a [`Server`]. A server value only exists once initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Bound and watched, not yet listening.
    Listening,
    Running,
    Terminated,
}

impl ServerState {
    fn name(self) -> &'static str {
        match self {
            ServerState::Listening => "listening",
            ServerState::Running => "running",
            ServerState::Terminated => "terminated",
        }
    }
}

/// Single-threaded echo server over a readiness multiplexer.
pub struct Server<M: Multiplexer> {
    state: ServerState,
    listener: Option<Socket>,
    local_addr: SocketAddr,
    backlog: i32,
    mux: Option<M>,
    connections: ConnectionRegistry,
    events: Vec<ReadinessEvent>,
    /// Descriptors that exhausted their budget and are still ready.
    pending: Vec<RawFd>,
    wait_timeout: Option<Duration>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    wakeup: Arc<dyn Wakeup>,
    buffer: [u8; READ_BUFFER_SIZE],
    /// Accept calls to fail with EMFILE before touching the listener.
    #[cfg(test)]
    accept_faults: usize,
}

impl<M: Multiplexer> Server<M> {
    /// Bind the listener and create a multiplexer sized from `config`.
    pub fn initialize(config: &Config) -> Result<Self, ServerError> {
        let mux = M::create(config.max_events)?;
        Self::initialize_with(config, mux)
    }

    /// Bind the listener and watch it on an existing multiplexer.
    pub fn initialize_with(config: &Config, mut mux: M) -> Result<Self, ServerError> {
        let ip: Ipv4Addr = config
            .host
            .parse()
            .map_err(|_| ServerError::InvalidHost(config.host.clone()))?;
        let backlog = i32::try_from(config.backlog)
            .ok()
            .filter(|b| *b > 0)
            .ok_or(ServerError::InvalidBacklog(config.backlog))?;

        let addr = SocketAddr::from((ip, config.port));
        let listener = create_listener(addr, config.reuse_address)?;
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        mux.watch(listener.as_raw_fd(), WatchInterest::Readable)?;

        let (control_tx, control_rx) = channel();
        let wakeup = mux.wakeup();

        info!(addr = %local_addr, backlog, "Listener bound");

        Ok(Self {
            state: ServerState::Listening,
            listener: Some(listener),
            local_addr,
            backlog,
            mux: Some(mux),
            connections: ConnectionRegistry::new(config.max_connections),
            events: Vec::with_capacity(config.max_events),
            pending: Vec::new(),
            wait_timeout: config.wait_timeout,
            control_tx,
            control_rx,
            wakeup,
            buffer: [0u8; READ_BUFFER_SIZE],
            #[cfg(test)]
            accept_faults: 0,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle other threads use to stop the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.control_tx.clone(), Arc::clone(&self.wakeup))
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors of all live connections.
    pub fn active_fds(&self) -> Vec<RawFd> {
        self.connections.fds()
    }

    /// Listener descriptor, `None` once closed.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Whether the multiplexer is still alive.
    pub fn has_multiplexer(&self) -> bool {
        self.mux.is_some()
    }

    /// Start listening and run the dispatch loop until shutdown is requested.
    ///
    /// Teardown always runs before returning, including after a fatal
    /// wait failure.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        self.start_listening()?;
        self.run_until_shutdown()
    }

    /// Run the dispatch loop on an already listening server, then tear down.
    ///
    /// Splitting this from [`Server::serve`] lets the caller issue `listen`
    /// on its own thread before handing the server to the loop thread.
    pub fn run_until_shutdown(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Running {
            return Err(self.invalid_state("run the event loop"));
        }
        info!(addr = %self.local_addr, "Server started");

        loop {
            match self.turn() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "Event loop failed");
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Issue `listen` on the bound socket.
    pub fn start_listening(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Listening {
            return Err(self.invalid_state("start listening"));
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| self.invalid_state("start listening"))?;
        listener.listen(self.backlog).map_err(ServerError::Listen)?;

        self.state = ServerState::Running;
        Ok(())
    }

    /// Run one wait-and-dispatch iteration.
    ///
    /// Returns `false` once a shutdown request has been received. The
    /// caller is then expected to call [`Server::shutdown`].
    pub fn turn(&mut self) -> Result<bool, ServerError> {
        if self.state != ServerState::Running {
            return Err(self.invalid_state("run the event loop"));
        }

        let timeout = if self.pending.is_empty() {
            self.wait_timeout
        } else {
            Some(Duration::ZERO)
        };

        let mut events = std::mem::take(&mut self.events);
        let waited = match self.mux.as_mut() {
            Some(mux) => mux.wait(&mut events, timeout),
            None => {
                self.events = events;
                return Err(self.invalid_state("run the event loop"));
            }
        };

        match waited {
            Ok(ready) => trace!(ready, "Wait returned"),
            Err(e) if e.is_transient() => {
                debug!("Wait interrupted, retrying");
                events.clear();
            }
            Err(e) => {
                self.events = events;
                return Err(e.into());
            }
        }

        if self.shutdown_requested() {
            self.events = events;
            return Ok(false);
        }

        self.dispatch(&events);
        self.events = events;
        Ok(true)
    }

    /// Close every connection and the listener, then destroy the multiplexer.
    ///
    /// Every step runs even if an earlier one fails. Calling this again is
    /// a no-op.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::Terminated {
            return;
        }
        info!(active = self.connections.len(), "Shutting down");

        let mut mux = self.mux.take();
        self.pending.clear();

        for conn in self.connections.drain() {
            let fd = conn.fd();
            if let Some(mux) = mux.as_mut() {
                if let Err(e) = mux.unwatch(fd) {
                    warn!(fd, error = %e, "Failed to unwatch connection");
                }
            }
            if let Err(e) = close_socket(conn.socket) {
                warn!(fd, error = %e, "Failed to close connection");
            }
            trace!(fd, "Connection closed for shutdown");
        }
        debug_assert!(self.connections.is_empty());

        if let Some(listener) = self.listener.take() {
            let fd = listener.as_raw_fd();
            if let Some(mux) = mux.as_mut() {
                if let Err(e) = mux.unwatch(fd) {
                    warn!(fd, error = %e, "Failed to unwatch listener");
                }
            }
            if let Err(e) = close_socket(listener) {
                warn!(fd, error = %e, "Failed to close listener");
            }
        }

        drop(mux);
        debug!("Readiness context destroyed");

        self.state = ServerState::Terminated;
        info!("Shutdown complete");
    }

    fn invalid_state(&self, operation: &'static str) -> ServerError {
        ServerError::State {
            operation,
            state: self.state.name(),
        }
    }

    /// Drain the control channel.
    fn shutdown_requested(&mut self) -> bool {
        let mut requested = false;
        loop {
            match self.control_rx.try_recv() {
                Ok(Control::Shutdown) => requested = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        requested
    }

    /// Number of descriptors carried over to the next turn.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&mut self, events: &[ReadinessEvent]) {
        let listener_fd = self.listener_fd();
        let carried: Vec<ReadinessEvent> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|&fd| !events.iter().any(|e| e.fd == fd && e.wants_read()))
            .map(ReadinessEvent::readable)
            .collect();
        // Descriptors closed earlier in this batch.
        let mut retired: HashSet<RawFd> = HashSet::new();

        for event in events.iter().chain(carried.iter()) {
            let fd = event.fd;
            if Some(fd) == listener_fd {
                if self.accept_pending() {
                    self.mark_pending(fd);
                }
                continue;
            }

            if retired.contains(&fd) || !self.connections.contains(fd) {
                trace!(fd, "Skipping event for closed descriptor");
                continue;
            }

            if !event.wants_read() {
                continue;
            }

            match self.service(fd) {
                Ok(true) => self.mark_pending(fd),
                Ok(false) => {}
                Err(reason) => {
                    self.remove_connection(fd, reason);
                    retired.insert(fd);
                }
            }
        }
    }

    fn mark_pending(&mut self, fd: RawFd) {
        if !self.pending.contains(&fd) {
            self.pending.push(fd);
        }
    }

    /// Accept until the listener would block or the budget runs out.
    ///
    /// Returns `true` if the listener must be tried again next turn. A failed
    /// accept counts as still ready: connections may be left in the backlog
    /// and no new readiness edge will announce them.
    fn accept_pending(&mut self) -> bool {
        for _ in 0..ACCEPTS_PER_EVENT {
            let accepted = match self.accept_one() {
                Some(accepted) => accepted,
                None => return false,
            };

            match accepted {
                Ok((socket, addr)) => self.admit(socket, addr.as_socket()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    warn!(error = %e, "Accept failed, retrying next turn");
                    return true;
                }
            }
        }
        true
    }

    fn accept_one(&mut self) -> Option<io::Result<(Socket, SockAddr)>> {
        #[cfg(test)]
        if self.accept_faults > 0 {
            self.accept_faults -= 1;
            return Some(Err(io::Error::from_raw_os_error(libc::EMFILE)));
        }
        self.listener.as_ref().map(Socket::accept)
    }

    /// Register a freshly accepted socket, or close it if any step fails.
    fn admit(&mut self, socket: Socket, peer: Option<SocketAddr>) {
        let fd = socket.as_raw_fd();

        if !self.connections.has_capacity() {
            discard(socket, peer, CloseReason::Rejected);
            return;
        }

        if let Err(e) = socket.set_nonblocking(true) {
            discard(socket, peer, CloseReason::Setup(e));
            return;
        }

        let conn = Connection::new(socket, peer);
        let Some(mux) = self.mux.as_mut() else {
            discard(conn.socket, peer, CloseReason::Shutdown);
            return;
        };
        if let Err(e) = mux.watch(fd, conn.interest) {
            if let Err(unwatch_err) = mux.unwatch(fd) {
                debug!(fd, error = %unwatch_err, "Unwatch after failed watch");
            }
            discard(conn.socket, peer, CloseReason::Register(e));
            return;
        }

        let displaced = self.connections.insert(conn);
        debug_assert!(displaced.is_none(), "descriptor {fd} already tracked");

        debug!(
            fd,
            peer = ?peer,
            active = self.connections.len(),
            "Accepted connection"
        );
    }

    /// Read and echo until the socket would block or the budget runs out.
    ///
    /// Returns `true` if the connection may still have unread data.
    fn service(&mut self, fd: RawFd) -> Result<bool, CloseReason> {
        let Some(conn) = self.connections.get_mut(fd) else {
            return Ok(false);
        };

        for _ in 0..READS_PER_EVENT {
            let n = match conn.socket.read(&mut self.buffer) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Read(e)),
            };

            trace!(fd, bytes = n, "Received");
            write_fully(&mut conn.socket, &self.buffer[..n])?;
        }
        Ok(true)
    }

    /// Unwatch and close a connection.
    fn remove_connection(&mut self, fd: RawFd, reason: CloseReason) {
        let Some(conn) = self.connections.remove(fd) else {
            return;
        };
        self.pending.retain(|&p| p != fd);

        if let Some(mux) = self.mux.as_mut() {
            if let Err(e) = mux.unwatch(fd) {
                warn!(fd, error = %e, "Failed to unwatch connection");
            }
        }

        let peer = conn.peer;
        if let Err(e) = close_socket(conn.socket) {
            warn!(fd, error = %e, "Failed to close connection");
        }
        log_close(fd, peer, &reason);
    }
}

/// Write all of `data`, retrying short writes.
///
/// Fails with [`CloseReason::PartialWrite`] if the writer would block
/// before everything is written.
fn write_fully<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), CloseReason> {
    let total = data.len();
    let mut written = 0;

    while written < total {
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(CloseReason::Write(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                )))
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(CloseReason::PartialWrite { written, total })
            }
            Err(e) => return Err(CloseReason::Write(e)),
        }
    }

    Ok(())
}

/// Create the non-blocking listening socket and bind it. `listen` comes later.
fn create_listener(addr: SocketAddr, reuse_address: bool) -> Result<Socket, ServerError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(reuse_address)
        .map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| ServerError::Bind(addr, e))?;

    Ok(socket)
}

/// Close a socket, reporting the result of `close(2)`.
fn close_socket(socket: Socket) -> io::Result<()> {
    let fd = socket.into_raw_fd();
    // SAFETY: `fd` was just released by its owning `Socket` and is closed once.
    if unsafe { libc::close(fd) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Close a socket that never made it into the registry.
fn discard(socket: Socket, peer: Option<SocketAddr>, reason: CloseReason) {
    let fd = socket.as_raw_fd();
    if let Err(e) = close_socket(socket) {
        warn!(fd, error = %e, "Failed to close rejected connection");
    }
    log_close(fd, peer, &reason);
}

fn log_close(fd: RawFd, peer: Option<SocketAddr>, reason: &CloseReason) {
    if reason.is_orderly() {
        debug!(fd, peer = ?peer, reason = %reason, "Connection closed");
    } else {
        warn!(fd, peer = ?peer, error = %reason, "Connection closed on error");
    }
}
