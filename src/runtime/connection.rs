//! Active connection bookkeeping.
//!
//! Each accepted socket is tracked by its descriptor from the moment it is
//! watched until it is closed.

use crate::runtime::multiplexer::WatchInterest;
use socket2::Socket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// A single accepted client connection.
///
/// Dropping the connection closes its socket.
#[derive(Debug)]
pub struct Connection {
    pub socket: Socket,
    pub peer: Option<SocketAddr>,
    pub interest: WatchInterest,
}

impl Connection {
    pub fn new(socket: Socket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket,
            peer,
            interest: WatchInterest::Readable,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Registry of live connections keyed by descriptor.
///
/// A descriptor is present iff it is watched by the multiplexer and not yet
/// closed. Only the event loop thread touches it.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<RawFd, Connection>,
    /// 0 means unlimited.
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry. `max_connections` of 0 disables the limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Whether another connection may be admitted.
    pub fn has_capacity(&self) -> bool {
        self.max_connections == 0 || self.connections.len() < self.max_connections
    }

    /// Insert a connection, returning any entry it displaced.
    ///
    /// The OS never hands out a live descriptor twice, so a displaced entry
    /// means the inventory went stale.
    pub fn insert(&mut self, conn: Connection) -> Option<Connection> {
        self.connections.insert(conn.fd(), conn)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.connections.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Descriptors of all live connections.
    pub fn fds(&self) -> Vec<RawFd> {
        self.connections.keys().copied().collect()
    }

    /// Remove and yield every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain().map(|(_, conn)| conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    #[test]
    fn test_new_connection_reads() {
        let conn = Connection::new(socket(), None);
        assert_eq!(conn.interest, WatchInterest::Readable);
        assert!(conn.fd() >= 0);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let c1 = Connection::new(socket(), None);
        let c2 = Connection::new(socket(), None);
        let fd1 = c1.fd();
        let fd2 = c2.fd();

        assert!(registry.insert(c1).is_none());
        assert!(registry.has_capacity());
        assert!(registry.insert(c2).is_none());

        // At capacity
        assert!(!registry.has_capacity());
        assert_eq!(registry.len(), 2);

        let mut fds = registry.fds();
        fds.sort();
        let mut expected = vec![fd1, fd2];
        expected.sort();
        assert_eq!(fds, expected);

        assert!(registry.remove(fd1).is_some());
        assert!(!registry.contains(fd1));
        assert!(registry.remove(fd1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.has_capacity());
    }

    #[test]
    fn test_unlimited_registry() {
        let mut registry = ConnectionRegistry::new(0);
        for _ in 0..8 {
            registry.insert(Connection::new(socket(), None));
        }
        assert!(registry.has_capacity());
        assert_eq!(registry.drain().count(), 8);
        assert!(registry.is_empty());
    }
}
