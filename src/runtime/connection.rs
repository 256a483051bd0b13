//! Client connections and the fixed-capacity connection table.
//!
//! Each connection owns its socket, its inbound line buffer and any reply
//! bytes the socket has not accepted yet.

use crate::runtime::buffer::LineBuffer;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;

/// A single client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Received bytes not yet split into commands.
    pub inbound: LineBuffer,
    /// Reply bytes waiting for write readiness.
    pub outbound: BytesMut,
    /// `QUIT` seen: close once `outbound` drains.
    pub closing: bool,
    /// Interest currently registered with the poller.
    pub interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            inbound: LineBuffer::new(buffer_size),
            outbound: BytesMut::new(),
            closing: false,
            interest: Interest::READABLE,
        }
    }

    /// Write as much of `outbound` as the socket takes without blocking.
    ///
    /// Returns `Ok(true)` once everything queued has been written.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Returned by [`ConnectionTable::add`] when every slot is taken.
///
/// Hands the connection back so the caller decides how to drop it.
pub struct TableFull(pub Connection);

impl std::fmt::Debug for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TableFull").field(&self.0.peer).finish()
    }
}

impl std::fmt::Display for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection table full, rejecting {}", self.0.peer)
    }
}

impl std::error::Error for TableFull {}

/// Registry of live connections using slab allocation.
///
/// Slots are indices into the slab and double as mio tokens. A slot is
/// occupied iff it holds a socket, and a socket lives in exactly one slot.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create a table with a fixed number of slots.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Store a connection, returning its slot.
    pub fn add(&mut self, conn: Connection) -> Result<usize, TableFull> {
        if self.connections.len() >= self.max_connections {
            return Err(TableFull(conn));
        }
        Ok(self.connections.insert(conn))
    }

    /// Clear a slot, handing back its connection.
    ///
    /// The socket closes when the returned value is dropped.
    pub fn remove(&mut self, slot: usize) -> Option<Connection> {
        self.connections.try_remove(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.connections.get_mut(slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.connections.contains(slot)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair(listener: &TcpListener) -> (Connection, std::net::TcpStream) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(TcpStream::from_std(server), peer, 64);
        (conn, client)
    }

    #[test]
    fn test_connection_table() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new(2);

        let (c1, _k1) = socket_pair(&listener);
        let (c2, _k2) = socket_pair(&listener);
        let (c3, _k3) = socket_pair(&listener);

        let s1 = table.add(c1).unwrap();
        let s2 = table.add(c2).unwrap();
        assert_ne!(s1, s2);

        // At capacity
        let rejected = table.add(c3).unwrap_err();
        assert!(rejected.to_string().contains("connection table full"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.capacity(), 2);

        assert!(table.remove(s1).is_some());
        assert!(!table.contains(s1));
        assert!(table.remove(s1).is_none());
        assert_eq!(table.len(), 1);

        // Freed slot is reused
        let s3 = table.add(rejected.0).unwrap();
        assert_eq!(s3, s1);
        assert_eq!(table.iter().map(|(slot, _)| slot).collect::<Vec<_>>(), vec![s1, s2]);
    }

    #[test]
    fn test_removed_connection_closes_socket() {
        use std::io::Read;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new(1);
        let (conn, mut client) = socket_pair(&listener);

        let slot = table.add(conn).unwrap();
        drop(table.remove(slot));
        assert!(table.is_empty());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_flush_writes_queued_reply() {
        use std::io::Read;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut conn, mut client) = socket_pair(&listener);

        conn.outbound.extend_from_slice(b"OK\n");
        assert!(conn.flush().unwrap());
        assert!(conn.outbound.is_empty());

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OK\n");
    }
}
