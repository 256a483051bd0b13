//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. The counter, the connection table and
//! every line buffer are only touched from `Server::turn`, so there is no
//! locking. mio readiness is edge-triggered: accept and write loop until
//! `WouldBlock`, while reads take one chunk per connection per turn and a
//! connection that may have more input is revisited on the next turn
//! without waiting for a new event.

use crate::config::ServerConfig;
use crate::counter::Counter;
use crate::protocol::process_line;
use crate::runtime::buffer::Append;
use crate::runtime::connection::{Connection, ConnectionTable, TableFull};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const LISTEN_BACKLOG: i32 = 128;

/// Queued reply bytes, in multiples of the buffer size, after which a
/// connection stops being read until its peer catches up.
const OUTBOUND_LIMIT_FACTOR: usize = 4;

/// Poll timeout while an accept has to be retried.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Whether a connection survives the event being handled.
enum ConnStatus {
    /// Connection stays registered.
    Open,
    /// Peer closed, or `QUIT` was answered and flushed.
    Close,
}

/// The counter server: listener, connection table and counter.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable,
    counter: Counter,
    buffer_size: usize,
    outbound_limit: usize,
    /// Scratch space for socket reads.
    read_buf: Vec<u8>,
    /// Slots to read on the next turn even if poll reports nothing for them.
    pending_reads: Vec<usize>,
    /// The last accept failed and the backlog may still hold connections.
    retry_accept: bool,
}

impl Server {
    /// Create the listener and register it for readiness.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let addr = config
            .listen_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no listen address"))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionTable::new(config.max_connections),
            counter: Counter::new(),
            buffer_size: config.buffer_size,
            outbound_limit: config.buffer_size.saturating_mul(OUTBOUND_LIMIT_FACTOR),
            read_buf: vec![0u8; config.buffer_size],
            pending_reads: Vec::new(),
            retry_accept: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever. Only a poll failure ends the loop.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.connections.capacity(),
            buffer_size = self.buffer_size,
            "Counter server listening"
        );

        loop {
            if let Err(e) = self.turn(None) {
                error!(error = %e, "Poll failed");
                for (slot, conn) in self.connections.iter() {
                    debug!(slot, peer = %conn.peer, "Dropping connection");
                }
                return Err(e);
            }
        }
    }

    /// One cycle: wait for readiness, then service the listener followed by
    /// every ready connection.
    ///
    /// Carried-over work (unread input, a failed accept) shortens the wait
    /// so it is picked up promptly.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = if !self.pending_reads.is_empty() {
            Some(Duration::ZERO)
        } else if self.retry_accept {
            Some(timeout.map_or(ACCEPT_RETRY_DELAY, |t| t.min(ACCEPT_RETRY_DELAY)))
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut listener_ready = std::mem::take(&mut self.retry_accept);
        let mut ready: Vec<(usize, bool, bool)> = std::mem::take(&mut self.pending_reads)
            .into_iter()
            .map(|slot| (slot, true, false))
            .collect();
        ready.sort_unstable();
        ready.dedup();

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => listener_ready = true,
                Token(slot) => match ready.iter_mut().find(|(s, _, _)| *s == slot) {
                    Some(entry) => {
                        entry.1 |= event.is_readable();
                        entry.2 |= event.is_writable();
                    }
                    None => ready.push((slot, event.is_readable(), event.is_writable())),
                },
            }
        }

        if listener_ready {
            self.accept_connections();
        }

        for (slot, readable, writable) in ready {
            if let Err(e) = self.handle_connection_event(slot, readable, writable) {
                debug!(slot, error = %e, "Connection error");
                self.close_connection(slot);
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = Connection::new(stream, peer, self.buffer_size);
                    let slot = match self.connections.add(conn) {
                        Ok(slot) => slot,
                        Err(TableFull(conn)) => {
                            warn!(peer = %conn.peer, "Connection limit reached, rejecting");
                            continue;
                        }
                    };

                    let conn = match self.connections.get_mut(slot) {
                        Some(conn) => conn,
                        None => continue,
                    };
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut conn.stream, Token(slot), Interest::READABLE)
                    {
                        error!(slot, error = %e, "Failed to register connection");
                        self.connections.remove(slot);
                        continue;
                    }

                    debug!(
                        slot,
                        peer = %peer,
                        active = self.connections.len(),
                        "Accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // No new edge arrives for connections already queued.
                    error!(error = %e, "Accept error, retrying next turn");
                    self.retry_accept = true;
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        slot: usize,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        if !self.connections.contains(slot) {
            return Ok(());
        }

        if readable {
            if let ConnStatus::Close = self.handle_readable(slot)? {
                self.close_connection(slot);
                return Ok(());
            }
        }

        if writable {
            self.handle_writable(slot)?;
        }

        Ok(())
    }

    /// Read one chunk and run every complete command it delivers.
    ///
    /// Commands stop running once the reply queue reaches its limit; the
    /// rest stay buffered until the peer reads.
    fn handle_readable(&mut self, slot: usize) -> io::Result<ConnStatus> {
        let limit = self.outbound_limit;
        let conn = self
            .connections
            .get_mut(slot)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let mut more = false;
        if !conn.closing && conn.outbound.len() < limit {
            match conn.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(slot, peer = %conn.peer, "Client closed connection");
                    return Ok(ConnStatus::Close);
                }
                Ok(n) => {
                    more = true;
                    let held = conn.inbound.len();
                    match conn.inbound.append(&self.read_buf[..n]) {
                        Append::Stored => {}
                        Append::Reset | Append::Dropped => {
                            warn!(
                                slot,
                                peer = %conn.peer,
                                discarded = held,
                                "Line buffer overflow, discarding"
                            );
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => more = true,
                Err(e) => return Err(e),
            }
        }

        while !conn.closing && conn.outbound.len() < limit {
            let line = match conn.inbound.take_line() {
                Some(line) => line,
                None => break,
            };
            let reply = process_line(line, &mut self.counter);
            conn.outbound.extend_from_slice(&reply.data);
            conn.closing = reply.close;
        }
        conn.inbound.compact();

        let again = !conn.closing && (more || conn.outbound.len() >= limit);
        self.flush_connection(slot, again)
    }

    fn handle_writable(&mut self, slot: usize) -> io::Result<()> {
        if let ConnStatus::Close = self.flush_connection(slot, false)? {
            self.close_connection(slot);
        }
        Ok(())
    }

    /// Push queued replies out and register the interest that matches what
    /// is left over.
    ///
    /// A connection whose queue is at the limit is only watched for
    /// writability. `read_again` queues the slot for another read when
    /// reading is allowed; resuming a paused connection always does.
    fn flush_connection(&mut self, slot: usize, read_again: bool) -> io::Result<ConnStatus> {
        let limit = self.outbound_limit;
        let conn = self
            .connections
            .get_mut(slot)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let drained = conn.flush()?;
        if drained && conn.closing {
            return Ok(ConnStatus::Close);
        }

        let interest = if conn.outbound.len() >= limit {
            Interest::WRITABLE
        } else if drained {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if interest.is_readable() && (read_again || !conn.interest.is_readable()) {
            self.pending_reads.push(slot);
        }
        if interest != conn.interest {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(slot), interest)?;
            conn.interest = interest;
        }

        Ok(ConnStatus::Open)
    }

    fn close_connection(&mut self, slot: usize) {
        if let Some(mut conn) = self.connections.remove(slot) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(slot, peer = %conn.peer, "Connection closed");
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
