//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection driver performs non-blocking reads and writes until they would
//! block. Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. The reactor owns the listener, the
//! connection registry and the store; nothing here is shared.

use crate::config::Config;
use crate::runtime::connection::{CloseReason, Connection, ConnectionRegistry, Directive};
use crate::storage::Store;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Counters kept by the reactor and logged on idle ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub requests: u64,
    pub protocol_errors: u64,
}

/// Stops a running reactor from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Ask the reactor to return from [`Reactor::run`] after its current tick.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded server: one poll, one listener, many connections.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    connections: ConnectionRegistry<TcpStream>,
    store: Store,
    poll_timeout: Duration,
    events_capacity: usize,
    stats: ReactorStats,
    /// Set when an accept drain stopped early; retried on the next tick.
    accept_pending: bool,
}

impl Reactor {
    /// Bind the listening socket and set up the poll instance.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen_addr(), config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            "Listening"
        );

        Ok(Self {
            poll,
            listener,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            connections: ConnectionRegistry::new(config.max_connections),
            store: Store::new(),
            poll_timeout: config.poll_timeout,
            events_capacity: config.events,
            stats: ReactorStats::default(),
            accept_pending: false,
        })
    }

    #[allow(dead_code)] // Only read by tests and embedders
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[allow(dead_code)] // The binary runs until killed
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            requested: Arc::clone(&self.shutdown),
        }
    }

    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    /// Run the event loop until shutdown is requested.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        let mut reported = self.stats;

        while !self.shutdown.load(Ordering::Acquire) {
            self.tick(&mut events)?;

            if events.is_empty() && self.stats != reported {
                debug!(
                    connections = self.connections.len(),
                    keys = self.store.len(),
                    accepted = self.stats.accepted,
                    rejected = self.stats.rejected,
                    closed = self.stats.closed,
                    requests = self.stats.requests,
                    protocol_errors = self.stats.protocol_errors,
                    "Idle tick"
                );
                reported = self.stats;
            }
        }

        info!(
            connections = self.connections.len(),
            requests = self.stats.requests,
            "Shutting down"
        );
        Ok(())
    }

    /// Wait for readiness once and dispatch whatever fired.
    fn tick(&mut self, events: &mut Events) -> io::Result<()> {
        match self.poll.poll(events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.accept_pending {
            self.accept_connections();
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_connections(),
                WAKER_TOKEN => {}
                Token(conn_id) => {
                    if let Err(e) = self.handle_connection_event(conn_id) {
                        debug!(conn_id, error = %e, "Re-registration failed");
                        self.close_connection(conn_id);
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        self.accept_pending = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let conn_id = match self.connections.insert(Connection::new(stream)) {
                        Ok(id) => id,
                        Err(_rejected) => {
                            warn!(peer = %peer, "Connection limit reached");
                            self.stats.rejected += 1;
                            continue;
                        }
                    };

                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            conn.stream_mut(),
                            Token(conn_id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    self.stats.accepted += 1;
                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The listener is edge-triggered: whatever is still queued
                    // will not be reported again, so retry on the next tick.
                    error!(error = %e, "Accept error, retrying next tick");
                    self.accept_pending = true;
                    break;
                }
            }
        }
    }

    /// Drive one connection and re-arm its interest if its state changed.
    fn handle_connection_event(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let before = conn.directive();
        let served = conn.requests();
        let after = conn.drive(&mut self.store);
        self.stats.requests += conn.requests() - served;

        let interest = match after {
            Directive::Close => {
                self.close_connection(conn_id);
                return Ok(());
            }
            _ if after == before => return Ok(()),
            Directive::WaitReadable => Interest::READABLE,
            Directive::WaitWritable => Interest::WRITABLE,
        };

        self.poll
            .registry()
            .reregister(conn.stream_mut(), Token(conn_id), interest)
    }

    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(conn_id, error = %e, "Failed to deregister connection");
        }

        match conn.close_reason() {
            Some(CloseReason::Protocol(e)) => {
                self.stats.protocol_errors += 1;
                warn!(conn_id, error = %e, "Protocol violation, closing connection");
            }
            Some(reason) => debug!(
                conn_id,
                peer = ?conn.stream().peer_addr().ok(),
                %reason,
                "Connection closed"
            ),
            None => debug!(conn_id, "Connection closed"),
        }
        self.stats.closed += 1;
        // Dropping `conn` closes the socket.
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog)?;

    Ok(socket.into())
}
