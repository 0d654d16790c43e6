//! Server-side connection state and I/O task
//!
//! A [`Connection`] is the bookkeeping half: identity, state, counters and
//! the receive buffer the application drains. The byte-moving half is a
//! spawned I/O task that owns the transport stream, drains the outbound
//! queue, enforces the idle timeout and reports lifecycle events to the
//! owning server over its inbound channel.
//!
//! The application never holds a connection strongly: it only ever sees a
//! [`ConnectionHandle`], a connection id plus a weak reference that must be
//! upgraded on every use and fails once the server has reaped the
//! connection.

use bytes::{Bytes, BytesMut};
use harbor_core::{
    CloseReason, ConnectionError, ConnectionId, Error, Event, Result, ServerEvent, TransportStream,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Idle duration used when the timeout is disabled (zero).
const IDLE_FOREVER: Duration = Duration::from_secs(86400 * 365);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Allocated, accept not yet completed
    Pending,
    /// Accepted and started
    Connected,
    /// Close initiated, not yet finished
    Closing,
    /// Closed; about to be reaped from the registry
    Closed,
}

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// When the connection object was created
    pub established_at: Instant,
    /// Bytes written to the peer
    pub bytes_sent: u64,
    /// Bytes read from the peer
    pub bytes_received: u64,
}

/// A message from a connection (or the accept path) to the server loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A lifecycle event to relay to the application
    Event(ServerEvent),
    /// A connection-level error to relay verbatim
    Error {
        id: ConnectionId,
        error: Error,
    },
}

/// Socket options applied once, at connection start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartOptions {
    pub no_delay: bool,
    pub keep_alive: bool,
    pub timeout_ms: u64,
}

/// One accepted (or pending) connection.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    state: ConnectionState,
    metadata: ConnectionMetadata,
    rx_buffer: BytesMut,
    rx_buffer_size: usize,
    tx: mpsc::Sender<Bytes>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("rx_buffered", &self.rx_buffer.len())
            .finish()
    }
}

impl Connection {
    /// Create a pending connection.
    ///
    /// The receive-buffer size given here only sizes the initial buffer;
    /// the effective size is re-read when the connection is established, so
    /// a change between accepts reaches the very next connection.
    pub(crate) fn new(
        id: ConnectionId,
        rx_buffer_size: usize,
        tx_queue_depth: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(tx_queue_depth);
        (
            Self {
                id,
                remote_addr: None,
                state: ConnectionState::Pending,
                metadata: ConnectionMetadata {
                    established_at: Instant::now(),
                    bytes_sent: 0,
                    bytes_received: 0,
                },
                rx_buffer: BytesMut::with_capacity(rx_buffer_size),
                rx_buffer_size,
                tx,
            },
            rx,
        )
    }

    /// The connection's stable identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's address, once the accept has completed
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Metadata snapshot
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Size of the receive buffer this connection was created with
    pub fn rx_buffer_size(&self) -> usize {
        self.rx_buffer_size
    }

    /// Drain and return everything received since the last call.
    ///
    /// The buffer holds at most `rx_buffer_size` bytes; data that arrives
    /// while the buffer is full evicts the oldest bytes.
    pub fn take_received(&mut self) -> Bytes {
        self.rx_buffer.split().freeze()
    }

    /// Append received data, evicting the oldest bytes once the buffer
    /// exceeds its configured size.
    pub(crate) fn push_received(&mut self, bytes: &[u8]) {
        self.metadata.bytes_received += bytes.len() as u64;
        self.rx_buffer.extend_from_slice(bytes);
        let excess = self.rx_buffer.len().saturating_sub(self.rx_buffer_size);
        if excess > 0 {
            let _ = self.rx_buffer.split_to(excess);
        }
    }

    pub(crate) fn mark_established(&mut self, remote_addr: SocketAddr, rx_buffer_size: usize) {
        self.remote_addr = Some(remote_addr);
        self.rx_buffer_size = rx_buffer_size;
        self.state = ConnectionState::Connected;
    }
}

/// Weak, non-owning handle to a connection.
///
/// Cheap to clone; every operation upgrades the weak reference and fails
/// with [`ConnectionError::Closed`] once the connection has been reaped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    inner: Weak<Mutex<Connection>>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, inner: Weak<Mutex<Connection>>) -> Self {
        Self { id, inner }
    }

    /// A handle for a connection that was never established (accept failed).
    pub(crate) fn dangling(id: ConnectionId) -> Self {
        Self {
            id,
            inner: Weak::new(),
        }
    }

    /// The connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection is still registered with its server
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    fn upgrade(&self) -> Result<Arc<Mutex<Connection>>> {
        self.inner
            .upgrade()
            .ok_or(Error::Connection(ConnectionError::Closed))
    }

    /// Queue bytes for transmission.
    ///
    /// The bytes are written and flushed by the connection's I/O task; a
    /// `Sent` event is raised once the flush completes.
    pub fn send(&self, bytes: Bytes) -> Result<()> {
        let conn = self.upgrade()?;
        let conn = conn.lock().unwrap();
        if conn.state == ConnectionState::Closed {
            return Err(Error::Connection(ConnectionError::Closed));
        }
        conn.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Connection(ConnectionError::QueueFull),
            mpsc::error::TrySendError::Closed(_) => Error::Connection(ConnectionError::Closed),
        })
    }

    /// Drain the receive buffer
    pub fn take_received(&self) -> Result<Bytes> {
        let conn = self.upgrade()?;
        let mut conn = conn.lock().unwrap();
        Ok(conn.take_received())
    }

    /// The peer's address
    pub fn remote_addr(&self) -> Result<SocketAddr> {
        let conn = self.upgrade()?;
        let conn = conn.lock().unwrap();
        conn.remote_addr
            .ok_or(Error::Connection(ConnectionError::NotStarted))
    }

    /// Current connection state
    pub fn state(&self) -> Result<ConnectionState> {
        let conn = self.upgrade()?;
        let conn = conn.lock().unwrap();
        Ok(conn.state())
    }
}

/// Apply socket options and spawn the connection's I/O task.
///
/// Called exactly once per connection, immediately after its accept
/// completes.
pub(crate) fn start<S: TransportStream>(
    conn: Arc<Mutex<Connection>>,
    stream: S,
    outbound: mpsc::Receiver<Bytes>,
    opts: StartOptions,
    inbound: mpsc::Sender<Inbound>,
) {
    let (id, rx_buffer_size) = {
        let c = conn.lock().unwrap();
        (c.id(), c.rx_buffer_size())
    };

    if let Err(e) = stream.set_nodelay(opts.no_delay) {
        crate::log_warn!("connection {id}: set_nodelay failed: {e}");
    }
    if let Err(e) = stream.set_keepalive(opts.keep_alive) {
        crate::log_warn!("connection {id}: set_keepalive failed: {e}");
    }

    // The task holds only a weak reference. When the server drops its
    // strong one (reap or close), the outbound sender inside Connection
    // goes with it and the task observes a closed queue.
    tokio::spawn(io_loop(
        Arc::downgrade(&conn),
        stream,
        outbound,
        opts.timeout_ms,
        inbound,
        id,
        rx_buffer_size,
    ));
}

enum Step {
    Read(Result<usize>),
    Queued(Option<Bytes>),
    TimedOut,
}

async fn io_loop<S: TransportStream>(
    conn: Weak<Mutex<Connection>>,
    mut stream: S,
    mut outbound: mpsc::Receiver<Bytes>,
    timeout_ms: u64,
    inbound: mpsc::Sender<Inbound>,
    id: ConnectionId,
    rx_buffer_size: usize,
) {
    let idle = if timeout_ms == 0 {
        IDLE_FOREVER
    } else {
        Duration::from_millis(timeout_ms)
    };
    let mut buf = vec![0u8; rx_buffer_size];

    let reason = loop {
        let step = {
            let read = stream.read(&mut buf);
            tokio::select! {
                r = tokio::time::timeout(idle, read) => match r {
                    Ok(r) => Step::Read(r),
                    Err(_) => Step::TimedOut,
                },
                q = outbound.recv() => Step::Queued(q),
            }
        };

        match step {
            Step::Read(Ok(0)) => break CloseReason::Peer,
            Step::Read(Ok(n)) => {
                let bytes = Bytes::copy_from_slice(&buf[..n]);
                if let Some(c) = conn.upgrade() {
                    c.lock().unwrap().push_received(&bytes);
                }
                let event = ServerEvent {
                    id,
                    event: Event::Received { bytes },
                };
                if inbound.send(Inbound::Event(event)).await.is_err() {
                    break CloseReason::Shutdown;
                }
            }
            Step::Read(Err(error)) => {
                let _ = inbound.send(Inbound::Error { id, error }).await;
                break CloseReason::Error;
            }
            Step::TimedOut => break CloseReason::Timeout,
            // All senders dropped: the server removed us or shut down.
            Step::Queued(None) => break CloseReason::Shutdown,
            Step::Queued(Some(bytes)) => {
                let written = async {
                    stream.write_all(&bytes).await?;
                    stream.flush().await
                }
                .await;
                match written {
                    Ok(()) => {
                        if let Some(c) = conn.upgrade() {
                            c.lock().unwrap().metadata.bytes_sent += bytes.len() as u64;
                        }
                        let event = ServerEvent {
                            id,
                            event: Event::Sent,
                        };
                        if inbound.send(Inbound::Event(event)).await.is_err() {
                            break CloseReason::Shutdown;
                        }
                    }
                    Err(error) => {
                        let _ = inbound.send(Inbound::Error { id, error }).await;
                        break CloseReason::Error;
                    }
                }
            }
        }
    };

    if let Some(c) = conn.upgrade() {
        c.lock().unwrap().state = ConnectionState::Closing;
    }
    let _ = stream.close().await;
    if let Some(c) = conn.upgrade() {
        c.lock().unwrap().state = ConnectionState::Closed;
    }

    let event = ServerEvent {
        id,
        event: Event::Closed(reason),
    };
    let _ = inbound.send(Inbound::Event(event)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_connection() {
        let (conn, _rx) = Connection::new(ConnectionId(1), 4096, 8);
        assert_eq!(conn.id(), ConnectionId(1));
        assert_eq!(conn.state(), ConnectionState::Pending);
        assert_eq!(conn.rx_buffer_size(), 4096);
        assert!(conn.remote_addr().is_none());
    }

    #[test]
    fn test_handle_fails_after_drop() {
        let (conn, _rx) = Connection::new(ConnectionId(2), 4096, 8);
        let conn = Arc::new(Mutex::new(conn));
        let handle = ConnectionHandle::new(ConnectionId(2), Arc::downgrade(&conn));

        assert!(handle.is_alive());
        drop(conn);
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.send(Bytes::from_static(b"x")),
            Err(Error::Connection(ConnectionError::Closed))
        ));
    }

    #[test]
    fn test_take_received_drains() {
        let (mut conn, _rx) = Connection::new(ConnectionId(3), 4096, 8);
        conn.rx_buffer.extend_from_slice(b"hello");
        assert_eq!(conn.take_received(), Bytes::from_static(b"hello"));
        assert!(conn.take_received().is_empty());
    }

    #[test]
    fn test_rx_buffer_is_bounded() {
        let (mut conn, _rx) = Connection::new(ConnectionId(4), 4, 8);
        conn.push_received(b"abcd");
        conn.push_received(b"ef");

        // The oldest bytes are evicted; the drainable data never exceeds
        // the configured size.
        assert_eq!(conn.take_received(), Bytes::from_static(b"cdef"));
        assert_eq!(conn.metadata().bytes_received, 6);

        conn.push_received(b"0123456789");
        assert_eq!(conn.take_received(), Bytes::from_static(b"6789"));
    }

    #[test]
    fn test_dangling_handle() {
        let handle = ConnectionHandle::dangling(ConnectionId(9));
        assert_eq!(handle.id(), ConnectionId(9));
        assert!(!handle.is_alive());
        assert!(handle.take_received().is_err());
    }
}
