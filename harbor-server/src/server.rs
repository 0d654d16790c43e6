//! The server accept/lifecycle engine
//!
//! A [`Server`] owns up to two listening sockets (IPv6 and IPv4), drives the
//! accept loop, holds the authoritative registry of live connections and
//! relays every connection's lifecycle events and errors to the owning
//! application.
//!
//! All registry mutations and callback invocations happen on one spawned
//! loop task, which serializes accepts against event dispatch the way a
//! strand would; `close()` only flips the shutdown flag and clears the
//! registry under its lock.

use crate::config::ServerConfig;
use crate::connection::{self, Connection, ConnectionHandle, Inbound, StartOptions};
use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use harbor_core::{
    ConfigError, ConnectionId, Error, Event, Result, SecureTransport, ServerEvent, Transport,
    TransportListener, TransportStream,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Application callback invoked for every connection lifecycle event.
pub type EventCallback = Arc<dyn Fn(Event, ConnectionHandle) + Send + Sync>;

/// Application callback invoked for every relayed error.
pub type ErrorCallback = Arc<dyn Fn(Error, ConnectionHandle) + Send + Sync>;

/// Depth of the per-server inbound event channel.
const INBOUND_DEPTH: usize = 256;

#[derive(Debug, Clone)]
struct Settings {
    rx_buffer_size: usize,
    timeout_ms: u64,
    no_delay: bool,
    keep_alive: bool,
    tx_queue_depth: usize,
    password: Option<String>,
}

struct ServerShared {
    registry: ConnectionRegistry,
    settings: Mutex<Settings>,
    event_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    shutdown: Notify,
    closed: AtomicBool,
    listening_v6: AtomicBool,
    listening_v4: AtomicBool,
    local_addr_v6: Mutex<Option<SocketAddr>>,
    local_addr_v4: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("connections", &self.registry.len())
            .field("listening_v6", &self.listening_v6.load(Ordering::SeqCst))
            .field("listening_v4", &self.listening_v4.load(Ordering::SeqCst))
            .finish()
    }
}

/// A connection allocated ahead of its accept completion.
///
/// Never a member of the registry; it transitions into the registry
/// atomically with successful acceptance, or is discarded.
struct PendingConnection {
    id: ConnectionId,
    conn: Arc<Mutex<Connection>>,
    outbound_rx: mpsc::Receiver<Bytes>,
}

impl PendingConnection {
    fn allocate(shared: &ServerShared) -> Self {
        let (rx_buffer_size, tx_queue_depth) = {
            let settings = shared.settings.lock().unwrap();
            (settings.rx_buffer_size, settings.tx_queue_depth)
        };
        let id = shared.registry.allocate_id();
        let (conn, outbound_rx) = Connection::new(id, rx_buffer_size, tx_queue_depth);
        Self {
            id,
            conn: Arc::new(Mutex::new(conn)),
            outbound_rx,
        }
    }

    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.id, Arc::downgrade(&self.conn))
    }
}

/// Transport-agnostic, connection-oriented server core.
pub struct Server<T: Transport> {
    transport: Arc<T>,
    shared: Arc<ServerShared>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("shared", &self.shared).finish()
    }
}

impl<T: Transport> Server<T> {
    /// Create a server with no callbacks.
    ///
    /// The event and error callbacks must be set before
    /// [`accept_connections`](Server::accept_connections) is called;
    /// events delivered while a callback is unset are dropped.
    pub fn new(transport: T) -> Self {
        Self::build(transport, ServerConfig::default())
    }

    /// Create a server with both callbacks supplied up front.
    pub fn with_callbacks(
        transport: T,
        event_callback: EventCallback,
        error_callback: ErrorCallback,
    ) -> Self {
        let server = Self::new(transport);
        server.set_event_callback(event_callback);
        server.set_error_callback(error_callback);
        server
    }

    /// Create a server seeded from a configuration.
    ///
    /// Fails when the configuration is invalid (zero receive-buffer size
    /// or transmit-queue depth).
    pub fn with_config(transport: T, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: T, config: ServerConfig) -> Self {
        let rx_buffer_size = if config.rx_buffer_size == ServerConfig::default().rx_buffer_size {
            T::DEFAULT_RX_BUFFER_SIZE
        } else {
            config.rx_buffer_size
        };
        Self {
            transport: Arc::new(transport),
            shared: Arc::new(ServerShared {
                registry: ConnectionRegistry::new(),
                settings: Mutex::new(Settings {
                    rx_buffer_size,
                    timeout_ms: config.timeout_ms,
                    no_delay: config.no_delay,
                    keep_alive: config.keep_alive,
                    tx_queue_depth: config.tx_queue_depth,
                    password: None,
                }),
                event_callback: Mutex::new(None),
                error_callback: Mutex::new(None),
                shutdown: Notify::new(),
                closed: AtomicBool::new(false),
                listening_v6: AtomicBool::new(false),
                listening_v4: AtomicBool::new(false),
                local_addr_v6: Mutex::new(None),
                local_addr_v4: Mutex::new(None),
            }),
            loop_task: Mutex::new(None),
        }
    }

    /// Set the event callback
    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.shared.event_callback.lock().unwrap() = Some(callback);
    }

    /// Set the error callback
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.shared.error_callback.lock().unwrap() = Some(callback);
    }

    /// Set the receive buffer size for future connections
    pub fn set_rx_buffer_size(&self, size: usize) {
        self.shared.settings.lock().unwrap().rx_buffer_size = size;
    }

    /// Set the TCP no-delay status for future connections
    pub fn set_no_delay(&self, enable: bool) {
        self.shared.settings.lock().unwrap().no_delay = enable;
    }

    /// Set the TCP keep-alive status for future connections
    pub fn set_keep_alive(&self, enable: bool) {
        self.shared.settings.lock().unwrap().keep_alive = enable;
    }

    /// Set the timeout, in milliseconds, for future connections.
    /// Zero disables the timeout.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.settings.lock().unwrap().timeout_ms = timeout_ms;
    }

    /// Open the listening sockets on `port` and start accepting.
    ///
    /// Unless `ipv4_only` is set, an IPv6 listener is opened with the
    /// platform's v6-only restriction cleared so it also services IPv4
    /// clients. An IPv4 listener is additionally opened when the IPv6
    /// listener failed or turned out to be v6-only. The accept loop starts
    /// unconditionally; with no usable listener it stays inert.
    ///
    /// Returns the IPv6 path's error when that path failed; the IPv4
    /// fallback's own error is logged but not surfaced (first error wins).
    pub async fn accept_connections(&self, port: u16, ipv4_only: bool) -> Result<()> {
        let previous = self.loop_task.lock().unwrap().take();
        if let Some(task) = previous {
            if !task.is_finished() && !self.shared.closed.load(Ordering::SeqCst) {
                // put it back; the caller is misusing the API
                *self.loop_task.lock().unwrap() = Some(task);
                return Err(Error::Config(ConfigError::Validation(
                    "server is already listening".to_string(),
                )));
            }
            let _ = task.await;
        }
        self.shared.closed.store(false, Ordering::SeqCst);

        let mut first_error: Option<Error> = None;

        let mut listener_v6 = None;
        if !ipv4_only {
            let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
            match self.transport.listen(addr).await {
                Ok(listener) => listener_v6 = Some(listener),
                Err(e) => {
                    crate::log_warn!("IPv6 listener on port {port} failed: {e}");
                    first_error = Some(e);
                }
            }
        }

        // Open the IPv4 listener if the IPv6 listener is not open or it
        // only supports IPv6.
        let need_v4 = match &listener_v6 {
            None => true,
            Some(listener) => listener.only_v6(),
        };

        let mut listener_v4 = None;
        if need_v4 {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match self.transport.listen(addr).await {
                Ok(listener) => listener_v4 = Some(listener),
                Err(e) => {
                    crate::log_warn!("IPv4 listener on port {port} failed: {e}");
                }
            }
        }

        self.shared
            .listening_v6
            .store(listener_v6.is_some(), Ordering::SeqCst);
        self.shared
            .listening_v4
            .store(listener_v4.is_some(), Ordering::SeqCst);
        *self.shared.local_addr_v6.lock().unwrap() =
            listener_v6.as_ref().and_then(|l| l.local_addr().ok());
        *self.shared.local_addr_v4.lock().unwrap() =
            listener_v4.as_ref().and_then(|l| l.local_addr().ok());

        // Start the loop even with no listeners; it is inert until close.
        let task = tokio::spawn(run_loop::<T>(self.shared.clone(), listener_v6, listener_v4));
        *self.loop_task.lock().unwrap() = Some(task);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop listening and drop every connection.
    ///
    /// Idempotent: closing an already-closed server is a no-op. Pending
    /// accept completions after this point are swallowed.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.notify_one();
        self.shared.listening_v6.store(false, Ordering::SeqCst);
        self.shared.listening_v4.store(false, Ordering::SeqCst);
        *self.shared.local_addr_v6.lock().unwrap() = None;
        *self.shared.local_addr_v4.lock().unwrap() = None;
        self.shared.registry.clear();
    }

    /// Whether the IPv6 listener is open
    pub fn is_listening_v6(&self) -> bool {
        self.shared.listening_v6.load(Ordering::SeqCst)
    }

    /// Whether the IPv4 listener is open
    pub fn is_listening_v4(&self) -> bool {
        self.shared.listening_v4.load(Ordering::SeqCst)
    }

    /// The bound address of the IPv6 listener, falling back to the IPv4
    /// listener's. `None` when not listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .local_addr_v6
            .lock()
            .unwrap()
            .or(*self.shared.local_addr_v4.lock().unwrap())
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Look up a live connection by id
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.shared.registry.get(id)
    }

    /// Ids of all live connections
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }
}

impl<T: SecureTransport> Server<T> {
    /// Set the private-key password and register it with the transport's
    /// shared security context, which retrieves it lazily during identity
    /// loading. Binds the password to all connections using that context.
    pub fn set_password(&self, password: impl Into<String>) {
        self.shared.settings.lock().unwrap().password = Some(password.into());

        let shared = Arc::downgrade(&self.shared);
        self.transport.set_password_callback(Arc::new(move || {
            shared
                .upgrade()
                .and_then(|s| s.settings.lock().unwrap().password.clone())
                .unwrap_or_default()
        }));
    }

    /// The configured password, if any
    pub fn password(&self) -> Option<String> {
        self.shared.settings.lock().unwrap().password.clone()
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Race both open listeners for a single accept; whichever completes first
/// claims the pending connection, and the losing accept future is dropped,
/// so a second completion can never target an already-claimed slot.
async fn accept_race<T: Transport>(
    v6: &Option<T::Listener>,
    v4: &Option<T::Listener>,
) -> Result<T::Stream> {
    match (v6, v4) {
        (Some(a), Some(b)) => tokio::select! {
            r = a.accept() => r,
            r = b.accept() => r,
        },
        (Some(a), None) => a.accept().await,
        (None, Some(b)) => b.accept().await,
        (None, None) => std::future::pending().await,
    }
}

async fn run_loop<T: Transport>(
    shared: Arc<ServerShared>,
    listener_v6: Option<T::Listener>,
    listener_v4: Option<T::Listener>,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(INBOUND_DEPTH);
    let has_listeners = listener_v6.is_some() || listener_v4.is_some();
    let mut pending: Option<PendingConnection> = None;

    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        // Keep exactly one pending connection allocated while listening.
        if pending.is_none() && has_listeners {
            pending = Some(PendingConnection::allocate(&shared));
        }

        tokio::select! {
            _ = shared.shutdown.notified() => break,
            msg = inbound_rx.recv() => {
                if let Some(msg) = msg {
                    dispatch(&shared, msg);
                }
            }
            result = accept_race::<T>(&listener_v6, &listener_v4), if has_listeners => {
                if shared.closed.load(Ordering::SeqCst) {
                    // Completion raced our own shutdown: swallow it.
                    break;
                }
                match result {
                    Ok(stream) => {
                        if let Some(p) = pending.take() {
                            establish::<T>(&shared, p, stream, inbound_tx.clone());
                        }
                    }
                    Err(error) => {
                        if error.is_cancelled() {
                            continue;
                        }
                        crate::log_warn!("accept failed: {error}");
                        // The unestablished connection outlives the callback,
                        // so the handle it receives is still upgradeable.
                        let claimed = pending.take();
                        let handle = claimed
                            .as_ref()
                            .map(|p| p.handle())
                            .unwrap_or_else(|| ConnectionHandle::dangling(ConnectionId(0)));
                        let callback = shared.error_callback.lock().unwrap().clone();
                        if let Some(callback) = callback {
                            callback(error, handle);
                        }
                        drop(claimed);
                        // A fresh pending connection is allocated on the
                        // next iteration, so transient failures self-heal.
                    }
                }
            }
        }
    }
    // Listeners and the pending slot drop here; outstanding accepts are
    // cancelled by the sockets closing.
}

/// Start an accepted connection and move it into the registry.
fn establish<T: Transport>(
    shared: &Arc<ServerShared>,
    pending: PendingConnection,
    stream: T::Stream,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    let remote_addr = stream
        .remote_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());

    let (opts, rx_buffer_size) = {
        let settings = shared.settings.lock().unwrap();
        (
            StartOptions {
                no_delay: settings.no_delay,
                keep_alive: settings.keep_alive,
                timeout_ms: settings.timeout_ms,
            },
            settings.rx_buffer_size,
        )
    };

    pending
        .conn
        .lock()
        .unwrap()
        .mark_established(remote_addr, rx_buffer_size);
    let handle = shared.registry.insert(pending.id, pending.conn.clone());
    crate::log_debug!("accepted connection {} from {remote_addr}", pending.id);

    connection::start(pending.conn, stream, pending.outbound_rx, opts, inbound_tx);

    // Relayed inline so Connected always precedes the first Received.
    let callback = shared.event_callback.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(Event::Connected, handle);
    }
}

/// Relay one inbound message to the application, reaping on `Closed`.
fn dispatch(shared: &Arc<ServerShared>, msg: Inbound) {
    match msg {
        Inbound::Event(ServerEvent { id, event }) => {
            let handle = shared
                .registry
                .get(id)
                .unwrap_or_else(|| ConnectionHandle::dangling(id));

            // Observation happens before reaping, so the application can
            // inspect the connection's final state.
            let closed = event.is_closed();
            let callback = shared.event_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(event, handle);
            }

            if closed {
                // Idempotent: a second Closed for the same id is a no-op.
                if shared.registry.remove(id).is_some() {
                    crate::log_debug!("connection {id} removed");
                }
            }
        }
        Inbound::Error { id, error } => {
            let handle = shared
                .registry
                .get(id)
                .unwrap_or_else(|| ConnectionHandle::dangling(id));
            let callback = shared.error_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(error, handle);
            }
        }
    }
}
