//! Integration tests for the server engine
//!
//! Engine-level behavior (registry membership, event ordering, timeouts,
//! shutdown) is exercised against an in-memory mock transport; the listener
//! plumbing is exercised against the real TCP transport on loopback.

use async_trait::async_trait;
use bytes::Bytes;
use harbor_core::{
    CloseReason, ConnectionId, Error, Event, Result, Transport, TransportListener, TransportStream,
};
use harbor_server::{Server, ServerConfig};
use harbor_transport_tcp::TcpTransport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

/// In-memory transport: the test side injects duplex streams that the
/// listener then hands out from accept.
struct MockTransport {
    incoming: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
}

struct MockConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl MockTransport {
    fn new() -> (Self, MockConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: Mutex::new(Some(rx)),
            },
            MockConnector { tx },
        )
    }
}

impl MockConnector {
    /// Open a client connection to the mock listener. Best effort: after
    /// the server closes, the stream is silently discarded, like a SYN
    /// arriving at a closed socket.
    fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        let _ = self.tx.send(server);
        client
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Listener = MockListener;
    type Stream = MockStream;

    const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

    async fn listen(&self, _addr: SocketAddr) -> Result<Self::Listener> {
        let incoming = self
            .incoming
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Transport("mock already listening".to_string()))?;
        Ok(MockListener {
            incoming: tokio::sync::Mutex::new(incoming),
        })
    }
}

struct MockListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

#[async_trait]
impl TransportListener for MockListener {
    type Stream = MockStream;

    async fn accept(&self) -> Result<Self::Stream> {
        let stream = self.incoming.lock().await.recv().await.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "mock listener closed",
            ))
        })?;
        Ok(MockStream {
            stream: Some(stream),
        })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:9".parse().unwrap())
    }

    fn only_v6(&self) -> bool {
        // Pretend dual-stack worked so the engine opens no second listener.
        false
    }
}

struct MockStream {
    stream: Option<DuplexStream>,
}

impl MockStream {
    fn inner(&mut self) -> Result<&mut DuplexStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Transport("mock stream closed".to_string()))
    }
}

#[async_trait]
impl TransportStream for MockStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner()?.read(buf).await.map_err(Error::Io)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner()?.write_all(buf).await.map_err(Error::Io)
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner()?.flush().await.map_err(Error::Io)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn set_nodelay(&self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn set_keepalive(&self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn remote_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:9".parse().unwrap())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:9".parse().unwrap())
    }
}

/// Wraps the mock transport with a listener whose first accept fails with
/// a non-cancelled I/O error; later accepts delegate to the mock.
struct FailOnceTransport {
    inner: MockTransport,
}

struct FailOnceListener {
    inner: MockListener,
    failed: AtomicBool,
}

#[async_trait]
impl Transport for FailOnceTransport {
    type Listener = FailOnceListener;
    type Stream = MockStream;

    const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener> {
        Ok(FailOnceListener {
            inner: self.inner.listen(addr).await?,
            failed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TransportListener for FailOnceListener {
    type Stream = MockStream;

    async fn accept(&self) -> Result<Self::Stream> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "accept: out of descriptors",
            )));
        }
        self.inner.accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn only_v6(&self) -> bool {
        self.inner.only_v6()
    }
}

/// What a test observes about a connection's lifecycle. Errors record
/// whether the handle could still be upgraded inside the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Connected(ConnectionId),
    Received(ConnectionId, Bytes),
    Sent(ConnectionId),
    Closed(ConnectionId, CloseReason),
    Error(ConnectionId, bool),
}

fn recording_server<T: Transport>(transport: T) -> (Server<T>, mpsc::UnboundedReceiver<Observed>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let event_tx = tx.clone();
    let server = Server::with_callbacks(
        transport,
        Arc::new(move |event, handle| {
            let observed = match event {
                Event::Connected => Observed::Connected(handle.id()),
                Event::Received { bytes } => Observed::Received(handle.id(), bytes),
                Event::Sent => Observed::Sent(handle.id()),
                Event::Closed(reason) => Observed::Closed(handle.id(), reason),
            };
            let _ = event_tx.send(observed);
        }),
        Arc::new(move |_error, handle| {
            let _ = tx.send(Observed::Error(handle.id(), handle.is_alive()));
        }),
    );
    (server, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_accept_registers_and_reports_connected() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let _client = connector.connect();

    let observed = next(&mut events).await;
    let id = match observed {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };
    assert_eq!(server.connection_count(), 1);
    assert!(server.connection(id).is_some());
    assert_eq!(server.connection_ids(), vec![id]);

    server.close();
}

#[tokio::test]
async fn test_peer_close_reaps_connection() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let client = connector.connect();
    let id = match next(&mut events).await {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };

    drop(client);
    assert_eq!(
        next(&mut events).await,
        Observed::Closed(id, CloseReason::Peer)
    );

    // Reaped: the id is gone and no further events arrive for it.
    assert_eq!(server.connection_count(), 0);
    assert!(server.connection(id).is_none());

    server.close();
}

#[tokio::test]
async fn test_received_data_and_echo() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let mut client = connector.connect();
    let id = match next(&mut events).await {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };

    client.write_all(b"ping").await.unwrap();
    client.flush().await.unwrap();

    let bytes = match next(&mut events).await {
        Observed::Received(got, bytes) => {
            assert_eq!(got, id);
            bytes
        }
        other => panic!("expected Received, got {other:?}"),
    };
    assert_eq!(bytes, Bytes::from_static(b"ping"));

    // The handle drains the same bytes the event carried.
    let handle = server.connection(id).unwrap();
    assert_eq!(handle.take_received().unwrap(), Bytes::from_static(b"ping"));
    assert!(handle.take_received().unwrap().is_empty());

    // Queue a reply and wait for the flush confirmation.
    handle.send(Bytes::from_static(b"pong")).unwrap();
    assert_eq!(next(&mut events).await, Observed::Sent(id));

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    server.close();
}

#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.set_timeout(50);
    server.accept_connections(0, false).await.unwrap();

    let _client = connector.connect();
    let id = match next(&mut events).await {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };

    assert_eq!(
        next(&mut events).await,
        Observed::Closed(id, CloseReason::Timeout)
    );
    assert_eq!(server.connection_count(), 0);

    server.close();
}

#[tokio::test]
async fn test_rx_buffer_size_applies_to_later_connections_only() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let mut first = connector.connect();
    let first_id = match next(&mut events).await {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };

    // Shrinking the buffer must not affect the established connection.
    server.set_rx_buffer_size(4);

    first.write_all(b"0123456789").await.unwrap();
    first.flush().await.unwrap();
    match next(&mut events).await {
        Observed::Received(id, bytes) => {
            assert_eq!(id, first_id);
            assert_eq!(bytes, Bytes::from_static(b"0123456789"));
        }
        other => panic!("expected Received, got {other:?}"),
    }

    // A connection accepted afterwards reads at most 4 bytes at a time.
    let mut second = connector.connect();
    match next(&mut events).await {
        Observed::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    second.write_all(b"0123456789").await.unwrap();
    second.flush().await.unwrap();

    let mut total = 0usize;
    while total < 10 {
        match next(&mut events).await {
            Observed::Received(_, bytes) => {
                assert!(bytes.len() <= 4);
                total += bytes.len();
            }
            other => panic!("expected Received, got {other:?}"),
        }
    }
    assert_eq!(total, 10);

    server.close();
}

#[tokio::test]
async fn test_close_is_idempotent_and_empties_registry() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let _a = connector.connect();
    let _b = connector.connect();
    for _ in 0..2 {
        match next(&mut events).await {
            Observed::Connected(_) => {}
            other => panic!("expected Connected, got {other:?}"),
        }
    }
    assert_eq!(server.connection_count(), 2);

    server.close();
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_listening_v6());
    assert!(!server.is_listening_v4());

    // Closing again is a no-op.
    server.close();
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_close_suppresses_pending_completions() {
    let (transport, connector) = MockTransport::new();
    let (server, mut events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    server.close();
    // A connection arriving after close must not surface any callback.
    let _late = connector.connect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_accept_failure_relays_error_and_recovers() {
    let (inner, connector) = MockTransport::new();
    let (server, mut events) = recording_server(FailOnceTransport { inner });
    server.accept_connections(0, false).await.unwrap();

    // The failed accept reaches the error callback while the unestablished
    // connection is still alive, so its handle can be inspected.
    match next(&mut events).await {
        Observed::Error(_, alive) => assert!(alive),
        other => panic!("expected Error, got {other:?}"),
    }

    // The loop re-arms and the next accept succeeds.
    let _client = connector.connect();
    match next(&mut events).await {
        Observed::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 1);

    server.close();
}

#[tokio::test]
async fn test_accept_while_listening_is_rejected() {
    let (transport, _connector) = MockTransport::new();
    let (server, _events) = recording_server(transport);
    server.accept_connections(0, false).await.unwrap();

    let err = server.accept_connections(0, false).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    server.close();
}

#[tokio::test]
async fn test_config_seeds_settings() {
    let config = ServerConfig {
        timeout_ms: 50,
        ..ServerConfig::default()
    };
    let (transport, connector) = MockTransport::new();
    let (tx, mut events) = mpsc::unbounded_channel();
    let server = Server::with_config(transport, config).unwrap();
    server.set_event_callback(Arc::new(move |event, handle| {
        if let Event::Closed(reason) = event {
            let _ = tx.send(Observed::Closed(handle.id(), reason));
        }
    }));
    server.accept_connections(0, false).await.unwrap();

    let _client = connector.connect();
    match next(&mut events).await {
        Observed::Closed(_, CloseReason::Timeout) => {}
        other => panic!("expected timeout close, got {other:?}"),
    }

    server.close();
}

#[tokio::test]
async fn test_tcp_ipv4_only_listener() {
    let (server, mut events) = recording_server(TcpTransport::new());
    tokio_test::assert_ok!(server.accept_connections(0, true).await);

    assert!(!server.is_listening_v6());
    assert!(server.is_listening_v4());
    let addr = server.local_addr().expect("listening");
    assert_ne!(addr.port(), 0);

    // Full loopback round trip over the real transport.
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let id = match next(&mut events).await {
        Observed::Connected(id) => id,
        other => panic!("expected Connected, got {other:?}"),
    };
    assert_eq!(server.connection_count(), 1);
    let handle = server.connection(id).unwrap();
    assert!(handle.remote_addr().unwrap().ip().is_loopback());

    client.write_all(b"hello").await.unwrap();
    match next(&mut events).await {
        Observed::Received(got, bytes) => {
            assert_eq!(got, id);
            assert_eq!(bytes, Bytes::from_static(b"hello"));
        }
        other => panic!("expected Received, got {other:?}"),
    }

    drop(client);
    assert_eq!(
        next(&mut events).await,
        Observed::Closed(id, CloseReason::Peer)
    );
    assert_eq!(server.connection_count(), 0);

    server.close();
}

#[test]
fn test_with_config_rejects_invalid_values() {
    let (transport, _connector) = MockTransport::new();
    let config = ServerConfig {
        rx_buffer_size: 0,
        ..ServerConfig::default()
    };
    let err = Server::with_config(transport, config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_password_reaches_shared_tls_context() {
    use harbor_transport_tls::{TlsContext, TlsTransport};

    let server = Server::new(TlsTransport::new());
    server.set_password("correct horse battery staple");

    assert_eq!(
        server.password().as_deref(),
        Some("correct horse battery staple")
    );
    // The shared context retrieves the same string through its callback.
    assert_eq!(
        TlsContext::shared().password().as_deref(),
        Some("correct horse battery staple")
    );
}

#[tokio::test]
async fn test_tcp_dual_stack_opens_one_socket_when_possible() {
    let (server, _events) = recording_server(TcpTransport::new());
    server.accept_connections(0, false).await.unwrap();

    // At least one family must be listening, and when dual-stack IPv6
    // succeeded no separate IPv4 socket is opened.
    assert!(server.is_listening_v6() || server.is_listening_v4());
    if server.is_listening_v6() {
        assert!(server.local_addr().unwrap().is_ipv6());
    }

    server.close();
}
