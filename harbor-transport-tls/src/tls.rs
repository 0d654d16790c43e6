//! TLS transport implementation for Harbor
//!
//! A TLS listener is a TCP listener plus a rustls acceptor built from the
//! shared [`TlsContext`]. The acceptor is constructed on first accept so the
//! context (identity files, password callback) can be configured after the
//! server has started listening.

use crate::context::TlsContext;
use async_trait::async_trait;
use harbor_core::{
    transport::{Transport, TransportListener, TransportStream},
    ConnectionError, Error, Result,
};
use harbor_transport_tcp::bind_listener;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Encrypted transport over rustls.
#[derive(Debug, Clone, Copy)]
pub struct TlsTransport {
    context: &'static TlsContext,
}

impl TlsTransport {
    /// Create a TLS transport backed by the process-wide shared context.
    pub fn new() -> Self {
        Self {
            context: TlsContext::shared(),
        }
    }

    /// The security context this transport hands to its listeners.
    pub fn context(&self) -> &'static TlsContext {
        self.context
    }
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl harbor_core::SecureTransport for TlsTransport {
    fn set_password_callback(
        &self,
        callback: std::sync::Arc<dyn Fn() -> String + Send + Sync>,
    ) {
        self.context.set_password_callback(callback);
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Listener = TlsTransportListener;
    type Stream = TlsStream;

    const DEFAULT_RX_BUFFER_SIZE: usize = 16384;

    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener> {
        let (listener, only_v6) = bind_listener(addr).map_err(Error::Io)?;
        let local_addr = listener.local_addr().map_err(Error::Io)?;
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Ok(TlsTransportListener {
            listener,
            local_addr,
            only_v6,
            context: self.context,
            acceptor: Mutex::new(None),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
        })
    }
}

/// A bound, listening TLS socket.
///
/// Handshakes run on spawned tasks and completed streams are delivered
/// through a queue, so an `accept` future dropped mid-wait never discards a
/// connection whose handshake is in flight.
pub struct TlsTransportListener {
    listener: TokioTcpListener,
    local_addr: SocketAddr,
    only_v6: bool,
    context: &'static TlsContext,
    acceptor: Mutex<Option<TlsAcceptor>>,
    ready_tx: mpsc::UnboundedSender<Result<TlsStream>>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<TlsStream>>>,
}

impl std::fmt::Debug for TlsTransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransportListener")
            .field("local_addr", &self.local_addr)
            .field("only_v6", &self.only_v6)
            .finish()
    }
}

impl TlsTransportListener {
    fn acceptor(&self) -> Result<TlsAcceptor> {
        let mut slot = self.acceptor.lock().unwrap();
        if let Some(acceptor) = slot.as_ref() {
            return Ok(acceptor.clone());
        }
        let acceptor = TlsAcceptor::from(self.context.server_config()?);
        *slot = Some(acceptor.clone());
        Ok(acceptor)
    }
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    type Stream = TlsStream;

    async fn accept(&self) -> Result<Self::Stream> {
        let mut ready = self.ready_rx.lock().await;
        loop {
            tokio::select! {
                done = ready.recv() => {
                    // The sender lives in self, so recv only fails once the
                    // listener itself is being torn down.
                    return done
                        .unwrap_or(Err(Error::Connection(ConnectionError::ListenerClosed)));
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted.map_err(Error::Io)?;
                    let acceptor = self.acceptor()?;
                    let ready_tx = self.ready_tx.clone();
                    tokio::spawn(async move {
                        let result = acceptor
                            .accept(stream)
                            .await
                            .map(TlsStream::from_server_tls_stream)
                            .map_err(|e| {
                                Error::Transport(format!("TLS handshake failed: {e}"))
                            });
                        let _ = ready_tx.send(result);
                    });
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn only_v6(&self) -> bool {
        self.only_v6
    }
}

/// TLS stream implementation
pub struct TlsStream {
    stream: Option<tokio_rustls::server::TlsStream<TokioTcpStream>>,
    remote_addr: SocketAddr,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl TlsStream {
    /// Create a new TLS stream from a completed server-side handshake
    pub fn from_server_tls_stream(stream: tokio_rustls::server::TlsStream<TokioTcpStream>) -> Self {
        let remote_addr = stream
            .get_ref()
            .0
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());

        Self {
            stream: Some(stream),
            remote_addr,
        }
    }

    fn tcp(&self) -> Result<&TokioTcpStream> {
        self.stream
            .as_ref()
            .map(|s| s.get_ref().0)
            .ok_or_else(|| Error::Transport("TLS stream not connected".to_string()))
    }
}

#[async_trait]
impl TransportStream for TlsStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncReadExt;
                let n = stream.read(buf).await.map_err(Error::Io)?;
                Ok(n)
            }
            None => Err(Error::Transport("TLS stream not connected".to_string())),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.write_all(buf).await.map_err(Error::Io)?;
                Ok(())
            }
            None => Err(Error::Transport("TLS stream not connected".to_string())),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.flush().await.map_err(Error::Io)?;
                Ok(())
            }
            None => Err(Error::Transport("TLS stream not connected".to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            stream.shutdown().await.map_err(Error::Io)?;
        }
        Ok(())
    }

    fn set_nodelay(&self, enable: bool) -> Result<()> {
        self.tcp()?.set_nodelay(enable).map_err(Error::Io)
    }

    fn set_keepalive(&self, enable: bool) -> Result<()> {
        SockRef::from(self.tcp()?)
            .set_keepalive(enable)
            .map_err(Error::Io)
    }

    fn remote_addr(&self) -> Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp()?.local_addr().map_err(Error::Io)
    }
}
