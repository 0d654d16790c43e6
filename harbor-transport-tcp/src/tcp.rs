//! TCP transport implementation for Harbor
//!
//! Listening sockets are built through socket2 so the server can control
//! `SO_REUSEADDR` and, for IPv6 wildcard binds, probe whether the platform
//! honours clearing `IPV6_V6ONLY` (dual-stack).

use async_trait::async_trait;
use harbor_core::{
    transport::{Transport, TransportListener, TransportStream},
    Error, Result,
};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};

/// Listen backlog used for all Harbor listeners.
const LISTEN_BACKLOG: i32 = 128;

/// Build a listening socket with address reuse enabled.
///
/// For IPv6 addresses `IPV6_V6ONLY` is cleared so a single listener also
/// services IPv4 clients where the platform allows it; the effective value
/// is read back and returned, since some platforms silently refuse.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<(TokioTcpListener, bool)> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    let mut only_v6 = false;
    if addr.is_ipv6() {
        // Best effort: failure here just leaves the platform default.
        let _ = socket.set_only_v6(false);
        only_v6 = socket.only_v6().unwrap_or(true);
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    Ok((TokioTcpListener::from_std(listener)?, only_v6))
}

/// Plaintext TCP transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Listener = TcpTransportListener;
    type Stream = TcpStream;

    const DEFAULT_RX_BUFFER_SIZE: usize = 8192;

    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener> {
        let (listener, only_v6) = bind_listener(addr).map_err(Error::Io)?;
        let local_addr = listener.local_addr().map_err(Error::Io)?;
        Ok(TcpTransportListener {
            listener,
            local_addr,
            only_v6,
        })
    }
}

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TokioTcpListener,
    local_addr: SocketAddr,
    only_v6: bool,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpStream;

    async fn accept(&self) -> Result<Self::Stream> {
        let (stream, _addr) = self.listener.accept().await.map_err(Error::Io)?;
        Ok(TcpStream::from_tokio(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn only_v6(&self) -> bool {
        self.only_v6
    }
}

/// TCP stream implementation
#[derive(Debug)]
pub struct TcpStream {
    stream: Option<TokioTcpStream>,
    remote_addr: SocketAddr,
}

impl TcpStream {
    /// Create a new TCP stream from a tokio TCP stream
    pub fn from_tokio(stream: TokioTcpStream) -> Self {
        let remote_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());

        Self {
            stream: Some(stream),
            remote_addr,
        }
    }

    fn inner(&self) -> Result<&TokioTcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| Error::Transport("stream not connected".to_string()))
    }
}

#[async_trait]
impl TransportStream for TcpStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncReadExt;
                let n = stream.read(buf).await.map_err(Error::Io)?;
                Ok(n)
            }
            None => Err(Error::Transport("stream not connected".to_string())),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.write_all(buf).await.map_err(Error::Io)?;
                Ok(())
            }
            None => Err(Error::Transport("stream not connected".to_string())),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match &mut self.stream {
            Some(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.flush().await.map_err(Error::Io)?;
                Ok(())
            }
            None => Err(Error::Transport("stream not connected".to_string())),
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
        self.inner()?.set_nodelay(enable).map_err(Error::Io)
    }

    fn set_keepalive(&self, enable: bool) -> Result<()> {
        let stream = self.inner()?;
        SockRef::from(stream)
            .set_keepalive(enable)
            .map_err(Error::Io)
    }

    fn remote_addr(&self) -> Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner()?.local_addr().map_err(Error::Io)
    }
}
