//! Transport layer abstraction
//!
//! This module provides a transport abstraction that allows one server
//! engine to serve plaintext and encrypted connections. A [`Transport`]
//! opens listening sockets, a [`TransportListener`] produces streams via
//! accept (performing any handshake the adaptor requires), and a
//! [`TransportStream`] carries bytes.

use crate::error::Result;
use std::net::SocketAddr;

/// Transport trait for abstracting different transport types
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The listener type produced by this transport
    type Listener: TransportListener<Stream = Self::Stream>;

    /// The stream type produced by this transport's listeners
    type Stream: TransportStream;

    /// Default receive buffer size for connections on this transport
    const DEFAULT_RX_BUFFER_SIZE: usize;

    /// Open a listening socket bound to the given address.
    ///
    /// For IPv6 wildcard addresses the implementation attempts to clear the
    /// platform's `IPV6_V6ONLY` restriction so a single listener also
    /// services IPv4 clients; [`TransportListener::only_v6`] reports whether
    /// that succeeded.
    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener>;
}

/// Trait for listening sockets
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// The stream type produced by accept
    type Stream: TransportStream;

    /// Accept one incoming connection, completing any transport-level
    /// handshake before returning the stream.
    async fn accept(&self) -> Result<Self::Stream>;

    /// Get the local address the listener is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Whether an IPv6 listener is restricted to IPv6 traffic only
    /// (i.e. dual-stack was unavailable). Always false for IPv4 listeners.
    fn only_v6(&self) -> bool;
}

/// Capability of encrypted transports: a shared security context with a
/// password callback slot.
///
/// The callback is consulted lazily, whenever the context needs the
/// password (e.g. to unlock an encrypted private key during identity
/// loading), and binds the password to every connection using that shared
/// context.
pub trait SecureTransport: Transport {
    /// Register the callback the shared security context uses to obtain
    /// the password.
    fn set_password_callback(&self, callback: std::sync::Arc<dyn Fn() -> String + Send + Sync>);
}

/// Trait for transport streams
#[async_trait::async_trait]
pub trait TransportStream: Send + Sync + 'static {
    /// Read data from the stream
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all data to the stream
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush the stream
    async fn flush(&mut self) -> Result<()>;

    /// Close the stream
    async fn close(&mut self) -> Result<()>;

    /// Set the TCP no-delay option (disables the Nagle algorithm)
    fn set_nodelay(&self, enable: bool) -> Result<()>;

    /// Set the TCP keep-alive option
    fn set_keepalive(&self, enable: bool) -> Result<()>;

    /// Get the remote address
    fn remote_addr(&self) -> Result<SocketAddr>;

    /// Get the local address
    fn local_addr(&self) -> Result<SocketAddr>;
}
