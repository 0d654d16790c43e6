//! TCP transport for Harbor
//!
//! Provides the plaintext [`TcpTransport`] consumed by `harbor-server`.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod tcp;

pub use tcp::{bind_listener, TcpStream, TcpTransport, TcpTransportListener};
