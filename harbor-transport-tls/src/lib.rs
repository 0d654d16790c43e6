//! TLS transport for Harbor
//!
//! Provides the encrypted [`TlsTransport`] and the process-wide
//! [`TlsContext`] whose password callback unlocks encrypted private keys.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod context;
mod tls;

pub use context::{PasswordCallback, TlsContext};
pub use tls::{TlsStream, TlsTransport, TlsTransportListener};
