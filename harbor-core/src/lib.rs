//! Harbor core
//!
//! Shared vocabulary for the Harbor crates: the error taxonomy, the
//! connection lifecycle events, and the transport trait family that lets
//! plaintext and encrypted variants share one server engine.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod error;
pub mod event;
pub mod transport;

pub mod prelude;

pub use error::{ConfigError, ConnectionError, Error, Result};
pub use event::{CloseReason, ConnectionId, Event, ServerEvent};
pub use transport::{SecureTransport, Transport, TransportListener, TransportStream};

pub use bytes::Bytes;
