//! Harbor server
//!
//! A transport-agnostic, connection-oriented server core. The engine binds
//! dual-stack listeners, accepts connections over any [`Transport`]
//! implementation, tracks them in an id-keyed registry, and relays their
//! lifecycle events and errors to the application through callbacks.
//!
//! ```no_run
//! use harbor_server::prelude::*;
//! use harbor_transport_tcp::TcpTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> harbor_core::Result<()> {
//!     let server = Server::new(TcpTransport::new());
//!     server.set_event_callback(Arc::new(|event, handle| {
//!         if let Event::Received { bytes } = event {
//!             let _ = handle.send(bytes);
//!         }
//!     }));
//!     server.set_error_callback(Arc::new(|error, handle| {
//!         eprintln!("connection {}: {error}", handle.id());
//!     }));
//!     server.accept_connections(8080, false).await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     server.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod logging;
pub mod registry;
pub mod server;

pub mod prelude;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionMetadata, ConnectionState};
pub use registry::ConnectionRegistry;
pub use server::{ErrorCallback, EventCallback, Server};

pub use harbor_core::{
    CloseReason, ConnectionId, Error, Event, Result, SecureTransport, ServerEvent, Transport,
};
