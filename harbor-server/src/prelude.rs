//! Common imports for building Harbor servers
//!
//! ```rust
//! use harbor_server::prelude::*;
//! ```

pub use crate::config::ServerConfig;
pub use crate::connection::{ConnectionHandle, ConnectionMetadata, ConnectionState};
pub use crate::server::{ErrorCallback, EventCallback, Server};

pub use harbor_core::prelude::*;
pub use harbor_core::Bytes;
