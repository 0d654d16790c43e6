//! Common imports for working with Harbor
//!
//! ```rust
//! use harbor_core::prelude::*;
//! ```

pub use crate::error::{ConfigError, ConnectionError, Error, Result};
pub use crate::event::{CloseReason, ConnectionId, Event, ServerEvent};
pub use crate::transport::{SecureTransport, Transport, TransportListener, TransportStream};
