//! Server configuration
//!
//! Knobs that apply uniformly to every future connection. Mutable at any
//! time through the server's setters; already-accepted connections keep the
//! values they were started with.

use harbor_core::error::{ConfigError, Error};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Receive buffer size for future connections, in bytes
    pub rx_buffer_size: usize,
    /// Connection timeout in milliseconds; zero disables the timeout
    pub timeout_ms: u64,
    /// TCP no-delay (disables the Nagle algorithm) for future connections
    pub no_delay: bool,
    /// TCP keep-alive for future connections
    pub keep_alive: bool,
    /// Depth of each connection's outbound transmit queue
    pub tx_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: 8192,
            timeout_ms: 0,
            no_delay: false,
            keep_alive: false,
            tx_queue_depth: 32,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> harbor_core::Result<()> {
        if self.rx_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Validation(
                "rx_buffer_size must be greater than 0".to_string(),
            )));
        }

        if self.tx_queue_depth == 0 {
            return Err(Error::Config(ConfigError::Validation(
                "tx_queue_depth must be greater than 0".to_string(),
            )));
        }

        Ok(())
    }
}
