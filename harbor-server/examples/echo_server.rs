//! Echo server over plain TCP
//!
//! Run with:
//! ```text
//! cargo run --example echo_server
//! ```
//! then connect with `nc localhost 8080` and type lines.

use harbor_server::prelude::*;
use harbor_server::{logging::init_logging, log_info};
use harbor_transport_tcp::TcpTransport;
use std::sync::Arc;

#[tokio::main]
async fn main() -> harbor_core::Result<()> {
    init_logging().ok();

    let server = Server::with_callbacks(
        TcpTransport::new(),
        Arc::new(|event, handle| match event {
            Event::Connected => {
                log_info!("connection {} established", handle.id());
            }
            Event::Received { bytes } => {
                // Echo straight back; Sent confirms the flush later.
                if let Err(e) = handle.send(bytes) {
                    log_info!("connection {}: echo failed: {e}", handle.id());
                }
            }
            Event::Sent => {}
            Event::Closed(reason) => {
                log_info!("connection {} closed ({reason:?})", handle.id());
            }
        }),
        Arc::new(|error, handle| {
            log_info!("connection {}: {error}", handle.id());
        }),
    );

    server.accept_connections(8080, false).await?;
    log_info!(
        "echo server listening on {}",
        server.local_addr().expect("listening")
    );

    tokio::signal::ctrl_c().await.ok();
    server.close();
    Ok(())
}
