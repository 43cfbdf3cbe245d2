//! Relay server binary
//!
//! Usage: `weave-relay [listen-addr]` (default 127.0.0.1:7777)

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use weave_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(arg) => RelayConfig {
            listen_addr: arg.parse::<SocketAddr>()?,
        },
        None => RelayConfig::default(),
    };
    RelayServer::new(config).run().await?;
    Ok(())
}
