//! Tandem relay: routes protocol frames between the peers of each room.
//!
//! Environment:
//! - `TANDEM_RELAY_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `TANDEM_MAX_PEERS`: peers admitted per room (default 100)
//! - `RUST_LOG`: log filter, read by `env_logger`

use log::{error, info, warn};
use tandem_collab::server::{RelayServer, ServerConfig};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(raw) = std::env::var("TANDEM_MAX_PEERS") {
        match raw.parse() {
            Ok(max) => config.max_peers_per_room = max,
            Err(e) => warn!("Ignoring TANDEM_MAX_PEERS={raw}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = RelayServer::new(config_from_env());
    info!("Starting Tandem relay on {}...", server.bind_addr());

    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
