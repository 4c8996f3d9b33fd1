//! `concierge-relay` -- development relay for the chat session layer.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin concierge-relay
//!
//! # Run on custom address
//! cargo run --bin concierge-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! CONCIERGE_RELAY_ADDR=127.0.0.1:8080 cargo run --bin concierge-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use concierge_proto::message::{RoomCode, UserId};
use concierge_relay::broker::Broker;
use concierge_relay::config::{RelayCliArgs, RelayConfig};
use concierge_relay::server::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting concierge relay");

    let broker = Arc::new(Broker::new());
    for (room, owner) in &config.seed_rooms {
        broker.create_room(&RoomCode::new(room.as_str()), &UserId::new(owner.as_str()));
        tracing::info!(room = %room, owner = %owner, "seeded room");
    }
    let state = Arc::new(RelayState::new(broker).with_max_frame_size(config.max_frame_size));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    }
}
