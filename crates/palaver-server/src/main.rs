//! # Palaver Server
//!
//! Real-time chat message relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! palaver
//!
//! # Run with a config file in the working directory
//! # (palaver.toml, see config.rs for the search paths)
//! palaver
//!
//! # Run with environment variables
//! PALAVER_PORT=8080 PALAVER_HOST=0.0.0.0 palaver
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use palaver_core::{MemoryDirectory, MemoryStore, RoomId, UserId};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palaver=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Palaver relay on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Wire the in-memory collaborators from the seed section. A production
    // deployment supplies database-backed implementations here instead.
    let directory = Arc::new(MemoryDirectory::new());
    for user in &config.seed.users {
        directory.insert_token(user.token.clone(), UserId::from(user.id));
    }
    for room in &config.seed.rooms {
        let room_id = RoomId::from(room.id);
        directory.create_room(room_id);
        for member in &room.members {
            directory.add_participant(room_id, UserId::from(*member));
        }
    }
    if config.seed.users.is_empty() {
        tracing::warn!("No seeded credentials; every connection attempt will be refused");
    }
    let store = Arc::new(MemoryStore::new());

    // Start the server
    handlers::run_server(config, directory.clone(), directory, store).await?;

    Ok(())
}
