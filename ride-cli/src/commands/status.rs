//! Show local configuration and the persisted ride.

use anyhow::Result;
use ride_client::{FileSessionStore, SessionStore};
use std::path::Path;

use crate::config::{session_path, CliConfig};

/// Run the status command.
pub async fn run(data_dir: &Path) -> Result<()> {
    println!("=== ride-cli status ===");
    println!();

    let config = match CliConfig::load(data_dir).await {
        Ok(config) => config,
        Err(_) => {
            println!("Participant: NOT CONFIGURED");
            println!();
            println!("Run 'ride-cli init --participant <id> --role <role>' to configure.");
            return Ok(());
        }
    };

    println!("Participant:");
    println!("  ID:   {}", config.participant_id);
    println!("  Role: {}", config.role);
    println!();
    println!("Endpoints:");
    println!("  Broker: {}", config.engine.broker_url);
    println!("  API:    {}", config.engine.api_base);
    println!();

    let store = FileSessionStore::new(session_path(data_dir));
    match store.load().await {
        Ok(Some(booking_id)) => {
            println!("Active ride: {booking_id}");
            println!();
            println!("Run 'ride-cli watch' to follow it.");
        }
        Ok(None) => println!("Active ride: none"),
        Err(e) => println!("Active ride: unreadable ({e})"),
    }

    Ok(())
}
