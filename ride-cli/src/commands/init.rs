//! Create the participant configuration.

use anyhow::Result;
use ride_core::Role;
use ride_types::ParticipantId;
use std::path::Path;

use crate::config::CliConfig;

/// Run the init command.
pub async fn run(
    data_dir: &Path,
    participant: &str,
    role: Role,
    broker_url: Option<&str>,
    api_base: Option<&str>,
) -> Result<()> {
    if CliConfig::exists(data_dir).await {
        anyhow::bail!(
            "Already configured. Delete {} to reconfigure.",
            CliConfig::path(data_dir).display()
        );
    }
    let participant = participant.trim();
    if participant.is_empty() {
        anyhow::bail!("Participant id must not be empty");
    }

    let mut config = CliConfig::new(ParticipantId::new(participant), role);
    if let Some(url) = broker_url {
        config.engine = config.engine.with_broker_url(url);
    }
    if let Some(base) = api_base {
        config.engine = config.engine.with_api_base(base);
    }
    config.engine.validate()?;
    config.save(data_dir).await?;

    println!("Configuration saved.");
    println!();
    println!("  Participant: {}", config.participant_id);
    println!("  Role:        {}", config.role);
    println!("  Broker:      {}", config.engine.broker_url);
    println!("  API:         {}", config.engine.api_base);
    println!("  Data dir:    {}", data_dir.display());
    println!();
    println!("Next steps:");
    match role {
        Role::Requester => println!("  Book a ride: ride-cli book --pickup <lat,lng> --drop <lat,lng>"),
        Role::Provider => println!("  Find rides:  ride-cli nearby --at <lat,lng>"),
    }

    Ok(())
}
