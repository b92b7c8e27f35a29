//! Cancel the active ride.

use anyhow::Result;
use ride_client::RideNotice;
use std::path::Path;
use std::time::Duration;

use super::{describe, open_engine};
use crate::config::CliConfig;

/// Run the cancel command.
///
/// The ride is cancelled locally at once; this then waits for the server's
/// answer so the user learns about a refused cancel.
pub async fn run(data_dir: &Path) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let (mut engine, mut notices) = open_engine(data_dir, &config)?;

    let Some(booking_id) = engine.resume().await? else {
        println!("No active ride.");
        return Ok(());
    };
    engine.cancel_ride().await?;
    println!("Cancelling ride {booking_id}...");

    let deadline =
        tokio::time::Instant::now() + config.engine.request_timeout() + Duration::from_secs(1);
    loop {
        while let Ok(notice) = notices.try_recv() {
            match notice {
                RideNotice::CancelConfirmed { .. } => {
                    println!("Ride {booking_id} cancelled.");
                    return Ok(());
                }
                RideNotice::CommandFailed {
                    command: "cancel",
                    message,
                } => {
                    anyhow::bail!(
                        "Server did not accept the cancel ({message}). \
                         The ride is no longer tracked here; contact support if it continues."
                    );
                }
                other => tracing::debug!(notice = %describe(&other), "ignored during cancel"),
            }
        }
        if engine
            .step_or(tokio::time::sleep_until(deadline))
            .await
            .is_some()
        {
            anyhow::bail!("No answer from the server; ride {booking_id} was cancelled locally only");
        }
    }
}
