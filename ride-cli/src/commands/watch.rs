//! Follow the active ride until interrupted.

use anyhow::Result;
use ride_client::RideNotice;
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{describe, open_engine, CliEngine};
use crate::config::CliConfig;

/// Run the watch command.
pub async fn run(data_dir: &Path) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let (mut engine, mut notices) = open_engine(data_dir, &config)?;

    match engine.resume().await? {
        Some(booking_id) => println!("Following ride {booking_id}. Ctrl-C to stop."),
        None => println!("No active ride. Waiting for updates. Ctrl-C to stop."),
    }
    follow(&mut engine, &mut notices).await
}

/// Drive the engine and print notices until Ctrl-C.
pub async fn follow(
    engine: &mut CliEngine,
    notices: &mut UnboundedReceiver<RideNotice>,
) -> Result<()> {
    let mut last_distance = None;
    loop {
        print_pending(notices);

        if let Some(km) = engine.counterpart_distance_km() {
            let rounded = (km * 10.0).round() / 10.0;
            if last_distance != Some(rounded) {
                println!("Counterpart is {rounded:.1} km away");
                last_distance = Some(rounded);
            }
        }

        if let Some(result) = engine.step_or(tokio::signal::ctrl_c()).await {
            result?;
            println!();
            println!("Stopped. The ride stays active; run 'ride-cli watch' to resume.");
            return Ok(());
        }
    }
}

/// Print every queued notice.
pub fn print_pending(notices: &mut UnboundedReceiver<RideNotice>) {
    while let Ok(notice) = notices.try_recv() {
        println!("{}", describe(&notice));
    }
}
