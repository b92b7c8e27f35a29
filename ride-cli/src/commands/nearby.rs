//! List open rides near a point (provider).

use anyhow::Result;
use ride_types::{Coordinates, NearbyQuery, RideSnapshot};
use std::path::Path;

use super::open_engine;
use crate::config::CliConfig;

/// Run the nearby command.
pub async fn run(data_dir: &Path, at: Coordinates, radius_km: Option<f64>) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let (engine, _notices) = open_engine(data_dir, &config)?;

    let mut query = NearbyQuery::around(at);
    if let Some(radius) = radius_km {
        if !(radius.is_finite() && radius > 0.0) {
            anyhow::bail!("Radius must be a positive number of kilometres");
        }
        query.radius = radius;
    }

    let rides = engine.nearby(&query).await?;
    if rides.is_empty() {
        println!("No open rides within {:.1} km.", query.radius);
        return Ok(());
    }
    println!("Open rides within {:.1} km:", query.radius);
    for ride in &rides {
        println!("  {}", summarize(ride, at));
    }
    Ok(())
}

/// One table row for a ride.
fn summarize(ride: &RideSnapshot, from: Coordinates) -> String {
    let id = ride
        .booking_id
        .as_ref()
        .map_or_else(|| "?".to_string(), ToString::to_string);
    let distance = ride
        .pickup()
        .map(|p| format!("{:.1} km", from.distance_km(&p)))
        .unwrap_or_else(|| "-".to_string());
    let fare = ride
        .fare
        .map(|f| format!("{f:.2}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{id:<10} {distance:>8}  {fare:>8}  {} -> {}",
        ride.pickup_location.as_deref().unwrap_or("?"),
        ride.drop_location.as_deref().unwrap_or("?"),
    )
}
