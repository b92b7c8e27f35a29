//! Quote and book a ride.

use anyhow::{Context, Result};
use ride_types::{BookingRequest, Coordinates, FareQuote};
use std::path::Path;

use super::{open_engine, watch};
use crate::config::CliConfig;

/// Where to go and in what.
#[derive(Debug, Clone)]
pub struct Trip {
    /// Pickup point.
    pub pickup: Coordinates,
    /// Drop-off point.
    pub drop_off: Coordinates,
    /// Pickup label.
    pub pickup_address: String,
    /// Drop-off label.
    pub drop_address: String,
    /// Vehicle class to book.
    pub vehicle_type: String,
    /// Optional promo code.
    pub promo_code: Option<String>,
}

impl Trip {
    fn request(&self, config: &CliConfig, fare: Option<f64>) -> BookingRequest {
        BookingRequest {
            customer_id: config.participant_id.clone(),
            pickup_location: self.pickup_address.clone(),
            drop_location: self.drop_address.clone(),
            pickup_lat: self.pickup.lat,
            pickup_lng: self.pickup.lng,
            drop_lat: self.drop_off.lat,
            drop_lng: self.drop_off.lng,
            vehicle_type: self.vehicle_type.clone(),
            fare,
            promo_code: self.promo_code.clone(),
        }
    }
}

/// Run the book command.
pub async fn run(data_dir: &Path, trip: &Trip, follow: bool) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let (mut engine, mut notices) = open_engine(data_dir, &config)?;
    if let Some(active) = engine.resume().await? {
        anyhow::bail!("Ride {active} is still active. Run 'ride-cli cancel' first.");
    }

    let quotes = engine.quote(&trip.request(&config, None)).await?;
    print_quotes(&quotes);
    let fare = pick_fare(&quotes, &trip.vehicle_type)
        .with_context(|| format!("No quote for vehicle type {:?}", trip.vehicle_type))?;

    let booking_id = engine.book(&trip.request(&config, Some(fare))).await?;
    println!();
    println!("Booked ride {booking_id} ({}, {fare:.2}).", trip.vehicle_type);

    if follow {
        println!("Waiting for a driver. Ctrl-C to stop.");
        watch::follow(&mut engine, &mut notices).await
    } else {
        watch::print_pending(&mut notices);
        println!("Run 'ride-cli watch' to follow it.");
        Ok(())
    }
}

fn print_quotes(quotes: &[FareQuote]) {
    println!("Quotes:");
    for quote in quotes {
        match quote.eta_minutes {
            Some(eta) => println!("  {:<6} {:>8.2}  ({eta} min)", quote.vehicle_type, quote.fare),
            None => println!("  {:<6} {:>8.2}", quote.vehicle_type, quote.fare),
        }
    }
}

/// Fare quoted for `vehicle_type` (case-insensitive).
fn pick_fare(quotes: &[FareQuote], vehicle_type: &str) -> Option<f64> {
    quotes
        .iter()
        .find(|q| q.vehicle_type.eq_ignore_ascii_case(vehicle_type))
        .map(|q| q.fare)
}
