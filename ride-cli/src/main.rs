//! # ride-cli
//!
//! Command-line front end for the ridesync engine.
//!
//! ## Commands
//!
//! - `init`: Store participant id, role and endpoints
//! - `status`: Show configuration and the persisted ride
//! - `watch`: Follow the active ride
//! - `book`: Quote and book a ride (requester)
//! - `cancel`: Cancel the active ride
//! - `nearby`: List open rides near a point (provider)
//!
//! ## Example
//!
//! ```bash
//! # Configure as a customer
//! ride-cli init --participant 42 --role requester
//!
//! # Book and follow the ride
//! ride-cli book --pickup 12.9756,77.6050 --drop 12.9784,77.6408 --vehicle auto --watch
//!
//! # After a restart, pick the ride up again
//! ride-cli watch
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` (default `info`) to change the level.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ride_core::Role;
use ride_types::Coordinates;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{book, cancel, init, nearby, parse_point, status, watch};

/// Command-line front end for the ridesync engine.
#[derive(Parser, Debug)]
#[command(name = "ride-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the configuration and the active ride record
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    /// Books rides
    #[value(alias = "customer")]
    Requester,
    /// Serves rides
    #[value(alias = "driver")]
    Provider,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Requester => Role::Requester,
            RoleArg::Provider => Role::Provider,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store participant id, role and endpoints
    Init {
        /// Participant (account) id
        #[arg(long, short)]
        participant: String,

        /// Side of the ride this client plays
        #[arg(long, short, value_enum)]
        role: RoleArg,

        /// Broker WebSocket URL
        #[arg(long)]
        broker_url: Option<String>,

        /// Ride API base URL
        #[arg(long)]
        api_base: Option<String>,
    },

    /// Show configuration and the persisted ride
    Status,

    /// Follow the active ride until Ctrl-C
    Watch,

    /// Quote and book a ride
    Book {
        /// Pickup point as lat,lng
        #[arg(long, value_parser = parse_point)]
        pickup: Coordinates,

        /// Drop-off point as lat,lng
        #[arg(long, value_parser = parse_point)]
        drop: Coordinates,

        /// Pickup address label
        #[arg(long, default_value = "")]
        pickup_address: String,

        /// Drop-off address label
        #[arg(long, default_value = "")]
        drop_address: String,

        /// Vehicle class
        #[arg(long, default_value = "auto")]
        vehicle: String,

        /// Promo code
        #[arg(long)]
        promo: Option<String>,

        /// Keep following the ride after booking
        #[arg(long)]
        watch: bool,
    },

    /// Cancel the active ride
    Cancel,

    /// List open rides near a point
    Nearby {
        /// Search centre as lat,lng
        #[arg(long, value_parser = parse_point)]
        at: Coordinates,

        /// Search radius in km
        #[arg(long)]
        radius: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    match cli.command {
        Commands::Init {
            participant,
            role,
            broker_url,
            api_base,
        } => {
            init::run(
                &data_dir,
                &participant,
                role.into(),
                broker_url.as_deref(),
                api_base.as_deref(),
            )
            .await?;
        }
        Commands::Status => {
            status::run(&data_dir).await?;
        }
        Commands::Watch => {
            watch::run(&data_dir).await?;
        }
        Commands::Book {
            pickup,
            drop,
            pickup_address,
            drop_address,
            vehicle,
            promo,
            watch,
        } => {
            let trip = book::Trip {
                pickup,
                drop_off: drop,
                pickup_address,
                drop_address,
                vehicle_type: vehicle,
                promo_code: promo,
            };
            book::run(&data_dir, &trip, watch).await?;
        }
        Commands::Cancel => {
            cancel::run(&data_dir).await?;
        }
        Commands::Nearby { at, radius } => {
            nearby::run(&data_dir, at, radius).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for ride-cli.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "ridesync", "ride-cli")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
