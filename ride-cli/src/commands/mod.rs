//! CLI command implementations.

pub mod book;
pub mod cancel;
pub mod init;
pub mod nearby;
pub mod status;
pub mod watch;

use anyhow::{Context, Result};
use ride_client::{FileSessionStore, HttpRideApi, RideEngine, RideNotice, StompTransport};
use ride_types::Coordinates;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{session_path, CliConfig};

/// Engine wired to the real broker, API and the data-dir session file.
pub type CliEngine = RideEngine<StompTransport>;

/// Build an engine from the stored configuration.
pub fn open_engine(
    data_dir: &Path,
    config: &CliConfig,
) -> Result<(CliEngine, UnboundedReceiver<RideNotice>)> {
    let api = HttpRideApi::new(config.engine.api_base.clone(), config.engine.request_timeout())
        .context("Failed to create HTTP client")?;
    Ok(RideEngine::new(
        config.engine.clone(),
        config.role,
        config.participant_id.clone(),
        Arc::new(StompTransport::new()),
        Arc::new(api),
        Arc::new(FileSessionStore::new(session_path(data_dir))),
    ))
}

/// Parse a `lat,lng` argument.
pub fn parse_point(value: &str) -> Result<Coordinates, String> {
    let (lat, lng) = value
        .split_once(',')
        .ok_or_else(|| format!("expected <lat>,<lng>, got {value:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("bad latitude: {e}"))?;
    let lng: f64 = lng.trim().parse().map_err(|e| format!("bad longitude: {e}"))?;
    let point = Coordinates::new(lat, lng);
    if !point.is_valid() {
        return Err(format!("coordinates out of range: {lat},{lng}"));
    }
    Ok(point)
}

/// One-line rendering of a notice.
pub fn describe(notice: &RideNotice) -> String {
    match notice {
        RideNotice::PhaseChanged { from, to } => format!("Phase: {from} -> {to}"),
        RideNotice::CodeAvailable { booking_id, code } => {
            format!("Verification code for {booking_id}: {code}")
        }
        RideNotice::CodePending { booking_id } => {
            format!("Fetching verification code for {booking_id}...")
        }
        RideNotice::Resumed { booking_id, phase } => {
            format!("Resumed ride {booking_id} ({phase})")
        }
        RideNotice::Connected => "Live updates connected".to_string(),
        RideNotice::Reconnecting { failures: 0 } => "Connection lost, reconnecting...".to_string(),
        RideNotice::Reconnecting { failures } => {
            format!("Reconnecting (attempt {failures} failed)...")
        }
        RideNotice::RealtimeUnavailable { failures } => format!(
            "Live updates unavailable after {failures} attempts; refreshing periodically"
        ),
        RideNotice::RideUnreachable {
            booking_id,
            silent_for,
        } => format!(
            "No news about ride {booking_id} for {} minutes",
            silent_for.as_secs() / 60
        ),
        RideNotice::RideRequested(ride) => format!(
            "Ride request {}: {} -> {}{}",
            ride.booking_id
                .as_ref()
                .map_or_else(|| "?".to_string(), ToString::to_string),
            ride.pickup_location.as_deref().unwrap_or("?"),
            ride.drop_location.as_deref().unwrap_or("?"),
            ride.fare.map(|f| format!(" ({f:.2})")).unwrap_or_default()
        ),
        RideNotice::Chat(message) => format!(
            "[chat] {}: {}",
            message
                .sender_name
                .clone()
                .unwrap_or_else(|| message.sender_id.to_string()),
            message.message
        ),
        RideNotice::CancelConfirmed { booking_id } => format!("Ride {booking_id} cancelled"),
        RideNotice::CommandFailed { command, message } => {
            format!("{command} failed: {message}")
        }
        RideNotice::Finished(summary) => match summary.fare {
            Some(fare) => format!("Ride {} completed, fare {fare:.2}", summary.booking_id),
            None => format!("Ride {} completed", summary.booking_id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride_core::{RidePhase, RideSummary};
    use ride_types::{BookingId, RideSnapshot};
    use std::time::Duration;

    #[test]
    fn parses_points() {
        let point = parse_point("12.9716, 77.5946").unwrap();
        assert!((point.lat - 12.9716).abs() < 1e-9);
        assert!((point.lng - 77.5946).abs() < 1e-9);

        assert!(parse_point("12.97").is_err());
        assert!(parse_point("north,77.5").is_err());
        assert!(parse_point("95.0,77.5").is_err());
    }

    #[test]
    fn describes_phase_changes() {
        let line = describe(&RideNotice::PhaseChanged {
            from: RidePhase::Booking,
            to: RidePhase::Tracking,
        });
        assert!(line.contains("->"));
    }

    #[test]
    fn describes_link_loss_and_failed_attempts_differently() {
        let lost = describe(&RideNotice::Reconnecting { failures: 0 });
        let failed = describe(&RideNotice::Reconnecting { failures: 3 });
        assert!(lost.contains("lost"));
        assert!(failed.contains("attempt 3"));
    }

    #[test]
    fn describes_unreachable_in_minutes() {
        let line = describe(&RideNotice::RideUnreachable {
            booking_id: BookingId::new("BK1"),
            silent_for: Duration::from_secs(600),
        });
        assert!(line.contains("10 minutes"));
    }

    #[test]
    fn describes_ride_requests_with_missing_fields() {
        let line = describe(&RideNotice::RideRequested(RideSnapshot {
            booking_id: Some(BookingId::new("BK2")),
            pickup_location: Some("MG Road".into()),
            ..Default::default()
        }));
        assert_eq!(line, "Ride request BK2: MG Road -> ?");
    }

    #[test]
    fn describes_finished_rides() {
        let line = describe(&RideNotice::Finished(RideSummary {
            booking_id: BookingId::new("BK3"),
            fare: Some(142.5),
            counterpart_id: None,
            counterpart_name: None,
        }));
        assert_eq!(line, "Ride BK3 completed, fare 142.50");
    }
}
