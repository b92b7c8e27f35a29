//! Payloads exchanged with the ride resource API and the pub/sub broker.
//!
//! Field names follow the server's camelCase JSON. Every field of
//! [`RideSnapshot`] is optional because push events routinely carry only a
//! partial ride; merging partial snapshots into the local session is the
//! receiver's job, not the decoder's.

use serde::{Deserialize, Serialize};

use crate::{BookingId, ClientMessageId, Coordinates, ParticipantId, TypesError};

/// Server-side ride status as reported by the ride resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    /// Booked, waiting for a provider.
    #[serde(alias = "REQUESTED", alias = "SEARCHING")]
    Pending,
    /// A provider accepted the ride.
    #[serde(alias = "ASSIGNED", alias = "ARRIVED")]
    Accepted,
    /// Verification code checked, trip under way.
    #[serde(alias = "STARTED", alias = "ONGOING")]
    InProgress,
    /// Trip finished.
    Completed,
    /// Ride cancelled by either party or the server.
    #[serde(alias = "CANCELED")]
    Cancelled,
    /// Any status this client does not know about.
    #[serde(other)]
    Unknown,
}

impl RideStatus {
    /// COMPLETED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// A (possibly partial) snapshot of the server's ride resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideSnapshot {
    /// The ride's booking id.
    #[serde(default, alias = "rideId", skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    /// Server status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RideStatus>,
    /// Requesting participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<ParticipantId>,
    /// Assigned provider, once matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<ParticipantId>,
    /// Requester display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Provider display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
    /// Provider phone number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_phone: Option<String>,
    /// Vehicle registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_number: Option<String>,
    /// Vehicle class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
    /// Provider rating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_rating: Option<f64>,
    /// Human readable pickup address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_location: Option<String>,
    /// Human readable drop address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_location: Option<String>,
    /// Pickup latitude.
    #[serde(default, alias = "pickupLatitude", skip_serializing_if = "Option::is_none")]
    pub pickup_lat: Option<f64>,
    /// Pickup longitude.
    #[serde(default, alias = "pickupLongitude", skip_serializing_if = "Option::is_none")]
    pub pickup_lng: Option<f64>,
    /// Drop latitude.
    #[serde(default, alias = "dropLatitude", skip_serializing_if = "Option::is_none")]
    pub drop_lat: Option<f64>,
    /// Drop longitude.
    #[serde(default, alias = "dropLongitude", skip_serializing_if = "Option::is_none")]
    pub drop_lng: Option<f64>,
    /// Provider's last known latitude.
    #[serde(default, alias = "driverLatitude", skip_serializing_if = "Option::is_none")]
    pub driver_lat: Option<f64>,
    /// Provider's last known longitude.
    #[serde(default, alias = "driverLongitude", skip_serializing_if = "Option::is_none")]
    pub driver_lng: Option<f64>,
    /// Fare in the server's currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fare: Option<f64>,
    /// One-time verification code, once assigned.
    #[serde(default, alias = "verificationCode", skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

impl RideSnapshot {
    /// Decode a snapshot from a JSON body.
    ///
    /// Some endpoints wrap the ride as `{"ride": {...}}`; both shapes are accepted.
    pub fn from_json(body: &str) -> Result<Self, TypesError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(TypesError::Deserialization)?;
        let inner = match value.get("ride") {
            Some(ride) if ride.is_object() => ride.clone(),
            _ => value,
        };
        serde_json::from_value(inner).map_err(TypesError::Deserialization)
    }

    /// Pickup coordinates, if both components are present.
    pub fn pickup(&self) -> Option<Coordinates> {
        Some(Coordinates::new(self.pickup_lat?, self.pickup_lng?))
    }

    /// Drop coordinates, if both components are present.
    pub fn drop_off(&self) -> Option<Coordinates> {
        Some(Coordinates::new(self.drop_lat?, self.drop_lng?))
    }

    /// Provider position carried by the snapshot, if any.
    pub fn driver_position(&self) -> Option<Coordinates> {
        Some(Coordinates::new(self.driver_lat?, self.driver_lng?))
    }

    /// The verification code, ignoring empty strings.
    pub fn verification_code(&self) -> Option<&str> {
        self.otp.as_deref().filter(|code| !code.trim().is_empty())
    }
}

/// Push events on the ride-updates topic.
///
/// The server discriminates on a `type` field; each variant carries the
/// partial ride snapshot the server chose to include.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideEvent {
    /// A provider accepted the ride.
    #[serde(rename = "RIDE_ACCEPTED", alias = "MATCHED")]
    Matched {
        /// Ride snapshot at acceptance.
        #[serde(default)]
        ride: RideSnapshot,
    },
    /// The trip started.
    #[serde(rename = "RIDE_STARTED")]
    Started {
        /// Ride snapshot, if included.
        #[serde(default)]
        ride: Option<RideSnapshot>,
    },
    /// The trip completed.
    #[serde(rename = "RIDE_COMPLETED")]
    Completed {
        /// Ride snapshot, if included.
        #[serde(default)]
        ride: Option<RideSnapshot>,
    },
    /// The ride was cancelled.
    #[serde(rename = "RIDE_CANCELLED")]
    Cancelled {
        /// Ride snapshot, if included.
        #[serde(default)]
        ride: Option<RideSnapshot>,
    },
    /// Counterpart position, when published on the ride-updates topic.
    #[serde(rename = "DRIVER_LOCATION")]
    LocationUpdate(LocationUpdate),
}

impl RideEvent {
    /// Decode a push event from a JSON body.
    pub fn from_json(body: &str) -> Result<Self, TypesError> {
        serde_json::from_str(body).map_err(TypesError::Deserialization)
    }

    /// The snapshot carried by this event, if any.
    pub fn snapshot(&self) -> Option<&RideSnapshot> {
        match self {
            Self::Matched { ride } => Some(ride),
            Self::Started { ride } | Self::Completed { ride } | Self::Cancelled { ride } => {
                ride.as_ref()
            }
            Self::LocationUpdate(_) => None,
        }
    }

    /// The booking id the event refers to, if it says.
    pub fn booking_id(&self) -> Option<&BookingId> {
        match self {
            Self::LocationUpdate(update) => update.booking_id.as_ref(),
            _ => self.snapshot().and_then(|ride| ride.booking_id.as_ref()),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Matched { .. } => "matched",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::LocationUpdate(_) => "location",
        }
    }
}

/// Counterpart position published on a location topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Publishing provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<ParticipantId>,
    /// Ride the update belongs to, when published per booking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    /// Latitude in degrees.
    #[serde(alias = "lat")]
    pub latitude: f64,
    /// Longitude in degrees.
    #[serde(alias = "lng")]
    pub longitude: f64,
    /// Heading in degrees, 0 = north.
    #[serde(default)]
    pub heading: f64,
    /// Speed in metres per second.
    #[serde(default)]
    pub speed: f64,
    /// Sample time (epoch milliseconds), if the publisher stamped it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl LocationUpdate {
    /// Decode a location update from a JSON body.
    pub fn from_json(body: &str) -> Result<Self, TypesError> {
        let update: Self = serde_json::from_str(body).map_err(TypesError::Deserialization)?;
        if !update.position().is_valid() {
            return Err(TypesError::InvalidData(format!(
                "coordinates out of range: {}, {}",
                update.latitude, update.longitude
            )));
        }
        Ok(update)
    }

    /// The reported position.
    pub fn position(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// A provider's own position, published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    /// Publishing provider.
    pub driver_id: ParticipantId,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Heading in degrees.
    pub heading: f64,
    /// Speed in metres per second.
    pub speed: f64,
}

impl LocationReport {
    /// Encode to a JSON body.
    pub fn to_json(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(TypesError::Serialization)
    }
}

/// A chat message scoped to one ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Ride the conversation belongs to.
    pub ride_id: BookingId,
    /// Author.
    pub sender_id: ParticipantId,
    /// Author display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// `customer` or `driver`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_type: Option<String>,
    /// Sender-side id used to drop our own echoes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
    /// Message text.
    pub message: String,
    /// RFC 3339 timestamp, as produced by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    /// Decode a chat message from a JSON body.
    pub fn from_json(body: &str) -> Result<Self, TypesError> {
        serde_json::from_str(body).map_err(TypesError::Deserialization)
    }

    /// Encode to a JSON body.
    pub fn to_json(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(TypesError::Serialization)
    }
}

/// Body of `POST ride.book`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    /// Requesting participant.
    pub customer_id: ParticipantId,
    /// Human readable pickup address.
    pub pickup_location: String,
    /// Human readable drop address.
    pub drop_location: String,
    /// Pickup latitude.
    pub pickup_lat: f64,
    /// Pickup longitude.
    pub pickup_lng: f64,
    /// Drop latitude.
    pub drop_lat: f64,
    /// Drop longitude.
    pub drop_lng: f64,
    /// Requested vehicle class.
    pub vehicle_type: String,
    /// Quoted fare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fare: Option<f64>,
    /// Promotion code, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promo_code: Option<String>,
}

impl BookingRequest {
    /// Pickup coordinates.
    pub fn pickup(&self) -> Coordinates {
        Coordinates::new(self.pickup_lat, self.pickup_lng)
    }

    /// Drop coordinates.
    pub fn drop_off(&self) -> Coordinates {
        Coordinates::new(self.drop_lat, self.drop_lng)
    }
}

/// A fare quote for one vehicle class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareQuote {
    /// Vehicle class.
    pub vehicle_type: String,
    /// Quoted fare.
    pub fare: f64,
    /// Estimated minutes until pickup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
}

/// Query for `GET rides.nearby`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyQuery {
    /// Centre latitude.
    pub latitude: f64,
    /// Centre longitude.
    pub longitude: f64,
    /// Search radius in kilometres.
    pub radius: f64,
    /// Minimum trip distance filter (km).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_distance: Option<f64>,
    /// Maximum trip distance filter (km).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f64>,
    /// Minimum fare filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fare: Option<f64>,
}

impl NearbyQuery {
    /// Query around a point with the default 10 km radius.
    pub fn around(center: Coordinates) -> Self {
        Self {
            latitude: center.lat,
            longitude: center.lng,
            radius: 10.0,
            min_distance: None,
            max_distance: None,
            min_fare: None,
        }
    }
}
