//! Ride resource API.
//!
//! The engine only talks to the server through [`RideApi`]: one fetch of the
//! authoritative ride resource plus the explicit user commands. [`HttpRideApi`]
//! is the production implementation; [`MockRideApi`] is an in-memory backend
//! for tests.

mod http;
mod mock;

pub use http::HttpRideApi;
pub use mock::{MockRideApi, Published};

use async_trait::async_trait;
use ride_types::{BookingId, BookingRequest, FareQuote, NearbyQuery, ParticipantId, RideSnapshot};
use thiserror::Error;

/// Errors from the ride resource API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// The request never got an answer (DNS, connect, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a client or server error.
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Server-provided reason, or the status text.
        message: String,
    },

    /// The ride does not exist.
    #[error("ride not found")]
    NotFound,

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the server refused the request (as opposed to never answering).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::NotFound)
    }

    /// Whether this is the "already accepted" refusal of an accept.
    pub fn is_already_accepted(&self) -> bool {
        match self {
            Self::Rejected { status, message } => {
                *status == 400 && message.to_ascii_lowercase().contains("already accepted")
            }
            _ => false,
        }
    }
}

/// Server operations the engine consumes.
#[async_trait]
pub trait RideApi: Send + Sync {
    /// Fetch the current ride resource.
    async fn ride(&self, booking_id: &BookingId) -> Result<RideSnapshot, ApiError>;

    /// Price a trip. Returns one quote per vehicle class.
    async fn quote(&self, request: &BookingRequest) -> Result<Vec<FareQuote>, ApiError>;

    /// Create a ride. Returns the initial snapshot, including its booking id.
    async fn book(&self, request: &BookingRequest) -> Result<RideSnapshot, ApiError>;

    /// Accept a ride as `provider`.
    async fn accept(
        &self,
        booking_id: &BookingId,
        provider: &ParticipantId,
    ) -> Result<RideSnapshot, ApiError>;

    /// Check the verification code. Fails with a rejection when it does not match.
    async fn verify_code(&self, booking_id: &BookingId, code: &str) -> Result<(), ApiError>;

    /// Start the trip.
    async fn start(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError>;

    /// Complete the trip.
    async fn complete(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError>;

    /// Cancel the ride.
    async fn cancel(&self, booking_id: &BookingId) -> Result<(), ApiError>;

    /// Open rides near a point.
    async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<RideSnapshot>, ApiError>;
}
