//! # ride-types
//!
//! Wire format types for the ridesync ride-state synchronization engine.
//!
//! This crate provides the foundational types used across all ridesync crates:
//! - [`BookingId`], [`ParticipantId`], [`ClientMessageId`] - Identity types
//! - [`RideSnapshot`] - Partial view of the server's ride resource
//! - [`RideEvent`] - Push events on the ride-updates topic
//! - [`LocationUpdate`], [`ChatMessage`] - Counterpart location and chat payloads
//! - [`TopicKey`] - Structured subscription keys and their broker destinations
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod geo;
mod ids;
mod messages;
mod topics;

pub use error::TypesError;
pub use geo::Coordinates;
pub use ids::{BookingId, ClientMessageId, ParticipantId};
pub use messages::{
    BookingRequest, ChatMessage, FareQuote, LocationReport, LocationUpdate, NearbyQuery,
    RideEvent, RideSnapshot, RideStatus,
};
pub use topics::{TopicKey, TopicKind, CHAT_SEND_DESTINATION, LOCATION_SEND_DESTINATION};
