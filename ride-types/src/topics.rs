//! Structured subscription keys.
//!
//! A [`TopicKey`] is a `(kind, id)` pair. Two keys are equal only when both
//! parts are equal, so ids that happen to share a prefix can never collide the
//! way concatenated strings would. The broker destination is derived from the
//! key, never the other way round.

use std::fmt;

/// Destination for a provider's own location reports.
pub const LOCATION_SEND_DESTINATION: &str = "/app/driver-location";

/// Destination for outbound chat messages.
pub const CHAT_SEND_DESTINATION: &str = "/app/chat";

/// What a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    /// Ride lifecycle events for one participant.
    RideUpdates,
    /// Counterpart position keyed by the counterpart's participant id.
    CounterpartLocation,
    /// Counterpart position keyed by booking id.
    BookingLocation,
    /// New ride requests offered to a provider.
    RideRequests,
    /// Chat for one booking.
    Chat,
}

impl TopicKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::RideUpdates => "/topic/ride-updates/",
            Self::CounterpartLocation | Self::BookingLocation => "/topic/driver-location/",
            Self::RideRequests => "/queue/ride-requests/",
            Self::Chat => "/topic/chat/",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::RideUpdates => "ride-updates",
            Self::CounterpartLocation => "counterpart-location",
            Self::BookingLocation => "booking-location",
            Self::RideRequests => "ride-requests",
            Self::Chat => "chat",
        }
    }
}

/// Logical subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey {
    kind: TopicKind,
    id: String,
}

impl TopicKey {
    /// Create a key from its parts.
    pub fn new(kind: TopicKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Ride lifecycle events for a participant.
    pub fn ride_updates(participant: &crate::ParticipantId) -> Self {
        Self::new(TopicKind::RideUpdates, participant.as_str())
    }

    /// Counterpart position by the counterpart's id.
    pub fn counterpart_location(counterpart: &crate::ParticipantId) -> Self {
        Self::new(TopicKind::CounterpartLocation, counterpart.as_str())
    }

    /// Counterpart position by booking.
    pub fn booking_location(booking: &crate::BookingId) -> Self {
        Self::new(TopicKind::BookingLocation, booking.as_str())
    }

    /// Ride requests offered to a provider.
    pub fn ride_requests(provider: &crate::ParticipantId) -> Self {
        Self::new(TopicKind::RideRequests, provider.as_str())
    }

    /// Chat for a booking.
    pub fn chat(booking: &crate::BookingId) -> Self {
        Self::new(TopicKind::Chat, booking.as_str())
    }

    /// The kind of this key.
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// The id part of this key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Broker destination this key subscribes to.
    ///
    /// Both location kinds map onto the same destination family; the broker
    /// publishes per driver and per booking on separate ids. The id is
    /// percent-encoded so it can never reach into another destination.
    pub fn destination(&self) -> String {
        format!("{}{}", self.kind.prefix(), urlencoding::encode(&self.id))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.id)
    }
}
