//! Ride state machine and field-level merge.
//!
//! Three sources feed the machine: local command confirmations, pushed
//! events and polled snapshots. All of them go through the same merge, which
//! has two rules:
//!
//! - a field is only ever overwritten by a message that carries it, and the
//!   verification code is write-once;
//! - the phase only moves forward. An update that reports an earlier phase
//!   still contributes its fields but not its status.
//!
//! Once a ride reaches a terminal phase the session is dropped and the
//! booking id is retired; anything that arrives later for it is ignored.
//!
//! ```text
//! SEARCH → QUOTING → BOOKING → TRACKING → IN_PROGRESS → COMPLETED
//!                       └──────────┴───────────┴──────→ CANCELLED
//! ```

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use ride_types::{
    BookingId, Coordinates, LocationUpdate, ParticipantId, RideEvent, RideSnapshot, RideStatus,
};
use serde::{Deserialize, Serialize};

use crate::hydration::HydrationBudget;

/// Which side of the ride this engine instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The customer requesting the ride.
    #[serde(alias = "customer")]
    Requester,
    /// The driver serving it.
    #[serde(alias = "driver", alias = "rider")]
    Provider,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requester => f.write_str("requester"),
            Self::Provider => f.write_str("provider"),
        }
    }
}

/// Client-side ride phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RidePhase {
    /// No active ride.
    Search,
    /// A fare quote is on screen.
    Quoting,
    /// Booked, waiting for a match.
    Booking,
    /// Matched; the provider is on the way.
    Tracking,
    /// Trip under way.
    InProgress,
    /// Trip finished.
    Completed,
    /// Ride cancelled.
    Cancelled,
}

impl RidePhase {
    /// Position along the transition graph. Terminal phases share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Search => 0,
            Self::Quoting => 1,
            Self::Booking => 2,
            Self::Tracking => 3,
            Self::InProgress => 4,
            Self::Completed | Self::Cancelled => 5,
        }
    }

    /// COMPLETED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// BOOKING, TRACKING or IN_PROGRESS: a session exists.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Booking | Self::Tracking | Self::InProgress)
    }

    /// Map a server status onto a phase. Unknown statuses map to nothing.
    pub fn from_status(status: RideStatus) -> Option<Self> {
        match status {
            RideStatus::Pending => Some(Self::Booking),
            RideStatus::Accepted => Some(Self::Tracking),
            RideStatus::InProgress => Some(Self::InProgress),
            RideStatus::Completed => Some(Self::Completed),
            RideStatus::Cancelled => Some(Self::Cancelled),
            RideStatus::Unknown => None,
        }
    }

    fn later(a: Self, b: Option<Self>) -> Self {
        match b {
            Some(b) if b.rank() > a.rank() => b,
            _ => a,
        }
    }
}

impl fmt::Display for RidePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Search => "SEARCH",
            Self::Quoting => "QUOTING",
            Self::Booking => "BOOKING",
            Self::Tracking => "TRACKING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Display details about the other party.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterpartInfo {
    /// Display name.
    pub name: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
    /// Vehicle registration (provider only).
    pub vehicle_number: Option<String>,
    /// Vehicle class (provider only).
    pub vehicle_type: Option<String>,
    /// Rating (provider only).
    pub rating: Option<f64>,
}

/// The active ride as this participant sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RideSession {
    booking_id: BookingId,
    phase: RidePhase,
    verification_code: Option<String>,
    hydration_requested: bool,
    /// The other party, once known.
    pub counterpart_id: Option<ParticipantId>,
    /// Pickup coordinates.
    pub pickup: Option<Coordinates>,
    /// Drop coordinates.
    pub drop_off: Option<Coordinates>,
    /// Pickup address.
    pub pickup_address: Option<String>,
    /// Drop address.
    pub drop_address: Option<String>,
    /// Fare.
    pub fare: Option<f64>,
    /// Counterpart display details.
    pub counterpart: CounterpartInfo,
    /// Time of the last trusted update (push, poll or counterpart location).
    pub last_updated_at: Instant,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Phase transition, if the update moved the phase forward.
    pub advanced: Option<(RidePhase, RidePhase)>,
    /// The verification code was filled by this update.
    pub code_filled: bool,
    /// The counterpart id appeared or changed.
    pub counterpart_assigned: Option<ParticipantId>,
    /// Counterpart position carried by the update (requester side only).
    pub position: Option<Coordinates>,
}

impl RideSession {
    /// Create an empty session in `phase`.
    pub fn new(booking_id: BookingId, phase: RidePhase, now: Instant) -> Self {
        Self {
            booking_id,
            phase,
            verification_code: None,
            hydration_requested: false,
            counterpart_id: None,
            pickup: None,
            drop_off: None,
            pickup_address: None,
            drop_address: None,
            fare: None,
            counterpart: CounterpartInfo::default(),
            last_updated_at: now,
        }
    }

    /// The ride's booking id.
    pub fn booking_id(&self) -> &BookingId {
        &self.booking_id
    }

    /// The current phase.
    pub fn phase(&self) -> RidePhase {
        self.phase
    }

    /// The verification code, once known.
    pub fn verification_code(&self) -> Option<&str> {
        self.verification_code.as_deref()
    }

    /// Merge a partial snapshot.
    ///
    /// `implied` is the phase the carrying event stands for (a "started"
    /// push implies IN_PROGRESS even when its snapshot omits the status).
    /// Neither it nor the snapshot status can move the phase backwards.
    pub fn merge(
        &mut self,
        snapshot: &RideSnapshot,
        implied: Option<RidePhase>,
        role: Role,
        now: Instant,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let counterpart_id = match role {
            Role::Requester => snapshot.driver_id.as_ref(),
            Role::Provider => snapshot.customer_id.as_ref(),
        };
        if let Some(id) = counterpart_id {
            if self.counterpart_id.as_ref() != Some(id) {
                self.counterpart_id = Some(id.clone());
                outcome.counterpart_assigned = Some(id.clone());
            }
        }

        if let Some(pickup) = snapshot.pickup() {
            self.pickup = Some(pickup);
        }
        if let Some(drop_off) = snapshot.drop_off() {
            self.drop_off = Some(drop_off);
        }
        overwrite(&mut self.pickup_address, &snapshot.pickup_location);
        overwrite(&mut self.drop_address, &snapshot.drop_location);
        if snapshot.fare.is_some() {
            self.fare = snapshot.fare;
        }

        match role {
            Role::Requester => {
                overwrite(&mut self.counterpart.name, &snapshot.driver_name);
                overwrite(&mut self.counterpart.phone, &snapshot.driver_phone);
                overwrite(&mut self.counterpart.vehicle_number, &snapshot.vehicle_number);
                overwrite(&mut self.counterpart.vehicle_type, &snapshot.vehicle_type);
                if snapshot.driver_rating.is_some() {
                    self.counterpart.rating = snapshot.driver_rating;
                }
                outcome.position = snapshot.driver_position().filter(Coordinates::is_valid);
            }
            Role::Provider => {
                overwrite(&mut self.counterpart.name, &snapshot.customer_name);
            }
        }

        if self.verification_code.is_none() {
            if let Some(code) = snapshot.verification_code() {
                self.verification_code = Some(code.to_string());
                outcome.code_filled = true;
            }
        }

        let reported = snapshot.status.and_then(RidePhase::from_status);
        let target = match (implied, reported) {
            (Some(a), b) => RidePhase::later(a, b),
            (None, b) => b.unwrap_or(self.phase),
        };
        if target.rank() > self.phase.rank() {
            outcome.advanced = Some((self.phase, target));
            self.phase = target;
        }

        self.last_updated_at = now;
        outcome
    }

    fn summary(&self) -> RideSummary {
        RideSummary {
            booking_id: self.booking_id.clone(),
            fare: self.fare,
            counterpart_id: self.counterpart_id.clone(),
            counterpart_name: self.counterpart.name.clone(),
        }
    }
}

fn overwrite(slot: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}

/// Read-only record of the last completed ride (for rating screens).
#[derive(Debug, Clone, PartialEq)]
pub struct RideSummary {
    /// The finished ride.
    pub booking_id: BookingId,
    /// Final fare.
    pub fare: Option<f64>,
    /// The other party.
    pub counterpart_id: Option<ParticipantId>,
    /// The other party's display name.
    pub counterpart_name: Option<String>,
}

/// Inputs to the ride state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum RideInput {
    /// A fare quote came back.
    QuoteReady,
    /// The server confirmed a booking made by this requester.
    BookingConfirmed {
        /// Snapshot returned by the booking command.
        ride: RideSnapshot,
    },
    /// The server confirmed this provider's accept.
    AcceptConfirmed {
        /// Snapshot of the accepted ride.
        ride: RideSnapshot,
    },
    /// The server confirmed the trip start.
    StartConfirmed {
        /// Snapshot, if the response carried one.
        ride: Option<RideSnapshot>,
    },
    /// The server confirmed completion.
    CompleteConfirmed {
        /// Snapshot, if the response carried one.
        ride: Option<RideSnapshot>,
    },
    /// Push event from the ride-updates topic.
    Push(RideEvent),
    /// Counterpart position from a location topic.
    Location(LocationUpdate),
    /// Snapshot fetched by the poller or a hydration attempt.
    Polled {
        /// The fetched ride.
        ride: RideSnapshot,
    },
    /// Snapshot fetched for the persisted booking id at start-up.
    Rehydrated {
        /// The fetched ride.
        ride: RideSnapshot,
    },
    /// The user cancelled. Applied before the server answers.
    LocalCancel,
    /// The user signed out.
    SignedOut,
}

/// Actions for ride-client to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RideAction {
    /// Store the booking id as the active ride.
    PersistBooking(BookingId),
    /// Remove the stored booking id.
    ClearPersisted,
    /// Subscribe the booking-scoped topics.
    WatchRide {
        /// The ride.
        booking_id: BookingId,
    },
    /// Subscribe the counterpart's own location topic.
    WatchCounterpart {
        /// The ride.
        booking_id: BookingId,
        /// The counterpart to follow.
        counterpart: ParticipantId,
    },
    /// Unsubscribe booking-scoped topics and cancel the ride's timers.
    ReleaseRide {
        /// The ride.
        booking_id: BookingId,
    },
    /// Start a verification-code hydration run.
    StartHydration {
        /// The ride.
        booking_id: BookingId,
        /// Which retry budget applies.
        budget: HydrationBudget,
    },
    /// The phase moved.
    PhaseChanged {
        /// Previous phase.
        from: RidePhase,
        /// New phase.
        to: RidePhase,
    },
    /// The verification code became known.
    CodeAvailable {
        /// The ride.
        booking_id: BookingId,
        /// The code.
        code: String,
    },
    /// New counterpart position for the smoother.
    CounterpartMoved {
        /// Reported position.
        position: Coordinates,
    },
    /// A persisted ride was restored.
    Resumed {
        /// The ride.
        booking_id: BookingId,
        /// Phase entered directly.
        phase: RidePhase,
    },
    /// The ride completed.
    Finished(RideSummary),
}

/// Per-participant ride state machine.
///
/// Holds at most one active [`RideSession`].
#[derive(Debug)]
pub struct RideMachine {
    role: Role,
    participant: ParticipantId,
    phase: RidePhase,
    session: Option<RideSession>,
    retired: HashSet<BookingId>,
    last_finished: Option<RideSummary>,
}

impl RideMachine {
    /// Create a machine in SEARCH.
    pub fn new(role: Role, participant: ParticipantId) -> Self {
        Self {
            role,
            participant,
            phase: RidePhase::Search,
            session: None,
            retired: HashSet::new(),
            last_finished: None,
        }
    }

    /// This participant's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// This participant's id.
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// The current phase.
    pub fn phase(&self) -> RidePhase {
        self.phase
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<&RideSession> {
        self.session.as_ref()
    }

    /// The active booking id, if any.
    pub fn active_booking(&self) -> Option<&BookingId> {
        self.session.as_ref().map(RideSession::booking_id)
    }

    /// Summary of the most recently completed ride.
    pub fn last_finished(&self) -> Option<&RideSummary> {
        self.last_finished.as_ref()
    }

    /// Whether a booking id reached a terminal phase on this instance.
    pub fn is_retired(&self, booking_id: &BookingId) -> bool {
        self.retired.contains(booking_id)
    }

    /// Time of the last trusted update for the active ride.
    pub fn last_trusted_update(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.last_updated_at)
    }

    /// Process an input and return the actions to execute.
    pub fn on_event(&mut self, input: RideInput, now: Instant) -> Vec<RideAction> {
        match input {
            RideInput::QuoteReady => {
                if self.session.is_some() || self.phase == RidePhase::Quoting {
                    return vec![];
                }
                let from = self.phase;
                self.phase = RidePhase::Quoting;
                vec![RideAction::PhaseChanged {
                    from,
                    to: RidePhase::Quoting,
                }]
            }
            RideInput::BookingConfirmed { ride } => {
                self.open_or_merge(ride, RidePhase::Booking, now)
            }
            RideInput::AcceptConfirmed { ride } => {
                self.open_or_merge(ride, RidePhase::Tracking, now)
            }
            RideInput::StartConfirmed { ride } => self.merge_into_session(
                ride.unwrap_or_default(),
                Some(RidePhase::InProgress),
                HydrationBudget::AfterPush,
                now,
            ),
            RideInput::CompleteConfirmed { ride } => self.merge_into_session(
                ride.unwrap_or_default(),
                Some(RidePhase::Completed),
                HydrationBudget::AfterPush,
                now,
            ),
            RideInput::Push(event) => self.on_push(event, now),
            RideInput::Location(update) => self.on_location(update, now),
            RideInput::Polled { ride } => {
                self.merge_into_session(ride, None, HydrationBudget::AfterPoll, now)
            }
            RideInput::Rehydrated { ride } => self.on_rehydrated(ride, now),
            RideInput::LocalCancel => match self.session.as_ref().map(RideSession::phase) {
                Some(from) => self.finish(from, RidePhase::Cancelled),
                None => vec![],
            },
            RideInput::SignedOut => {
                let mut actions = Vec::new();
                if let Some(session) = self.session.take() {
                    actions.push(RideAction::ReleaseRide {
                        booking_id: session.booking_id,
                    });
                }
                actions.push(RideAction::ClearPersisted);
                if self.phase != RidePhase::Search {
                    actions.push(RideAction::PhaseChanged {
                        from: self.phase,
                        to: RidePhase::Search,
                    });
                    self.phase = RidePhase::Search;
                }
                actions
            }
        }
    }

    fn on_push(&mut self, event: RideEvent, now: Instant) -> Vec<RideAction> {
        if event.booking_id().is_some_and(|id| self.retired.contains(id)) {
            return vec![];
        }
        match event {
            RideEvent::LocationUpdate(update) => self.on_location(update, now),
            RideEvent::Matched { ride } => {
                if self.session.is_none() && self.names_us(&ride) {
                    return self.open_session(ride, RidePhase::Tracking, false, now);
                }
                self.merge_into_session(
                    ride,
                    Some(RidePhase::Tracking),
                    HydrationBudget::AfterPush,
                    now,
                )
            }
            RideEvent::Started { ride } => self.merge_into_session(
                ride.unwrap_or_default(),
                Some(RidePhase::InProgress),
                HydrationBudget::AfterPush,
                now,
            ),
            RideEvent::Completed { ride } => self.merge_into_session(
                ride.unwrap_or_default(),
                Some(RidePhase::Completed),
                HydrationBudget::AfterPush,
                now,
            ),
            RideEvent::Cancelled { ride } => self.merge_into_session(
                ride.unwrap_or_default(),
                Some(RidePhase::Cancelled),
                HydrationBudget::AfterPush,
                now,
            ),
        }
    }

    fn on_location(&mut self, update: LocationUpdate, now: Instant) -> Vec<RideAction> {
        if self.role != Role::Requester {
            return vec![];
        }
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        if update
            .booking_id
            .as_ref()
            .is_some_and(|id| id != &session.booking_id)
        {
            return vec![];
        }
        let position = update.position();
        if !position.is_valid() {
            return vec![];
        }
        session.last_updated_at = now;
        vec![RideAction::CounterpartMoved { position }]
    }

    fn on_rehydrated(&mut self, ride: RideSnapshot, now: Instant) -> Vec<RideAction> {
        if self.session.is_some() {
            return vec![];
        }
        let terminal = ride.status.is_some_and(|s| s.is_terminal());
        let retired = ride
            .booking_id
            .as_ref()
            .map_or(true, |id| self.retired.contains(id));
        if terminal || retired {
            if let Some(id) = &ride.booking_id {
                self.retired.insert(id.clone());
            }
            return vec![RideAction::ClearPersisted];
        }
        self.open_session(ride, RidePhase::Booking, true, now)
    }

    /// Whether a snapshot that arrived without a session is addressed to us.
    fn names_us(&self, ride: &RideSnapshot) -> bool {
        let own = match self.role {
            Role::Requester => ride.customer_id.as_ref(),
            Role::Provider => ride.driver_id.as_ref(),
        };
        ride.booking_id.is_some() && own.map_or(true, |id| id == &self.participant)
    }

    fn open_or_merge(&mut self, ride: RideSnapshot, floor: RidePhase, now: Instant) -> Vec<RideAction> {
        match &self.session {
            Some(session) if ride.booking_id.as_ref() == Some(session.booking_id()) => {
                self.merge_into_session(ride, Some(floor), HydrationBudget::AfterPush, now)
            }
            Some(_) => vec![],
            None => self.open_session(ride, floor, false, now),
        }
    }

    fn open_session(
        &mut self,
        ride: RideSnapshot,
        floor: RidePhase,
        resumed: bool,
        now: Instant,
    ) -> Vec<RideAction> {
        let Some(booking_id) = ride.booking_id.clone() else {
            return vec![];
        };
        if self.retired.contains(&booking_id) {
            return vec![];
        }
        let phase = RidePhase::later(floor, ride.status.and_then(RidePhase::from_status));
        if phase.is_terminal() {
            self.retired.insert(booking_id);
            return vec![RideAction::ClearPersisted];
        }

        let mut session = RideSession::new(booking_id.clone(), phase, now);
        let outcome = session.merge(&ride, None, self.role, now);
        self.session = Some(session);

        let mut actions = Vec::new();
        if !resumed {
            actions.push(RideAction::PersistBooking(booking_id.clone()));
        }
        actions.push(RideAction::WatchRide {
            booking_id: booking_id.clone(),
        });
        if let Some(counterpart) = outcome.counterpart_assigned {
            actions.push(RideAction::WatchCounterpart {
                booking_id: booking_id.clone(),
                counterpart,
            });
        }
        let from = self.phase;
        self.phase = phase;
        actions.push(RideAction::PhaseChanged { from, to: phase });
        if resumed {
            actions.push(RideAction::Resumed {
                booking_id: booking_id.clone(),
                phase,
            });
        }
        if outcome.code_filled {
            if let Some(code) = ride.verification_code() {
                actions.push(RideAction::CodeAvailable {
                    booking_id,
                    code: code.to_string(),
                });
            }
        }
        if let Some(position) = outcome.position {
            actions.push(RideAction::CounterpartMoved { position });
        }
        let budget = if resumed {
            HydrationBudget::AfterPoll
        } else {
            HydrationBudget::AfterPush
        };
        actions.extend(self.hydration_due(budget));
        actions
    }

    fn merge_into_session(
        &mut self,
        ride: RideSnapshot,
        implied: Option<RidePhase>,
        budget: HydrationBudget,
        now: Instant,
    ) -> Vec<RideAction> {
        let role = self.role;
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        if ride
            .booking_id
            .as_ref()
            .is_some_and(|id| id != &session.booking_id)
        {
            return vec![];
        }

        let outcome = session.merge(&ride, implied, role, now);
        let booking_id = session.booking_id.clone();
        let mut actions = Vec::new();

        if let Some(counterpart) = outcome.counterpart_assigned {
            actions.push(RideAction::WatchCounterpart {
                booking_id: booking_id.clone(),
                counterpart,
            });
        }
        if outcome.code_filled {
            if let Some(code) = session.verification_code() {
                actions.push(RideAction::CodeAvailable {
                    booking_id: booking_id.clone(),
                    code: code.to_string(),
                });
            }
        }
        if let Some(position) = outcome.position {
            actions.push(RideAction::CounterpartMoved { position });
        }
        match outcome.advanced {
            Some((from, to)) if to.is_terminal() => {
                actions.extend(self.finish(from, to));
            }
            Some((from, to)) => {
                self.phase = to;
                actions.push(RideAction::PhaseChanged { from, to });
                actions.extend(self.hydration_due(budget));
            }
            None => {}
        }
        actions
    }

    /// Request the code once per booking when tracking starts without it.
    fn hydration_due(&mut self, budget: HydrationBudget) -> Option<RideAction> {
        if self.role != Role::Requester {
            return None;
        }
        let session = self.session.as_mut()?;
        if session.phase != RidePhase::Tracking
            || session.verification_code.is_some()
            || session.hydration_requested
        {
            return None;
        }
        session.hydration_requested = true;
        Some(RideAction::StartHydration {
            booking_id: session.booking_id.clone(),
            budget,
        })
    }

    fn finish(&mut self, from: RidePhase, to: RidePhase) -> Vec<RideAction> {
        let Some(session) = self.session.take() else {
            return vec![];
        };
        self.retired.insert(session.booking_id.clone());
        self.phase = to;

        let mut actions = vec![
            RideAction::ReleaseRide {
                booking_id: session.booking_id.clone(),
            },
            RideAction::ClearPersisted,
            RideAction::PhaseChanged { from, to },
        ];
        if to == RidePhase::Completed {
            let summary = session.summary();
            self.last_finished = Some(summary.clone());
            actions.push(RideAction::Finished(summary));
        }
        actions
    }
}
