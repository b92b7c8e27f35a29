//! The ride engine.
//!
//! `RideEngine` owns one participant's view of one ride. It feeds the pure
//! [`RideMachine`] from three sources (user commands, broker pushes, polled
//! snapshots) and executes the actions it returns: persistence, topic
//! subscriptions, code hydration and the reconciliation poller.
//!
//! Everything runs on the caller's task. Subscription handlers, timers and
//! background fetches never touch engine state; they post an input on an
//! internal channel and the engine applies it on the next [`step`]. That
//! keeps every merge on one logical thread without locks.
//!
//! ```text
//!   broker frames ──► ConnectionManager::wait ──┐
//!   handlers / timers / fetches ──► inputs ─────┼──► step() ──► RideMachine
//!   user commands ──────────────────────────────┘                  │
//!                                                     actions ◄────┘
//! ```
//!
//! [`step`]: RideEngine::step

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ride_core::{
    ConnectionEvent, ConnectionState, HydrationStep, HydrationTracker, LocationSample,
    LocationSmoother, PollContext, PollDecision, RideAction, RideInput, RideMachine, RidePhase,
    RideSession, RideSummary, Role, SampleSource, StalenessMonitor,
};
use ride_types::{
    BookingId, BookingRequest, ChatMessage, ClientMessageId, Coordinates, FareQuote,
    LocationReport, LocationUpdate, NearbyQuery, ParticipantId, RideEvent, RideSnapshot,
    TopicKey, TopicKind, TypesError, CHAT_SEND_DESTINATION, LOCATION_SEND_DESTINATION,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ApiError, RideApi};
use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, LinkSignal};
use crate::registry::{typed_handler, Decode, Handler};
use crate::schedule::ScheduledTask;
use crate::store::{SessionStore, StoreError};
use crate::transport::{Transport, TransportError};

/// Length of a verification code.
pub const CODE_LENGTH: usize = 4;

/// Errors returned by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The server refused an explicit command.
    #[error("{command} rejected ({status}): {message}")]
    CommandRejected {
        /// Command name.
        command: &'static str,
        /// HTTP status.
        status: u16,
        /// Server-provided reason.
        message: String,
    },

    /// The command needs an active ride.
    #[error("no active ride")]
    NoActiveRide,

    /// The command does not apply in the current phase.
    #[error("{command} is not allowed in phase {phase}")]
    InvalidPhase {
        /// Command name.
        command: &'static str,
        /// Phase at the time of the call.
        phase: RidePhase,
    },

    /// The command is reserved for the other role.
    #[error("{command} is only available to the {required} role")]
    WrongRole {
        /// Command name.
        command: &'static str,
        /// Role that may issue it.
        required: Role,
    },

    /// Input failed local validation; nothing was sent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Explicit connect failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session persistence failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// Outbound payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] TypesError),

    /// The API never answered an explicit command.
    #[error("api error: {0}")]
    Api(ApiError),
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RideNotice {
    /// The ride phase moved.
    PhaseChanged {
        /// Previous phase.
        from: RidePhase,
        /// New phase.
        to: RidePhase,
    },
    /// The verification code is known.
    CodeAvailable {
        /// The ride.
        booking_id: BookingId,
        /// The code.
        code: String,
    },
    /// Tracking started without the code; fetching it.
    CodePending {
        /// The ride.
        booking_id: BookingId,
    },
    /// A persisted ride was restored at start-up.
    Resumed {
        /// The ride.
        booking_id: BookingId,
        /// Phase entered.
        phase: RidePhase,
    },
    /// The broker link is up.
    Connected,
    /// The broker link is down; reconnecting.
    Reconnecting {
        /// Consecutive failed attempts so far.
        failures: u32,
    },
    /// Reconnects keep failing. Polling continues.
    RealtimeUnavailable {
        /// Consecutive failed attempts.
        failures: u32,
    },
    /// No trusted update for longer than the staleness ceiling.
    RideUnreachable {
        /// The ride.
        booking_id: BookingId,
        /// Time since the last trusted update.
        silent_for: Duration,
    },
    /// A ride request was offered to this provider.
    RideRequested(RideSnapshot),
    /// A chat message from the other party.
    Chat(ChatMessage),
    /// The server acknowledged a cancel.
    CancelConfirmed {
        /// The ride.
        booking_id: BookingId,
    },
    /// An explicit command failed.
    CommandFailed {
        /// Command name.
        command: &'static str,
        /// Reason.
        message: String,
    },
    /// The ride completed.
    Finished(RideSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPurpose {
    Poll,
    Hydration,
}

/// Work posted back to the engine by handlers and background tasks.
#[derive(Debug)]
enum EngineInput {
    Push(RideEvent),
    Location(LocationUpdate),
    Chat(ChatMessage),
    RideRequest(RideSnapshot),
    PollDue {
        booking_id: BookingId,
    },
    Fetched {
        booking_id: BookingId,
        purpose: FetchPurpose,
        result: Result<RideSnapshot, ApiError>,
    },
    CancelSettled {
        booking_id: BookingId,
        result: Result<(), ApiError>,
    },
}

enum Wake {
    Link(LinkSignal),
    Input(EngineInput),
}

/// Engine time. Follows tokio's clock so paused-time tests drive it.
fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// One participant's ride-state synchronization engine.
pub struct RideEngine<T: Transport + 'static> {
    config: EngineConfig,
    machine: RideMachine,
    connection: ConnectionManager<T>,
    api: Arc<dyn RideApi>,
    store: Arc<dyn SessionStore>,
    notices: mpsc::UnboundedSender<RideNotice>,
    inputs_tx: mpsc::UnboundedSender<EngineInput>,
    inputs_rx: mpsc::UnboundedReceiver<EngineInput>,

    phase_since: Instant,
    poll_task: Option<ScheduledTask>,
    hydration: HydrationTracker,
    hydration_task: Option<ScheduledTask>,
    command_tasks: Vec<ScheduledTask>,
    staleness: StalenessMonitor,
    realtime_unavailable: bool,
    resync_on_connect: bool,

    ride_keys: Vec<TopicKey>,
    counterpart_key: Option<TopicKey>,
    smoother: LocationSmoother,
    last_location_sent: Option<Instant>,
    own_messages: HashSet<ClientMessageId>,
}

impl<T: Transport + 'static> RideEngine<T> {
    /// Create an engine and the receiver for its notices.
    ///
    /// Nothing touches the network until [`resume`](Self::resume) or
    /// [`connect`](Self::connect).
    pub fn new(
        config: EngineConfig,
        role: Role,
        participant: ParticipantId,
        transport: Arc<T>,
        api: Arc<dyn RideApi>,
        store: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::UnboundedReceiver<RideNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            transport,
            config.broker_url.clone(),
            config.reconnect_policy(),
            config.connect_timeout(),
            config.max_pending_operations,
        );
        let smoother = LocationSmoother::new(config.smoothing())
            .with_push_window(config.poll_policy().stale_after);
        let engine = Self {
            machine: RideMachine::new(role, participant),
            connection,
            api,
            store,
            notices,
            inputs_tx,
            inputs_rx,
            phase_since: clock(),
            poll_task: None,
            hydration: HydrationTracker::new(),
            hydration_task: None,
            command_tasks: Vec::new(),
            staleness: StalenessMonitor::new(),
            realtime_unavailable: false,
            resync_on_connect: false,
            ride_keys: Vec::new(),
            counterpart_key: None,
            smoother,
            last_location_sent: None,
            own_messages: HashSet::new(),
            config,
        };
        (engine, notice_rx)
    }

    // ===========================================
    // Accessors
    // ===========================================

    /// This participant's role.
    pub fn role(&self) -> Role {
        self.machine.role()
    }

    /// This participant's id.
    pub fn participant(&self) -> &ParticipantId {
        self.machine.participant()
    }

    /// Current ride phase.
    pub fn phase(&self) -> RidePhase {
        self.machine.phase()
    }

    /// The active ride, if any.
    pub fn session(&self) -> Option<&RideSession> {
        self.machine.session()
    }

    /// Summary of the most recently completed ride.
    pub fn last_finished(&self) -> Option<&RideSummary> {
        self.machine.last_finished()
    }

    /// Broker link state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Operations waiting for the link.
    pub fn pending_operations(&self) -> usize {
        self.connection.pending_len()
    }

    /// Whether real-time updates are currently reported unavailable.
    pub fn is_realtime_unavailable(&self) -> bool {
        self.realtime_unavailable
    }

    /// Smoothed counterpart position for rendering now.
    pub fn counterpart_position(&self) -> Option<Coordinates> {
        self.smoother.position_at(clock())
    }

    /// Counterpart positions from now to the end of the current animation,
    /// one per `step`.
    pub fn counterpart_frames(&self, step: Duration) -> Vec<Coordinates> {
        self.smoother.frames(clock(), step)
    }

    /// Distance in km from the counterpart to the pickup (while tracking)
    /// or the drop-off (while in progress).
    pub fn counterpart_distance_km(&self) -> Option<f64> {
        let session = self.machine.session()?;
        let target = match session.phase() {
            RidePhase::Tracking => session.pickup?,
            RidePhase::InProgress => session.drop_off?,
            _ => return None,
        };
        Some(self.counterpart_position()?.distance_km(&target))
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    /// Start the engine: subscribe this participant's topics, connect, and
    /// restore a persisted ride.
    ///
    /// The stored booking id is only a hint. The ride is fetched first; a
    /// terminal or unknown ride clears the store instead of resuming. A
    /// failed connect is not an error here; the link keeps retrying in the
    /// background.
    pub async fn resume(&mut self) -> Result<Option<BookingId>, EngineError> {
        self.subscribe_participant_topics().await;
        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "broker unavailable at start, retrying in background");
        }
        self.relay_link_events();

        if let Some(active) = self.machine.active_booking() {
            return Ok(Some(active.clone()));
        }
        let Some(stored) = self.store.load().await? else {
            return Ok(None);
        };

        info!(booking_id = %stored, "checking persisted ride");
        match self.api.ride(&stored).await {
            Ok(mut ride) => {
                ride.booking_id.get_or_insert_with(|| stored.clone());
                self.apply(RideInput::Rehydrated { ride }).await;
                Ok(self.machine.active_booking().cloned())
            }
            Err(ApiError::NotFound) => {
                info!(booking_id = %stored, "persisted ride no longer exists");
                self.store.clear().await?;
                Ok(None)
            }
            Err(e) => {
                warn!(booking_id = %stored, error = %e, "could not verify persisted ride");
                Err(EngineError::Api(e))
            }
        }
    }

    /// Bring the broker link up, waiting at most the connect timeout.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        let result = self.connection.connect().await;
        self.relay_link_events();
        result.map_err(EngineError::from)
    }

    /// Sign out: drop the ride, clear persistence and close the link.
    pub async fn sign_out(&mut self) {
        self.apply(RideInput::SignedOut).await;
        self.hydration.clear();
        self.command_tasks.clear();
        self.connection.disconnect().await;
        self.relay_link_events();
        info!(participant = %self.participant(), "signed out");
    }

    // ===========================================
    // Event loop
    // ===========================================

    /// Wait for the next input and apply it.
    pub async fn step(&mut self) {
        let wake = self.next_wake().await;
        self.process(wake).await;
    }

    /// Process inputs until `duration` has elapsed.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            let stop = tokio::time::sleep_until(deadline);
            if self.step_or(stop).await.is_some() {
                return;
            }
        }
    }

    /// Wait for the next input and apply it, unless `stop` completes first.
    ///
    /// Returns `stop`'s output when it won. Only the wait is raced: an input
    /// that was taken is always applied in full.
    pub async fn step_or<F: Future>(&mut self, stop: F) -> Option<F::Output> {
        let wake = tokio::select! {
            biased;
            output = stop => return Some(output),
            wake = self.next_wake() => wake,
        };
        self.process(wake).await;
        None
    }

    /// Cancel-safe: only waits, never mutates.
    async fn next_wake(&mut self) -> Wake {
        let connection = &mut self.connection;
        let inputs = &mut self.inputs_rx;
        tokio::select! {
            signal = connection.wait() => Wake::Link(signal),
            Some(input) = inputs.recv() => Wake::Input(input),
        }
    }

    async fn process(&mut self, wake: Wake) {
        match wake {
            Wake::Link(signal) => {
                self.connection.handle(signal).await;
                self.relay_link_events();
            }
            Wake::Input(input) => self.on_input(input).await,
        }
    }

    async fn on_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Push(event) => {
                debug!(kind = event.kind(), "push");
                self.apply(RideInput::Push(event)).await;
            }
            EngineInput::Location(update) => self.apply(RideInput::Location(update)).await,
            EngineInput::Chat(message) => self.on_chat(message),
            EngineInput::RideRequest(ride) => {
                if self.machine.session().is_some() {
                    debug!(booking_id = ?ride.booking_id, "busy, ignoring ride request");
                } else {
                    self.notify(RideNotice::RideRequested(ride));
                }
            }
            EngineInput::PollDue { booking_id } => self.on_poll_due(booking_id),
            EngineInput::Fetched {
                booking_id,
                purpose,
                result,
            } => self.on_fetched(booking_id, purpose, result).await,
            EngineInput::CancelSettled { booking_id, result } => {
                self.command_tasks.retain(|task| !task.is_finished());
                match result {
                    Ok(()) => {
                        debug!(%booking_id, "cancel confirmed");
                        self.notify(RideNotice::CancelConfirmed { booking_id });
                    }
                    Err(e) => {
                        warn!(%booking_id, error = %e, "cancel failed on the server");
                        self.notify(RideNotice::CommandFailed {
                            command: "cancel",
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn on_chat(&mut self, message: ChatMessage) {
        if self.machine.active_booking() != Some(&message.ride_id) {
            return;
        }
        if let Some(id) = &message.client_message_id {
            if self.own_messages.remove(id) {
                return;
            }
        }
        if &message.sender_id == self.participant() {
            return;
        }
        self.notify(RideNotice::Chat(message));
    }

    // ===========================================
    // Requester commands
    // ===========================================

    /// Price a trip. Moves SEARCH to QUOTING.
    pub async fn quote(&mut self, request: &BookingRequest) -> Result<Vec<FareQuote>, EngineError> {
        self.require_role("quote", Role::Requester)?;
        self.require_idle("quote")?;
        let quotes = self
            .api
            .quote(request)
            .await
            .map_err(|e| self.command_failed("quote", e))?;
        self.apply(RideInput::QuoteReady).await;
        Ok(quotes)
    }

    /// Book a ride. On success the engine is in BOOKING and the booking is
    /// persisted.
    pub async fn book(&mut self, request: &BookingRequest) -> Result<BookingId, EngineError> {
        self.require_role("book", Role::Requester)?;
        self.require_idle("book")?;
        if !request.pickup().is_valid() || !request.drop_off().is_valid() {
            return Err(EngineError::InvalidInput(
                "pickup and drop coordinates must be valid".into(),
            ));
        }
        let ride = self
            .api
            .book(request)
            .await
            .map_err(|e| self.command_failed("book", e))?;
        let Some(booking_id) = ride.booking_id.clone() else {
            return Err(EngineError::Api(ApiError::Decode(
                "booking response without booking id".into(),
            )));
        };
        info!(%booking_id, "ride booked");
        self.apply(RideInput::BookingConfirmed { ride }).await;
        Ok(booking_id)
    }

    /// Cancel the active ride.
    ///
    /// Local state moves to CANCELLED at once. The server call runs in the
    /// background; if it fails a [`RideNotice::CommandFailed`] is emitted and
    /// the local state stays cancelled.
    pub async fn cancel_ride(&mut self) -> Result<(), EngineError> {
        let booking_id = self
            .machine
            .active_booking()
            .cloned()
            .ok_or(EngineError::NoActiveRide)?;
        info!(%booking_id, "cancelling ride");
        self.apply(RideInput::LocalCancel).await;

        let api = Arc::clone(&self.api);
        let tx = self.inputs_tx.clone();
        self.command_tasks.retain(|task| !task.is_finished());
        self.command_tasks.push(ScheduledTask::spawn("cancel", async move {
            let result = api.cancel(&booking_id).await;
            let _ = tx.send(EngineInput::CancelSettled { booking_id, result });
        }));
        Ok(())
    }

    /// Send a chat message on the active ride.
    pub async fn send_chat(&mut self, text: &str) -> Result<ClientMessageId, EngineError> {
        let booking_id = self
            .machine
            .active_booking()
            .cloned()
            .ok_or(EngineError::NoActiveRide)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("empty chat message".into()));
        }
        let id = ClientMessageId::new();
        let sender_type = match self.role() {
            Role::Requester => "customer",
            Role::Provider => "driver",
        };
        let message = ChatMessage {
            ride_id: booking_id,
            sender_id: self.participant().clone(),
            sender_name: None,
            sender_type: Some(sender_type.to_string()),
            client_message_id: Some(id),
            message: text.to_string(),
            timestamp: None,
        };
        let body = message.to_json()?;
        self.connection.send(CHAT_SEND_DESTINATION, body).await?;
        self.relay_link_events();
        self.own_messages.insert(id);
        Ok(id)
    }

    // ===========================================
    // Provider commands
    // ===========================================

    /// Rides waiting for a provider near a point.
    pub async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<RideSnapshot>, EngineError> {
        self.require_role("nearby", Role::Provider)?;
        self.api
            .nearby(query)
            .await
            .map_err(|e| self.command_failed("nearby", e))
    }

    /// Accept a ride. On success the engine is in TRACKING.
    ///
    /// If the server says the ride is already accepted, the ride is fetched:
    /// when it is assigned to this provider (an earlier accept whose response
    /// was lost) it is resumed instead of failing.
    pub async fn accept(&mut self, booking_id: &BookingId) -> Result<(), EngineError> {
        self.require_role("accept", Role::Provider)?;
        self.require_idle("accept")?;
        let me = self.participant().clone();

        let mut ride = match self.api.accept(booking_id, &me).await {
            Ok(ride) => ride,
            Err(e) if e.is_already_accepted() => {
                debug!(%booking_id, "already accepted, checking assignment");
                match self.api.ride(booking_id).await {
                    Ok(ride) if ride.driver_id.as_ref() == Some(&me) => {
                        info!(%booking_id, "ride was already ours, resuming");
                        ride
                    }
                    _ => return Err(self.command_failed("accept", e)),
                }
            }
            Err(e) => return Err(self.command_failed("accept", e)),
        };
        ride.booking_id.get_or_insert_with(|| booking_id.clone());
        info!(%booking_id, "ride accepted");
        self.apply(RideInput::AcceptConfirmed { ride }).await;
        Ok(())
    }

    /// Check the requester's code and start the trip.
    ///
    /// The code format is checked locally first; nothing is sent for a
    /// malformed code. The trip starts only after the server accepted both
    /// the code and the start.
    pub async fn verify_code(&mut self, code: &str) -> Result<(), EngineError> {
        self.require_role("verify", Role::Provider)?;
        let booking_id = self.require_phase("verify", RidePhase::Tracking)?;
        let code = code.trim();
        if code.chars().count() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EngineError::InvalidInput(format!(
                "verification code must be {CODE_LENGTH} characters"
            )));
        }

        self.api
            .verify_code(&booking_id, code)
            .await
            .map_err(|e| self.command_failed("verify", e))?;
        let ride = self
            .api
            .start(&booking_id)
            .await
            .map_err(|e| self.command_failed("start", e))?;
        info!(%booking_id, "trip started");
        self.apply(RideInput::StartConfirmed { ride }).await;
        Ok(())
    }

    /// Finish the trip.
    pub async fn complete_ride(&mut self) -> Result<RideSummary, EngineError> {
        self.require_role("complete", Role::Provider)?;
        let booking_id = self.require_phase("complete", RidePhase::InProgress)?;
        let ride = self
            .api
            .complete(&booking_id)
            .await
            .map_err(|e| self.command_failed("complete", e))?;
        self.apply(RideInput::CompleteConfirmed { ride }).await;
        self.machine
            .last_finished()
            .filter(|summary| summary.booking_id == booking_id)
            .cloned()
            .ok_or(EngineError::NoActiveRide)
    }

    /// Publish this provider's position.
    ///
    /// At most one report per `location_send_interval`; extra calls return
    /// `Ok(false)` and send nothing. While the link is down the report is
    /// queued and replayed on reconnect.
    pub async fn send_location(
        &mut self,
        position: Coordinates,
        heading: f64,
        speed: f64,
    ) -> Result<bool, EngineError> {
        self.require_role("send_location", Role::Provider)?;
        if !position.is_valid() {
            return Err(EngineError::InvalidInput(format!(
                "coordinates out of range: {}, {}",
                position.lat, position.lng
            )));
        }
        let now = clock();
        if let Some(last) = self.last_location_sent {
            if now.saturating_duration_since(last) < self.config.location_send_interval() {
                return Ok(false);
            }
        }
        let report = LocationReport {
            driver_id: self.participant().clone(),
            latitude: position.lat,
            longitude: position.lng,
            heading,
            speed,
        };
        self.connection
            .send(LOCATION_SEND_DESTINATION, report.to_json()?)
            .await?;
        self.relay_link_events();
        self.last_location_sent = Some(now);
        Ok(true)
    }

    // ===========================================
    // Ride machine
    // ===========================================

    async fn apply(&mut self, input: RideInput) {
        let source = match &input {
            RideInput::Push(_) | RideInput::Location(_) => SampleSource::Push,
            _ => SampleSource::Poll,
        };
        let actions = self.machine.on_event(input, clock());
        for action in actions {
            self.execute(action, source).await;
        }
        self.relay_link_events();
    }

    async fn execute(&mut self, action: RideAction, source: SampleSource) {
        match action {
            RideAction::PersistBooking(booking_id) => {
                if let Err(e) = self.store.save(&booking_id).await {
                    warn!(%booking_id, error = %e, "could not persist active ride");
                }
            }
            RideAction::ClearPersisted => {
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "could not clear persisted ride");
                }
            }
            RideAction::WatchRide { booking_id } => self.watch_ride(&booking_id).await,
            RideAction::WatchCounterpart {
                booking_id,
                counterpart,
            } => {
                if self.role() == Role::Requester {
                    debug!(%booking_id, %counterpart, "following counterpart");
                    self.watch_counterpart(&counterpart).await;
                }
            }
            RideAction::ReleaseRide { booking_id } => self.release_ride(&booking_id).await,
            RideAction::StartHydration { booking_id, budget } => {
                let plan = self.config.hydration_policy().plan(budget);
                if self.hydration.begin(&booking_id, plan) {
                    info!(%booking_id, attempts = plan.attempts, "verification code missing, fetching");
                    self.notify(RideNotice::CodePending {
                        booking_id: booking_id.clone(),
                    });
                    self.hydrate(booking_id, Duration::ZERO);
                }
            }
            RideAction::PhaseChanged { from, to } => {
                info!(%from, %to, "ride phase");
                self.phase_since = clock();
                self.notify(RideNotice::PhaseChanged { from, to });
            }
            RideAction::CodeAvailable { booking_id, code } => {
                if self.hydration.cancel(&booking_id) {
                    self.hydration_task = None;
                }
                self.notify(RideNotice::CodeAvailable { booking_id, code });
            }
            RideAction::CounterpartMoved { position } => {
                let applied = self.smoother.push(LocationSample {
                    position,
                    timestamp: clock(),
                    source,
                });
                if !applied {
                    debug!(?position, "polled position older than last push, ignored");
                }
            }
            RideAction::Resumed { booking_id, phase } => {
                info!(%booking_id, %phase, "ride resumed");
                self.notify(RideNotice::Resumed { booking_id, phase });
            }
            RideAction::Finished(summary) => self.notify(RideNotice::Finished(summary)),
        }
    }

    // ===========================================
    // Subscriptions
    // ===========================================

    fn forward<M>(&self, key: &TopicKey, wrap: fn(M) -> EngineInput) -> Handler
    where
        M: Decode + 'static,
    {
        let tx = self.inputs_tx.clone();
        typed_handler(key, move |message: M| {
            let _ = tx.send(wrap(message));
        })
    }

    async fn subscribe(&mut self, key: TopicKey, handler: Handler) {
        if let Err(e) = self.connection.subscribe(key.clone(), handler).await {
            warn!(topic = %key, error = %e, "could not subscribe");
        }
    }

    async fn subscribe_participant_topics(&mut self) {
        let me = self.participant().clone();
        let updates = TopicKey::ride_updates(&me);
        let handler = self.forward(&updates, EngineInput::Push);
        self.subscribe(updates, handler).await;

        if self.role() == Role::Provider {
            let requests = TopicKey::ride_requests(&me);
            let handler = self.forward(&requests, EngineInput::RideRequest);
            self.subscribe(requests, handler).await;
        }
    }

    async fn watch_ride(&mut self, booking_id: &BookingId) {
        let mut keys = vec![TopicKey::chat(booking_id)];
        if self.role() == Role::Requester {
            keys.push(TopicKey::booking_location(booking_id));
        }
        for key in keys {
            let handler = match key.kind() {
                TopicKind::Chat => self.forward(&key, EngineInput::Chat),
                _ => self.forward(&key, EngineInput::Location),
            };
            self.subscribe(key.clone(), handler).await;
            if !self.ride_keys.contains(&key) {
                self.ride_keys.push(key);
            }
        }
        self.staleness.reset();
        self.arm_poll();
    }

    async fn watch_counterpart(&mut self, counterpart: &ParticipantId) {
        let key = TopicKey::counterpart_location(counterpart);
        if self.counterpart_key.as_ref() == Some(&key) {
            return;
        }
        if let Some(previous) = self.counterpart_key.take() {
            self.connection.unsubscribe(&previous).await;
        }
        let handler = self.forward(&key, EngineInput::Location);
        self.subscribe(key.clone(), handler).await;
        self.counterpart_key = Some(key);
    }

    async fn release_ride(&mut self, booking_id: &BookingId) {
        debug!(%booking_id, "releasing ride");
        self.poll_task = None;
        self.hydration_task = None;
        self.hydration.cancel(booking_id);
        for key in std::mem::take(&mut self.ride_keys) {
            self.connection.unsubscribe(&key).await;
        }
        if let Some(key) = self.counterpart_key.take() {
            self.connection.unsubscribe(&key).await;
        }
        self.smoother.reset();
        self.staleness.reset();
        self.own_messages.clear();
    }

    // ===========================================
    // Polling and hydration
    // ===========================================

    /// Schedule the next poll tick for the active ride.
    fn arm_poll(&mut self) {
        let Some(booking_id) = self.machine.active_booking().cloned() else {
            self.poll_task = None;
            return;
        };
        let policy = self.config.poll_policy();
        let interval = policy.interval(self.machine.phase(), self.phase_since, clock());
        let tx = self.inputs_tx.clone();
        self.poll_task = Some(ScheduledTask::after("poll", interval, move || {
            let _ = tx.send(EngineInput::PollDue { booking_id });
        }));
    }

    fn fetch(
        &self,
        name: &'static str,
        booking_id: BookingId,
        purpose: FetchPurpose,
        delay: Duration,
    ) -> ScheduledTask {
        let api = Arc::clone(&self.api);
        let tx = self.inputs_tx.clone();
        ScheduledTask::spawn(name, async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = api.ride(&booking_id).await;
            let _ = tx.send(EngineInput::Fetched {
                booking_id,
                purpose,
                result,
            });
        })
    }

    fn hydrate(&mut self, booking_id: BookingId, delay: Duration) {
        if let Some(attempt) = self.hydration.attempt(&booking_id) {
            debug!(%booking_id, attempt, "hydration attempt");
            self.hydration_task =
                Some(self.fetch("hydrate", booking_id, FetchPurpose::Hydration, delay));
        }
    }

    fn on_poll_due(&mut self, booking_id: BookingId) {
        if self.machine.active_booking() != Some(&booking_id) {
            return;
        }
        let now = clock();
        let policy = self.config.poll_policy();
        let last_trusted = self.machine.last_trusted_update();

        if let Some(last) = last_trusted {
            if self.staleness.check(last, policy.stale_ceiling, now) {
                let silent_for = now.saturating_duration_since(last);
                warn!(%booking_id, silent_secs = silent_for.as_secs(), "no trusted update, ride unreachable");
                self.notify(RideNotice::RideUnreachable {
                    booking_id: booking_id.clone(),
                    silent_for,
                });
            }
        }

        let context = PollContext {
            phase: self.machine.phase(),
            phase_since: self.phase_since,
            last_trusted,
            realtime_unavailable: self.realtime_unavailable,
            incomplete: self.code_missing(),
        };
        match policy.decide(&context, now) {
            PollDecision::Skip => self.arm_poll(),
            decision => {
                debug!(%booking_id, ?decision, "polling ride");
                self.poll_task = Some(self.fetch("poll", booking_id, FetchPurpose::Poll, Duration::ZERO));
            }
        }
    }

    /// A requester in TRACKING without a code, and no hydration run chasing it.
    fn code_missing(&self) -> bool {
        self.role() == Role::Requester
            && self.machine.phase() == RidePhase::Tracking
            && self.hydration_task.is_none()
            && self
                .machine
                .session()
                .is_some_and(|s| s.verification_code().is_none())
    }

    async fn on_fetched(
        &mut self,
        booking_id: BookingId,
        purpose: FetchPurpose,
        result: Result<RideSnapshot, ApiError>,
    ) {
        if self.machine.active_booking() != Some(&booking_id) {
            debug!(%booking_id, "dropping fetch for inactive ride");
            return;
        }
        match result {
            Ok(mut ride) => {
                ride.booking_id.get_or_insert_with(|| booking_id.clone());
                self.apply(RideInput::Polled { ride }).await;
            }
            Err(e) => debug!(%booking_id, ?purpose, error = %e, "ride fetch failed"),
        }

        match purpose {
            FetchPurpose::Poll => self.arm_poll(),
            FetchPurpose::Hydration => {
                let code_present = self
                    .machine
                    .session()
                    .is_some_and(|s| s.verification_code().is_some());
                match self.hydration.record(&booking_id, code_present) {
                    HydrationStep::RetryAfter(delay) => self.hydrate(booking_id, delay),
                    HydrationStep::GaveUp { attempts } => {
                        info!(%booking_id, attempts, "code still missing, leaving it to the poller");
                        self.hydration_task = None;
                    }
                    HydrationStep::Done | HydrationStep::NotRunning => self.hydration_task = None,
                }
            }
        }
    }

    // ===========================================
    // Helpers
    // ===========================================

    fn relay_link_events(&mut self) {
        for event in self.connection.drain_events() {
            match event {
                ConnectionEvent::Connected { attempt } => {
                    info!(attempt, "broker link up");
                    self.realtime_unavailable = false;
                    self.notify(RideNotice::Connected);
                    if std::mem::take(&mut self.resync_on_connect) {
                        self.resync();
                    }
                }
                ConnectionEvent::ConnectFailed { attempt, error } => {
                    debug!(attempt, %error, "connect attempt failed");
                    self.resync_on_connect = true;
                    self.notify(RideNotice::Reconnecting { failures: attempt });
                }
                ConnectionEvent::LinkLost { reason } => {
                    warn!(%reason, "broker link lost");
                    self.resync_on_connect = true;
                    self.notify(RideNotice::Reconnecting { failures: 0 });
                }
                ConnectionEvent::RealtimeUnavailable { failures } => {
                    warn!(failures, "real-time updates unavailable, polling instead");
                    self.realtime_unavailable = true;
                    self.notify(RideNotice::RealtimeUnavailable { failures });
                }
            }
        }
    }

    /// Catch up on pushes missed while the link was down.
    fn resync(&mut self) {
        if let Some(booking_id) = self.machine.active_booking().cloned() {
            debug!(%booking_id, "link restored, fetching ride");
            self.poll_task = Some(self.fetch("resync", booking_id, FetchPurpose::Poll, Duration::ZERO));
        }
    }

    fn notify(&self, notice: RideNotice) {
        let _ = self.notices.send(notice);
    }

    fn command_failed(&self, command: &'static str, error: ApiError) -> EngineError {
        warn!(command, error = %error, "command failed");
        self.notify(RideNotice::CommandFailed {
            command,
            message: error.to_string(),
        });
        match error {
            ApiError::Rejected { status, message } => EngineError::CommandRejected {
                command,
                status,
                message,
            },
            ApiError::NotFound => EngineError::CommandRejected {
                command,
                status: 404,
                message: "ride not found".into(),
            },
            other => EngineError::Api(other),
        }
    }

    fn require_role(&self, command: &'static str, required: Role) -> Result<(), EngineError> {
        if self.role() == required {
            Ok(())
        } else {
            Err(EngineError::WrongRole { command, required })
        }
    }

    fn require_idle(&self, command: &'static str) -> Result<(), EngineError> {
        match self.machine.session() {
            Some(session) => Err(EngineError::InvalidPhase {
                command,
                phase: session.phase(),
            }),
            None => Ok(()),
        }
    }

    fn require_phase(&self, command: &'static str, phase: RidePhase) -> Result<BookingId, EngineError> {
        let session = self.machine.session().ok_or(EngineError::NoActiveRide)?;
        if session.phase() != phase {
            return Err(EngineError::InvalidPhase {
                command,
                phase: session.phase(),
            });
        }
        Ok(session.booking_id().clone())
    }
}

impl<T: Transport + 'static> std::fmt::Debug for RideEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RideEngine")
            .field("role", &self.role())
            .field("participant", self.participant())
            .field("phase", &self.phase())
            .field("booking_id", &self.machine.active_booking())
            .field("link", &self.connection.state())
            .finish()
    }
}
