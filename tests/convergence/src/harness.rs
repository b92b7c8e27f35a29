//! Two-party test harness.
//!
//! A [`RidePair`] wires a requester engine and a provider engine to one
//! [`MockRideApi`] through a [`Broker`]. Each side owns its own
//! [`MockTransport`] and [`MemorySessionStore`], so a side can lose its link
//! or be restarted without touching the other.
//!
//! Everything is driven from the test task. [`RidePair::pump`] interleaves
//! broker routing with short engine slices; run it under
//! `#[tokio::test(start_paused = true)]` and simulated minutes pass
//! instantly.

use std::sync::Arc;
use std::time::Duration;

use ride_client::{
    EngineConfig, EngineError, MemorySessionStore, MockRideApi, MockTransport, RideEngine,
    RideNotice,
};
use ride_core::{RidePhase, Role};
use ride_types::{BookingId, BookingRequest, ChatMessage, ParticipantId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::assertions::PartyView;
use crate::broker::Broker;

/// Requester participant id.
pub const REQUESTER: &str = "c1";

/// Provider participant id.
pub const PROVIDER: &str = "d1";

/// Engine slice between two broker routes.
const SLICE: Duration = Duration::from_millis(10);

/// Connect failures queued by [`Party::go_offline`]; enough to outlast any
/// scenario.
const OFFLINE_ATTEMPTS: usize = 10_000;

/// Errors that can occur while driving a scenario.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An engine command failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A step needed state that is not there.
    #[error("missing {0}")]
    Missing(&'static str),
}

/// Which side of the ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The customer.
    Requester,
    /// The driver.
    Provider,
}

impl Side {
    fn role(self) -> Role {
        match self {
            Self::Requester => Role::Requester,
            Self::Provider => Role::Provider,
        }
    }

    fn participant(self) -> &'static str {
        match self {
            Self::Requester => REQUESTER,
            Self::Provider => PROVIDER,
        }
    }
}

/// One participant: engine, link and persisted state.
pub struct Party {
    /// Which side this is.
    pub side: Side,
    /// The engine under test.
    pub engine: RideEngine<MockTransport>,
    /// Test handle on the engine's link.
    pub transport: MockTransport,
    /// Test handle on the engine's persistence.
    pub store: MemorySessionStore,
    /// Every notice seen since the engine was created.
    pub notices: Vec<RideNotice>,
    receiver: mpsc::UnboundedReceiver<RideNotice>,
}

impl Party {
    fn spawn(side: Side, config: EngineConfig, api: &MockRideApi, store: MemorySessionStore) -> Self {
        let transport = MockTransport::new();
        let (engine, receiver) = RideEngine::new(
            config,
            side.role(),
            ParticipantId::new(side.participant()),
            Arc::new(transport.clone()),
            Arc::new(api.clone()),
            Arc::new(store.clone()),
        );
        Self {
            side,
            engine,
            transport,
            store,
            notices: Vec::new(),
            receiver,
        }
    }

    /// Pull pending notices into [`Party::notices`].
    pub fn collect(&mut self) {
        while let Ok(notice) = self.receiver.try_recv() {
            self.notices.push(notice);
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RidePhase {
        self.engine.phase()
    }

    /// Active booking, if any.
    pub fn booking_id(&self) -> Option<BookingId> {
        self.engine.session().map(|s| s.booking_id().clone())
    }

    /// Verification code of the active ride, if known.
    pub fn code(&self) -> Option<String> {
        self.engine
            .session()
            .and_then(|s| s.verification_code())
            .map(str::to_string)
    }

    /// Snapshot for the assertion helpers.
    pub fn view(&self) -> PartyView {
        PartyView {
            label: self.side.participant().to_string(),
            phase: self.phase(),
            booking_id: self.booking_id(),
            code: self.code(),
        }
    }

    /// Number of collected notices matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&RideNotice) -> bool) -> usize {
        self.notices.iter().filter(|n| predicate(n)).count()
    }

    /// Texts of received chat messages, in arrival order.
    pub fn chat_texts(&self) -> Vec<String> {
        self.notices
            .iter()
            .filter_map(|n| match n {
                RideNotice::Chat(ChatMessage { message, .. }) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Cut the link and refuse reconnects until [`Party::go_online`].
    pub fn go_offline(&self) {
        debug!(side = ?self.side, "going offline");
        self.transport
            .fail_connects(OFFLINE_ATTEMPTS, "broker unreachable");
        self.transport.drop_link();
    }

    /// Let the next reconnect attempt succeed.
    pub fn go_online(&self) {
        debug!(side = ?self.side, "back online");
        self.transport.clear_connect_failures();
    }
}

/// A requester and a provider sharing one backend.
pub struct RidePair {
    /// The shared backend.
    pub api: MockRideApi,
    /// Message routing between backend and clients.
    pub broker: Broker,
    /// The customer side.
    pub requester: Party,
    /// The driver side.
    pub provider: Party,
    config: EngineConfig,
}

impl Default for RidePair {
    fn default() -> Self {
        Self::new()
    }
}

impl RidePair {
    /// A pair with default engine settings and no reconnect jitter.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default().with_reconnect_jitter(Duration::ZERO))
    }

    /// A pair where both engines use `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        let api = MockRideApi::new();
        api.register_provider(ParticipantId::new(PROVIDER));
        Self {
            broker: Broker::new(api.clone()),
            requester: Party::spawn(Side::Requester, config.clone(), &api, MemorySessionStore::new()),
            provider: Party::spawn(Side::Provider, config.clone(), &api, MemorySessionStore::new()),
            api,
            config,
        }
    }

    /// Mutable access to one side.
    pub fn party(&mut self, side: Side) -> &mut Party {
        match side {
            Side::Requester => &mut self.requester,
            Side::Provider => &mut self.provider,
        }
    }

    /// Resume both engines.
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        self.requester.engine.resume().await?;
        self.provider.engine.resume().await?;
        self.collect();
        Ok(())
    }

    /// Route messages and run both engines for `duration` of tokio time.
    pub async fn pump(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            self.route();
            self.requester.engine.run_for(SLICE).await;
            self.route();
            self.provider.engine.run_for(SLICE).await;
            self.collect();
        }
    }

    /// Deliver held messages, then let both engines process them.
    pub async fn release_held(&mut self) -> usize {
        let released = self
            .broker
            .release_held(&[&self.requester.transport, &self.provider.transport]);
        self.pump(SLICE * 4).await;
        released
    }

    fn route(&mut self) {
        self.broker
            .route(&[&self.requester.transport, &self.provider.transport]);
    }

    fn collect(&mut self) {
        self.requester.collect();
        self.provider.collect();
    }

    /// Quote and book a ride as the requester.
    pub async fn book(&mut self) -> Result<BookingId, HarnessError> {
        let request = trip();
        self.requester.engine.quote(&request).await?;
        let booking_id = self.requester.engine.book(&request).await?;
        self.collect();
        Ok(booking_id)
    }

    /// Book, then accept as the provider once the request arrives.
    pub async fn book_and_match(&mut self) -> Result<BookingId, HarnessError> {
        let booking_id = self.book().await?;
        self.pump(Duration::from_millis(100)).await;
        let offered = self.provider.count(|n| {
            matches!(n, RideNotice::RideRequested(ride) if ride.booking_id.as_ref() == Some(&booking_id))
        });
        if offered == 0 {
            return Err(HarnessError::Missing("ride request on the provider"));
        }
        self.provider.engine.accept(&booking_id).await?;
        self.pump(Duration::from_secs(2)).await;
        Ok(booking_id)
    }

    /// Verify the code the backend assigned and start the trip.
    pub async fn start_trip(&mut self, booking_id: &BookingId) -> Result<(), HarnessError> {
        let code = self
            .api
            .ride_record(booking_id)
            .and_then(|ride| ride.otp)
            .ok_or(HarnessError::Missing("verification code"))?;
        self.provider.engine.verify_code(&code).await?;
        self.pump(Duration::from_millis(200)).await;
        Ok(())
    }

    /// Replace one side with a fresh engine over the same persisted state,
    /// as after a process restart, and resume it.
    pub async fn restart(&mut self, side: Side) -> Result<Option<BookingId>, HarnessError> {
        let config = self.config.clone();
        let api = self.api.clone();
        let party = self.party(side);
        let store = party.store.clone();
        *party = Party::spawn(side, config, &api, store);
        let resumed = party.engine.resume().await?;
        party.collect();
        Ok(resumed)
    }
}

/// The trip every scenario books.
pub fn trip() -> BookingRequest {
    BookingRequest {
        customer_id: ParticipantId::new(REQUESTER),
        pickup_location: "MG Road".into(),
        drop_location: "Indiranagar".into(),
        pickup_lat: 12.9756,
        pickup_lng: 77.6050,
        drop_lat: 12.9784,
        drop_lng: 77.6408,
        vehicle_type: "auto".into(),
        fare: Some(120.0),
        promo_code: None,
    }
}
