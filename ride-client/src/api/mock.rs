//! In-memory ride backend for tests.
//!
//! Keeps authoritative ride records, enforces the server-side status rules
//! and records what a real server would publish on the broker. Tests (and
//! the convergence harness) drain [`MockRideApi::take_published`] and route
//! the messages through mock transports.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ride_types::{
    BookingId, BookingRequest, Coordinates, FareQuote, NearbyQuery, ParticipantId, RideEvent,
    RideSnapshot, RideStatus, TopicKey,
};

use super::{ApiError, RideApi};

/// A broker message the backend would have published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Broker destination.
    pub destination: String,
    /// JSON body.
    pub body: String,
}

/// In-memory [`RideApi`]. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MockRideApi {
    inner: Arc<Mutex<Backend>>,
}

#[derive(Debug, Default)]
struct Backend {
    rides: BTreeMap<BookingId, RideSnapshot>,
    next_booking: u32,
    fetches: HashMap<BookingId, u32>,
    withheld_code: HashMap<BookingId, u32>,
    scripted: HashMap<BookingId, VecDeque<RideSnapshot>>,
    failures: HashMap<String, VecDeque<ApiError>>,
    calls: Vec<String>,
    published: Vec<Published>,
    providers: Vec<ParticipantId>,
    push_includes_code: bool,
}

impl MockRideApi {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a ride record as-is.
    pub fn insert_ride(&self, ride: RideSnapshot) {
        if let Some(id) = ride.booking_id.clone() {
            self.backend().rides.insert(id, ride);
        }
    }

    /// Current record of a ride.
    pub fn ride_record(&self, booking_id: &BookingId) -> Option<RideSnapshot> {
        self.backend().rides.get(booking_id).cloned()
    }

    /// Overwrite a ride's status without publishing anything.
    pub fn set_status(&self, booking_id: &BookingId, status: RideStatus) {
        if let Some(ride) = self.backend().rides.get_mut(booking_id) {
            ride.status = Some(status);
        }
    }

    /// Store a provider's position on every unfinished ride assigned to it.
    /// Returns the rides that were updated.
    pub fn record_driver_position(
        &self,
        driver: &ParticipantId,
        position: Coordinates,
    ) -> Vec<BookingId> {
        let mut backend = self.backend();
        let mut updated = Vec::new();
        for (id, ride) in backend.rides.iter_mut() {
            let assigned = ride.driver_id.as_ref() == Some(driver);
            let finished = ride.status.is_some_and(|s| s.is_terminal());
            if assigned && !finished {
                ride.driver_lat = Some(position.lat);
                ride.driver_lng = Some(position.lng);
                updated.push(id.clone());
            }
        }
        updated
    }

    /// Omit the verification code from the next `fetches` reads of a ride.
    pub fn withhold_code(&self, booking_id: &BookingId, fetches: u32) {
        self.backend()
            .withheld_code
            .insert(booking_id.clone(), fetches);
    }

    /// Make the next read of a ride return `ride` instead of the record.
    pub fn script_fetch(&self, booking_id: &BookingId, ride: RideSnapshot) {
        self.backend()
            .scripted
            .entry(booking_id.clone())
            .or_default()
            .push_back(ride);
    }

    /// Fail the next call of `operation` (`ride`, `book`, `accept`, ...).
    pub fn fail_next(&self, operation: &str, error: ApiError) {
        self.backend()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Include the verification code in pushed acceptance events.
    pub fn set_push_includes_code(&self, include: bool) {
        self.backend().push_includes_code = include;
    }

    /// Providers that receive pushed ride requests for new bookings.
    pub fn register_provider(&self, provider: ParticipantId) {
        self.backend().providers.push(provider);
    }

    /// Every call made, as `"<operation> <booking id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.backend().calls.clone()
    }

    /// Number of reads of one ride.
    pub fn fetch_count(&self, booking_id: &BookingId) -> u32 {
        self.backend().fetches.get(booking_id).copied().unwrap_or(0)
    }

    /// Drain the messages the backend would have published.
    pub fn take_published(&self) -> Vec<Published> {
        std::mem::take(&mut self.backend().published)
    }
}

impl Backend {
    fn begin(&mut self, operation: &str, subject: &str) -> Result<(), ApiError> {
        self.calls.push(format!("{operation} {subject}").trim_end().to_string());
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn record(&mut self, booking_id: &BookingId) -> Result<&mut RideSnapshot, ApiError> {
        self.rides.get_mut(booking_id).ok_or(ApiError::NotFound)
    }

    fn publish(&mut self, key: TopicKey, event: &RideEvent) {
        if let Ok(body) = serde_json::to_string(event) {
            self.published.push(Published {
                destination: key.destination(),
                body,
            });
        }
    }

    /// Publish a lifecycle event to both parties' ride-updates topics.
    fn publish_to_parties(&mut self, ride: &RideSnapshot, event: RideEvent) {
        let parties: Vec<ParticipantId> = [&ride.customer_id, &ride.driver_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for party in parties {
            self.publish(TopicKey::ride_updates(&party), &event);
        }
    }

    fn next_code(&mut self) -> String {
        format!("{:04}", 1000 + (self.next_booking * 7919) % 9000)
    }
}

fn rejected(message: &str) -> ApiError {
    ApiError::Rejected {
        status: 400,
        message: message.to_string(),
    }
}

fn without_code(ride: &RideSnapshot) -> RideSnapshot {
    RideSnapshot {
        otp: None,
        ..ride.clone()
    }
}

#[async_trait]
impl RideApi for MockRideApi {
    async fn ride(&self, booking_id: &BookingId) -> Result<RideSnapshot, ApiError> {
        let mut backend = self.backend();
        backend.begin("ride", booking_id.as_str())?;
        *backend.fetches.entry(booking_id.clone()).or_insert(0) += 1;

        if let Some(scripted) = backend
            .scripted
            .get_mut(booking_id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(scripted);
        }
        let mut ride = backend.record(booking_id)?.clone();
        // The code is only revealed once a provider has accepted.
        if ride.status == Some(RideStatus::Pending) {
            ride.otp = None;
        }
        match backend.withheld_code.get_mut(booking_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(without_code(&ride))
            }
            _ => Ok(ride),
        }
    }

    async fn quote(&self, request: &BookingRequest) -> Result<Vec<FareQuote>, ApiError> {
        self.backend().begin("quote", request.customer_id.as_str())?;
        let km = request.pickup().distance_km(&request.drop_off());
        let price = |base: f64, per_km: f64| ((base + per_km * km) * 100.0).round() / 100.0;
        Ok(vec![
            FareQuote {
                vehicle_type: "bike".into(),
                fare: price(20.0, 8.0),
                eta_minutes: Some(3),
            },
            FareQuote {
                vehicle_type: "auto".into(),
                fare: price(30.0, 12.0),
                eta_minutes: Some(5),
            },
            FareQuote {
                vehicle_type: "car".into(),
                fare: price(50.0, 18.0),
                eta_minutes: Some(7),
            },
        ])
    }

    async fn book(&self, request: &BookingRequest) -> Result<RideSnapshot, ApiError> {
        let mut backend = self.backend();
        backend.begin("book", request.customer_id.as_str())?;
        backend.next_booking += 1;
        let booking_id = BookingId::new(format!("BK{:04}", backend.next_booking));
        let ride = RideSnapshot {
            booking_id: Some(booking_id.clone()),
            status: Some(RideStatus::Pending),
            customer_id: Some(request.customer_id.clone()),
            pickup_location: Some(request.pickup_location.clone()),
            drop_location: Some(request.drop_location.clone()),
            pickup_lat: Some(request.pickup_lat),
            pickup_lng: Some(request.pickup_lng),
            drop_lat: Some(request.drop_lat),
            drop_lng: Some(request.drop_lng),
            vehicle_type: Some(request.vehicle_type.clone()),
            fare: request.fare,
            otp: Some(backend.next_code()),
            ..Default::default()
        };
        backend.rides.insert(booking_id, ride.clone());

        let request_body = without_code(&ride);
        let confirmation = request_body.clone();
        let providers = backend.providers.clone();
        for provider in providers {
            if let Ok(body) = serde_json::to_string(&request_body) {
                backend.published.push(Published {
                    destination: TopicKey::ride_requests(&provider).destination(),
                    body,
                });
            }
        }
        Ok(confirmation)
    }

    async fn accept(
        &self,
        booking_id: &BookingId,
        provider: &ParticipantId,
    ) -> Result<RideSnapshot, ApiError> {
        let mut backend = self.backend();
        backend.begin("accept", booking_id.as_str())?;
        let ride = backend.record(booking_id)?;
        if ride.status != Some(RideStatus::Pending) {
            return Err(rejected("Ride already accepted"));
        }
        ride.status = Some(RideStatus::Accepted);
        ride.driver_id = Some(provider.clone());
        ride.driver_name = Some(format!("Driver {provider}"));
        ride.vehicle_number = Some("KA01AB1234".into());
        let ride = ride.clone();

        let pushed = if backend.push_includes_code {
            ride.clone()
        } else {
            without_code(&ride)
        };
        if let Some(customer) = ride.customer_id.clone() {
            backend.publish(
                TopicKey::ride_updates(&customer),
                &RideEvent::Matched { ride: pushed },
            );
        }
        Ok(without_code(&ride))
    }

    async fn verify_code(&self, booking_id: &BookingId, code: &str) -> Result<(), ApiError> {
        let mut backend = self.backend();
        backend.begin("verify", booking_id.as_str())?;
        let ride = backend.record(booking_id)?;
        if ride.status != Some(RideStatus::Accepted) {
            return Err(rejected("Ride is not awaiting verification"));
        }
        if ride.verification_code() != Some(code) {
            return Err(rejected("Invalid OTP"));
        }
        Ok(())
    }

    async fn start(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError> {
        let mut backend = self.backend();
        backend.begin("start", booking_id.as_str())?;
        let ride = backend.record(booking_id)?;
        if ride.status != Some(RideStatus::Accepted) {
            return Err(rejected("Ride cannot be started"));
        }
        ride.status = Some(RideStatus::InProgress);
        let ride = without_code(ride);
        backend.publish_to_parties(
            &ride,
            RideEvent::Started {
                ride: Some(ride.clone()),
            },
        );
        Ok(Some(ride))
    }

    async fn complete(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError> {
        let mut backend = self.backend();
        backend.begin("complete", booking_id.as_str())?;
        let ride = backend.record(booking_id)?;
        if ride.status != Some(RideStatus::InProgress) {
            return Err(rejected("Ride is not in progress"));
        }
        ride.status = Some(RideStatus::Completed);
        let ride = without_code(ride);
        backend.publish_to_parties(
            &ride,
            RideEvent::Completed {
                ride: Some(ride.clone()),
            },
        );
        Ok(Some(ride))
    }

    async fn cancel(&self, booking_id: &BookingId) -> Result<(), ApiError> {
        let mut backend = self.backend();
        backend.begin("cancel", booking_id.as_str())?;
        let ride = backend.record(booking_id)?;
        if ride.status.is_some_and(|s| s.is_terminal()) {
            return Err(rejected("Ride already finished"));
        }
        ride.status = Some(RideStatus::Cancelled);
        let ride = without_code(ride);
        backend.publish_to_parties(
            &ride,
            RideEvent::Cancelled {
                ride: Some(ride.clone()),
            },
        );
        Ok(())
    }

    async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<RideSnapshot>, ApiError> {
        let mut backend = self.backend();
        backend.begin("nearby", "")?;
        let center = Coordinates::new(query.latitude, query.longitude);
        Ok(backend
            .rides
            .values()
            .filter(|ride| ride.status == Some(RideStatus::Pending))
            .filter(|ride| {
                ride.pickup()
                    .is_some_and(|pickup| pickup.distance_km(&center) <= query.radius)
            })
            .filter(|ride| query.min_fare.map_or(true, |min| ride.fare.unwrap_or(0.0) >= min))
            .map(without_code)
            .collect())
    }
}
