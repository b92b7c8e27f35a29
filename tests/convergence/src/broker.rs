//! In-memory message broker with fault injection.
//!
//! Stands in for the STOMP broker between the backend and the clients.
//! Every [`Broker::route`] drains what the backend published and what the
//! clients sent, relays client sends the way the server does, and fans the
//! result out to every attached transport.
//!
//! Fault rules match on a destination prefix and apply to the next N
//! messages: drop them, deliver them twice, or hold them back until
//! [`Broker::release_held`] delivers them in reverse order.

use ride_client::{MockRideApi, MockTransport, Published};
use ride_types::{
    BookingId, ChatMessage, Coordinates, LocationReport, LocationUpdate, ParticipantId, TopicKey,
    CHAT_SEND_DESTINATION, LOCATION_SEND_DESTINATION,
};
use tracing::{debug, warn};

/// What happens to a matching message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never delivered.
    Drop,
    /// Delivered twice.
    Duplicate,
    /// Kept until [`Broker::release_held`].
    Hold,
}

#[derive(Debug)]
struct FaultRule {
    prefix: String,
    fault: Fault,
    remaining: usize,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages handed to at least one subscription.
    pub delivered: usize,
    /// Messages removed by a [`Fault::Drop`] rule.
    pub dropped: usize,
    /// Extra copies sent by a [`Fault::Duplicate`] rule.
    pub duplicated: usize,
    /// Messages no subscription wanted.
    pub unroutable: usize,
}

/// Routes messages between one backend and any number of clients.
#[derive(Debug)]
pub struct Broker {
    api: MockRideApi,
    rules: Vec<FaultRule>,
    held: Vec<Published>,
    stats: BrokerStats,
}

impl Broker {
    /// Create a broker in front of `api`.
    pub fn new(api: MockRideApi) -> Self {
        Self {
            api,
            rules: Vec::new(),
            held: Vec::new(),
            stats: BrokerStats::default(),
        }
    }

    /// Apply `fault` to the next `count` messages whose destination starts
    /// with `prefix`.
    pub fn inject(&mut self, prefix: &str, fault: Fault, count: usize) {
        self.rules.push(FaultRule {
            prefix: prefix.to_string(),
            fault,
            remaining: count,
        });
    }

    /// Remove every fault rule that has not fired yet.
    pub fn clear_faults(&mut self) {
        self.rules.clear();
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> BrokerStats {
        self.stats
    }

    /// Number of messages currently held back.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Move everything pending to the clients. Returns how many messages
    /// reached at least one subscription.
    pub fn route(&mut self, transports: &[&MockTransport]) -> usize {
        let mut outbound = self.api.take_published();
        for transport in transports {
            for (destination, body) in transport.take_sent() {
                outbound.extend(self.relay(&destination, &body));
            }
        }

        let mut delivered = 0;
        for message in outbound {
            match self.fault_for(&message.destination) {
                None => delivered += self.fan_out(&message, transports),
                Some(Fault::Drop) => {
                    debug!(destination = %message.destination, "dropping message");
                    self.stats.dropped += 1;
                }
                Some(Fault::Duplicate) => {
                    delivered += self.fan_out(&message, transports);
                    self.fan_out(&message, transports);
                    self.stats.duplicated += 1;
                }
                Some(Fault::Hold) => self.held.push(message),
            }
        }
        delivered
    }

    /// Deliver held messages, newest first.
    pub fn release_held(&mut self, transports: &[&MockTransport]) -> usize {
        let held = std::mem::take(&mut self.held);
        held.iter()
            .rev()
            .map(|message| self.fan_out(message, transports))
            .sum()
    }

    fn fault_for(&mut self, destination: &str) -> Option<Fault> {
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| rule.remaining > 0 && destination.starts_with(&rule.prefix))?;
        rule.remaining -= 1;
        let fault = rule.fault;
        self.rules.retain(|rule| rule.remaining > 0);
        Some(fault)
    }

    fn fan_out(&mut self, message: &Published, transports: &[&MockTransport]) -> usize {
        let receivers: usize = transports
            .iter()
            .map(|t| t.deliver(&message.destination, &message.body))
            .sum();
        if receivers == 0 {
            self.stats.unroutable += 1;
            0
        } else {
            self.stats.delivered += 1;
            1
        }
    }

    /// Turn a client send into what the server would publish.
    fn relay(&self, destination: &str, body: &str) -> Vec<Published> {
        match destination {
            CHAT_SEND_DESTINATION => match ChatMessage::from_json(body) {
                Ok(message) => vec![Published {
                    destination: TopicKey::chat(&message.ride_id).destination(),
                    body: body.to_string(),
                }],
                Err(e) => {
                    warn!(error = %e, "malformed chat message");
                    Vec::new()
                }
            },
            LOCATION_SEND_DESTINATION => match serde_json::from_str::<LocationReport>(body) {
                Ok(report) => self.relay_location(report),
                Err(e) => {
                    warn!(error = %e, "malformed location report");
                    Vec::new()
                }
            },
            other => {
                warn!(destination = other, "no relay for destination");
                Vec::new()
            }
        }
    }

    fn relay_location(&self, report: LocationReport) -> Vec<Published> {
        let position = Coordinates::new(report.latitude, report.longitude);
        let bookings = self.api.record_driver_position(&report.driver_id, position);

        let mut out = Vec::with_capacity(bookings.len() + 1);
        out.extend(location_message(&report, None));
        for booking_id in bookings {
            out.extend(location_message(&report, Some(booking_id)));
        }
        out
    }
}

fn location_message(
    report: &LocationReport,
    booking_id: Option<BookingId>,
) -> Option<Published> {
    let destination = match &booking_id {
        Some(id) => TopicKey::booking_location(id).destination(),
        None => TopicKey::counterpart_location(&report.driver_id).destination(),
    };
    let update = LocationUpdate {
        driver_id: Some(report.driver_id.clone()),
        booking_id,
        latitude: report.latitude,
        longitude: report.longitude,
        heading: report.heading,
        speed: report.speed,
        timestamp: None,
    };
    match serde_json::to_string(&update) {
        Ok(body) => Some(Published { destination, body }),
        Err(e) => {
            warn!(driver = %report.driver_id, error = %e, "could not encode location update");
            None
        }
    }
}

/// Destination prefix of a participant's ride updates.
pub fn ride_updates_of(participant: &str) -> String {
    TopicKey::ride_updates(&ParticipantId::new(participant)).destination()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride_client::Transport;

    async fn subscribed(destination: &str) -> MockTransport {
        let transport = MockTransport::new();
        transport.connect("mock://broker").await.unwrap();
        transport.subscribe(destination).await.unwrap();
        transport
    }

    fn chat(text: &str) -> String {
        format!(r#"{{"rideId":"BK1","senderId":"c1","message":"{text}"}}"#)
    }

    #[tokio::test]
    async fn drop_rule_applies_to_the_next_matches_only() {
        let mut broker = Broker::new(MockRideApi::new());
        let client = subscribed("/topic/chat/BK1").await;
        broker.inject("/topic/chat/", Fault::Drop, 1);

        client.send(CHAT_SEND_DESTINATION, &chat("one")).await.unwrap();
        client.send(CHAT_SEND_DESTINATION, &chat("two")).await.unwrap();
        assert_eq!(broker.route(&[&client]), 1);

        let stats = broker.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn held_messages_come_back_reversed() {
        let mut broker = Broker::new(MockRideApi::new());
        let client = subscribed("/topic/chat/BK1").await;
        broker.inject("/topic/chat/", Fault::Hold, 2);

        for text in ["first", "second"] {
            client.send(CHAT_SEND_DESTINATION, &chat(text)).await.unwrap();
        }
        assert_eq!(broker.route(&[&client]), 0);
        assert_eq!(broker.held(), 2);
        assert_eq!(broker.release_held(&[&client]), 2);

        let mut texts = Vec::new();
        for _ in 0..2 {
            let frame = client.recv().await.unwrap();
            texts.push(ChatMessage::from_json(&frame.body).unwrap().message);
        }
        assert_eq!(texts, ["second", "first"]);
    }

    #[tokio::test]
    async fn unknown_send_destinations_are_not_relayed() {
        let mut broker = Broker::new(MockRideApi::new());
        let client = subscribed("/topic/chat/BK1").await;
        client.send("/app/elsewhere", "{}").await.unwrap();
        client.send(CHAT_SEND_DESTINATION, "not json").await.unwrap();
        assert_eq!(broker.route(&[&client]), 0);
        assert_eq!(broker.stats(), BrokerStats::default());
    }

    #[test]
    fn location_reports_fan_out_per_booking() {
        let report = LocationReport {
            driver_id: ParticipantId::new("d1"),
            latitude: 12.97,
            longitude: 77.59,
            heading: 90.0,
            speed: 4.0,
        };
        let general = location_message(&report, None).unwrap();
        assert_eq!(general.destination, "/topic/driver-location/d1");

        let scoped = location_message(&report, Some(BookingId::new("BK7"))).unwrap();
        assert_eq!(scoped.destination, "/topic/driver-location/BK7");
        let update = LocationUpdate::from_json(&scoped.body).unwrap();
        assert_eq!(update.booking_id, Some(BookingId::new("BK7")));
        assert!((update.latitude - 12.97).abs() < 1e-9);
    }
}
