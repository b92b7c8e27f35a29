//! Mock transport for testing.
//!
//! Behaves like a tiny in-memory broker for one client: tests publish with
//! [`MockTransport::deliver`], inspect what the client sent, and inject link
//! failures.

use super::{Frame, SubscriptionId, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the engine owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: u32,
    next_subscription: u64,
    subscriptions: HashMap<SubscriptionId, String>,
    subscribe_log: Vec<String>,
    unsubscribe_log: Vec<String>,
    sent: Vec<(String, String)>,
    receive_queue: VecDeque<Frame>,
    connect_failures: VecDeque<String>,
    connect_delay: Option<Duration>,
    fail_next_send: Option<String>,
    fail_next_subscribe: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `body` to every live subscription on `destination`.
    ///
    /// Returns how many subscriptions received it.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let delivered = {
            let mut inner = self.inner();
            if !inner.connected {
                return 0;
            }
            let matching: Vec<SubscriptionId> = inner
                .subscriptions
                .iter()
                .filter(|(_, dest)| dest.as_str() == destination)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &matching {
                inner.receive_queue.push_back(Frame {
                    subscription: id.clone(),
                    destination: destination.to_string(),
                    body: body.to_string(),
                });
            }
            matching.len()
        };
        self.notify.notify_waiters();
        delivered
    }

    /// Sever the link as if the socket died. Pending `recv()` calls fail.
    pub fn drop_link(&self) {
        {
            let mut inner = self.inner();
            inner.connected = false;
            inner.subscriptions.clear();
            inner.receive_queue.clear();
        }
        self.notify.notify_waiters();
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner().connect_failures.push_back(error.to_string());
    }

    /// Cause the next `count` connect() calls to fail.
    pub fn fail_connects(&self, count: usize, error: &str) {
        let mut inner = self.inner();
        for _ in 0..count {
            inner.connect_failures.push_back(error.to_string());
        }
    }

    /// Forget any connect failures still queued.
    pub fn clear_connect_failures(&self) {
        self.inner().connect_failures.clear();
    }

    /// Make connect() take `delay` before resolving.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner().connect_delay = delay;
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner().fail_next_send = Some(error.to_string());
    }

    /// Cause the next subscribe() to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        self.inner().fail_next_subscribe = Some(error.to_string());
    }

    /// All `(destination, body)` pairs that were sent.
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.inner().sent.clone()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<(String, String)> {
        std::mem::take(&mut self.inner().sent)
    }

    /// Destinations of every subscribe() call, in order.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.inner().subscribe_log.clone()
    }

    /// Destinations of every unsubscribe() call, in order.
    pub fn unsubscribe_log(&self) -> Vec<String> {
        self.inner().unsubscribe_log.clone()
    }

    /// Destinations with a live subscription (one entry per subscription).
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut destinations: Vec<String> =
            self.inner().subscriptions.values().cloned().collect();
        destinations.sort();
        destinations
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        self.inner().connect_count
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.inner().connected_address.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let delay = self.inner().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner();
        if let Some(error) = inner.connect_failures.pop_front() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connect_count += 1;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<SubscriptionId, TransportError> {
        let mut inner = self.inner();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(TransportError::SubscribeFailed(error));
        }

        inner.next_subscription += 1;
        let id = SubscriptionId::new(format!("sub-{}", inner.next_subscription));
        inner.subscriptions.insert(id.clone(), destination.to_string());
        inner.subscribe_log.push(destination.to_string());
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        let mut inner = self.inner();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(destination) = inner.subscriptions.remove(id) {
            inner.unsubscribe_log.push(destination);
        }
        inner.receive_queue.retain(|frame| &frame.subscription != id);
        Ok(())
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        let mut inner = self.inner();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent.push((destination.to_string(), body.to_string()));
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        loop {
            // Registered before the check so a deliver() in between is not missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner();
                if !inner.connected {
                    return Err(TransportError::ConnectionClosed);
                }
                if let Some(frame) = inner.receive_queue.pop_front() {
                    return Ok(frame);
                }
            }
            notified.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.inner().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.inner();
            inner.connected = false;
            inner.subscriptions.clear();
            inner.receive_queue.clear();
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
