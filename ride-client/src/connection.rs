//! Connection manager: the one logical broker link an engine owns.
//!
//! Drives [`ConnectionState`] from ride-core and executes its actions against
//! a [`Transport`]. Subscribes and sends issued while the link is down go into
//! the [`PendingQueue`] and are replayed in order once it comes up.
//!
//! The manager never blocks on its own. The owner calls [`wait`] to get the
//! next [`LinkSignal`] (attempt finished, frame, reconnect due) and then feeds
//! it back through [`handle`]. `wait` is cancel-safe, so it can sit in a
//! `select!` next to other inputs; `handle` is where state changes happen.
//!
//! [`wait`]: ConnectionManager::wait
//! [`handle`]: ConnectionManager::handle

use std::collections::VecDeque;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use ride_core::{Action, ConnectionEvent, ConnectionState, Event, PendingOperation, PendingQueue, ReconnectPolicy};
use ride_types::TopicKey;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::{Handler, SubscriptionRegistry};
use crate::transport::{Frame, Transport, TransportError};

/// Something the link needs the owner to act on.
#[derive(Debug)]
pub enum LinkSignal {
    /// The in-flight connection attempt resolved.
    AttemptFinished(Result<(), TransportError>),
    /// A message arrived, or the receive side failed.
    Frame(Result<Frame, TransportError>),
    /// The reconnect backoff elapsed.
    ReconnectDue,
}

/// Owns the transport, the subscription registry and the pending queue.
pub struct ConnectionManager<T: Transport + 'static> {
    transport: Arc<T>,
    address: String,
    state: ConnectionState,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    queue: PendingQueue,
    registry: SubscriptionRegistry,
    in_flight: Option<JoinHandle<Result<(), TransportError>>>,
    reconnect_at: Option<Instant>,
    events: VecDeque<ConnectionEvent>,
}

impl<T: Transport + 'static> ConnectionManager<T> {
    /// Create a disconnected manager.
    pub fn new(
        transport: Arc<T>,
        address: impl Into<String>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            transport,
            address: address.into(),
            state: ConnectionState::new(),
            policy,
            connect_timeout,
            queue: PendingQueue::new(max_pending),
            registry: SubscriptionRegistry::new(),
            in_flight: None,
            reconnect_at: None,
            events: VecDeque::new(),
        }
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Number of operations waiting for the link.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// The subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Take the lifecycle events emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Bring the link up.
    ///
    /// Idempotent: returns at once when connected, and attaches to the
    /// in-flight attempt when one exists instead of dialing again. Fails with
    /// [`TransportError::Timeout`] if the attempt does not resolve within the
    /// connect timeout; the attempt itself keeps running.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.apply(Event::ConnectRequested).await;

        let Some(attempt) = self.in_flight.as_mut() else {
            return if self.state.is_connected() {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            };
        };

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(joined) => {
                self.in_flight = None;
                let outcome = join_outcome(joined);
                let reply = match &outcome {
                    Ok(()) => Ok(()),
                    Err(TransportError::Timeout) => Err(TransportError::Timeout),
                    Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
                };
                self.handle(LinkSignal::AttemptFinished(outcome)).await;
                reply
            }
            Err(_) => {
                warn!(address = %self.address, "connect did not resolve in time");
                Err(TransportError::Timeout)
            }
        }
    }

    /// Tear the link down.
    ///
    /// Unsubscribes every registry entry first, then closes the transport and
    /// discards whatever is still queued.
    pub async fn disconnect(&mut self) {
        self.apply(Event::DisconnectRequested).await;
    }

    /// Register `key` with `handler` and subscribe (or queue the subscribe).
    ///
    /// An existing subscription for the same key is cancelled first.
    pub async fn subscribe(&mut self, key: TopicKey, handler: Handler) -> Result<(), TransportError> {
        let destination = key.destination();
        if let Some(old) = self.registry.insert(key.clone(), destination.clone(), handler) {
            if self.transport.is_connected() {
                if let Err(e) = self.transport.unsubscribe(&old).await {
                    debug!(topic = %key, error = %e, "unsubscribe of replaced handle failed");
                }
            }
        }

        if !self.state.is_connected() {
            debug!(topic = %key, "link down, queueing subscribe");
            self.queue.enqueue(PendingOperation::Subscribe { key })?;
            return Ok(());
        }

        match self.transport.subscribe(&destination).await {
            Ok(handle) => {
                debug!(topic = %key, subscription = %handle, "subscribed");
                self.registry.bind(&key, handle);
                Ok(())
            }
            Err(e) => {
                warn!(topic = %key, error = %e, "subscribe failed, treating link as lost");
                self.queue.enqueue(PendingOperation::Subscribe { key })?;
                self.apply(Event::LinkLost {
                    reason: e.to_string(),
                })
                .await;
                Ok(())
            }
        }
    }

    /// Cancel the subscription registered under `key`.
    pub async fn unsubscribe(&mut self, key: &TopicKey) {
        self.queue.remove_subscribe(key);
        let Some(handle) = self.registry.remove(key) else {
            return;
        };
        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(&handle).await {
                debug!(topic = %key, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Publish `body` to `destination`, or queue it while the link is down.
    pub async fn send(&mut self, destination: &str, body: String) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            self.queue.enqueue(PendingOperation::Send {
                destination: destination.to_string(),
                body,
            })?;
            return Ok(());
        }

        match self.transport.send(destination, &body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%destination, error = %e, "send failed, queueing for replay");
                self.queue.enqueue(PendingOperation::Send {
                    destination: destination.to_string(),
                    body,
                })?;
                self.apply(Event::LinkLost {
                    reason: e.to_string(),
                })
                .await;
                Ok(())
            }
        }
    }

    /// Wait for the next link signal. Cancel-safe.
    ///
    /// Pends forever when there is nothing to wait for (idle and
    /// disconnected).
    pub async fn wait(&mut self) -> LinkSignal {
        let connected = self.state.is_connected();
        let reconnect_at = self.reconnect_at;
        let transport = &self.transport;
        let in_flight = &mut self.in_flight;

        let attempt = async move {
            match in_flight {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        };
        let frames = async move {
            if connected {
                transport.recv().await
            } else {
                future::pending().await
            }
        };
        let timer = async move {
            match reconnect_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending().await,
            }
        };

        let signal = tokio::select! {
            biased;
            joined = attempt => LinkSignal::AttemptFinished(join_outcome(joined)),
            frame = frames => LinkSignal::Frame(frame),
            () = timer => LinkSignal::ReconnectDue,
        };

        match signal {
            LinkSignal::AttemptFinished(_) => self.in_flight = None,
            LinkSignal::ReconnectDue => self.reconnect_at = None,
            LinkSignal::Frame(_) => {}
        }
        signal
    }

    /// Act on a signal returned by [`wait`](Self::wait).
    pub async fn handle(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::AttemptFinished(Ok(())) => self.apply(Event::ConnectSucceeded).await,
            LinkSignal::AttemptFinished(Err(e)) => {
                warn!(address = %self.address, error = %e, "connection attempt failed");
                self.apply(Event::ConnectFailed {
                    error: e.to_string(),
                })
                .await;
            }
            LinkSignal::Frame(Ok(frame)) => {
                self.registry.dispatch(&frame);
            }
            LinkSignal::Frame(Err(e)) => {
                if self.state.is_connected() {
                    warn!(error = %e, "broker link lost");
                    self.apply(Event::LinkLost {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
            LinkSignal::ReconnectDue => self.apply(Event::ReconnectTimer).await,
        }
    }

    /// Feed an event through the state machine and run the resulting actions.
    async fn apply(&mut self, event: Event) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let (next, actions) = self.state.on_event(event, &self.policy);
            if next != self.state {
                debug!(from = ?self.state, to = ?next, "connection state");
            }
            self.state = next;
            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    events.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Connect => self.spawn_attempt(),
            Action::Close => {
                if let Some(attempt) = self.in_flight.take() {
                    attempt.abort();
                }
                if let Err(e) = self.transport.close().await {
                    debug!(error = %e, "transport close failed");
                }
            }
            Action::FlushPending => return self.flush().await,
            Action::DiscardPending => {
                let dropped = self.queue.clear();
                if dropped > 0 {
                    info!(dropped, "discarded pending operations");
                }
            }
            Action::UnsubscribeAll => {
                let connected = self.transport.is_connected();
                for handle in self.registry.drain() {
                    if !connected {
                        continue;
                    }
                    if let Err(e) = self.transport.unsubscribe(&handle).await {
                        debug!(subscription = %handle, error = %e, "unsubscribe failed");
                    }
                }
            }
            Action::RequeueSubscriptions => {
                let keys = self.registry.unbind_all();
                self.queue.requeue_subscriptions(keys);
            }
            Action::StartReconnectTimer { delay } => {
                info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => self.reconnect_at = None,
            Action::EmitEvent(event) => self.events.push_back(event),
        }
        None
    }

    fn spawn_attempt(&mut self) {
        if let Some(previous) = self.in_flight.take() {
            previous.abort();
        }
        let transport = Arc::clone(&self.transport);
        let address = self.address.clone();
        let limit = self.connect_timeout;
        debug!(%address, "starting connection attempt");
        self.in_flight = Some(tokio::spawn(async move {
            match tokio::time::timeout(limit, transport.connect(&address)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            }
        }));
    }

    /// Replay queued operations in order. Stops at the first failure, puts
    /// the failed operation back in front and reports the link as lost.
    async fn flush(&mut self) -> Option<Event> {
        let mut replayed = 0usize;
        while let Some(op) = self.queue.dequeue() {
            let result = match &op {
                PendingOperation::Subscribe { key } => {
                    let Some(destination) = self.registry.unbound_destination(key) else {
                        continue;
                    };
                    match self.transport.subscribe(&destination).await {
                        Ok(handle) => {
                            self.registry.bind(key, handle);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                PendingOperation::Send { destination, body } => {
                    self.transport.send(destination, body).await
                }
            };
            if let Err(e) = result {
                warn!(error = %e, replayed, "replay interrupted");
                self.queue.requeue_front(op);
                return Some(Event::LinkLost {
                    reason: e.to_string(),
                });
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "replayed pending operations");
        }
        None
    }
}

impl<T: Transport + 'static> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(attempt) = self.in_flight.take() {
            attempt.abort();
        }
    }
}

fn join_outcome(
    joined: Result<Result<(), TransportError>, tokio::task::JoinError>,
) -> Result<(), TransportError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(TransportError::ConnectionFailed(format!(
            "connection attempt aborted: {e}"
        ))),
    }
}
