//! Connection state machine for the broker link.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the broker connection lifecycle. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening the socket, flushing queued operations) is
//! performed by ride-client, not by this module.

use std::time::Duration;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no reconnect scheduled.
    Disconnected,
    /// Connection attempt in progress.
    Connecting {
        /// 1-based number of this attempt since the last healthy link.
        attempt: u32,
    },
    /// Link is up; operations go straight to the transport.
    Connected,
    /// Link is down, waiting for the reconnect timer.
    Reconnecting {
        /// Consecutive failed attempts so far.
        failures: u32,
    },
}

/// Backoff and escalation settings for reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect; doubles per failure.
    pub base: Duration,
    /// Cap on the exponential part of the delay.
    pub max: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub jitter: Duration,
    /// Consecutive failures after which real-time updates are reported unavailable.
    pub unavailable_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(5000),
            unavailable_after: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnection delay with jitter.
    ///
    /// Formula: min(max, base * 2^(attempt-1)) + random(0..=jitter)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + Duration::from_millis(random_jitter_ms(self.jitter))
    }

    /// The exponential part of [`delay`](Self::delay), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (ride-client)
    /// is responsible for executing the returned actions in order.
    pub fn on_event(self, event: Event, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected, Event::ConnectRequested) => {
                (Self::Connecting { attempt: 1 }, vec![Action::Connect])
            }
            (Self::Disconnected, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![Action::UnsubscribeAll, Action::DiscardPending],
            ),

            // From Connecting
            (Self::Connecting { attempt }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![
                    Action::EmitEvent(ConnectionEvent::Connected { attempt }),
                    Action::FlushPending,
                ],
            ),
            (Self::Connecting { attempt }, Event::ConnectFailed { error }) => {
                let mut actions = vec![Action::EmitEvent(ConnectionEvent::ConnectFailed {
                    attempt,
                    error,
                })];
                if attempt == policy.unavailable_after {
                    actions.push(Action::EmitEvent(ConnectionEvent::RealtimeUnavailable {
                        failures: attempt,
                    }));
                }
                actions.push(Action::StartReconnectTimer {
                    delay: policy.delay(attempt.saturating_add(1)),
                });
                (Self::Reconnecting { failures: attempt }, actions)
            }
            (Self::Connecting { .. }, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::UnsubscribeAll,
                    Action::Close,
                    Action::DiscardPending,
                ],
            ),
            // Idempotent: callers attach to the in-flight attempt.
            (state @ Self::Connecting { .. }, Event::ConnectRequested) => (state, vec![]),

            // From Connected
            (Self::Connected, Event::LinkLost { reason }) => (
                Self::Reconnecting { failures: 0 },
                vec![
                    Action::RequeueSubscriptions,
                    Action::EmitEvent(ConnectionEvent::LinkLost { reason }),
                    Action::StartReconnectTimer {
                        delay: policy.delay(1),
                    },
                ],
            ),
            (Self::Connected, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::UnsubscribeAll,
                    Action::Close,
                    Action::DiscardPending,
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { failures }, Event::ReconnectTimer) => (
                Self::Connecting {
                    attempt: failures.saturating_add(1),
                },
                vec![Action::Connect],
            ),
            (Self::Reconnecting { failures }, Event::ConnectRequested) => (
                Self::Connecting {
                    attempt: failures.saturating_add(1),
                },
                vec![Action::CancelReconnect, Action::Connect],
            ),
            (Self::Reconnecting { .. }, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::CancelReconnect,
                    Action::UnsubscribeAll,
                    Action::DiscardPending,
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if an attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Consecutive failed attempts, zero unless reconnecting.
    pub fn failures(&self) -> u32 {
        match self {
            Self::Reconnecting { failures } => *failures,
            Self::Connecting { attempt } => attempt.saturating_sub(1),
            _ => 0,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked for a link.
    ConnectRequested,
    /// Transport handshake completed.
    ConnectSucceeded,
    /// Transport handshake failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An established link dropped.
    LinkLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Caller tore the connection down.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by ride-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a transport connection attempt.
    Connect,
    /// Tear down the transport (or abort the in-flight attempt).
    Close,
    /// Replay queued operations in FIFO order, each exactly once.
    FlushPending,
    /// Drop queued operations without sending them.
    DiscardPending,
    /// Unsubscribe and forget every registry entry.
    UnsubscribeAll,
    /// Mark registry entries unbound and queue their re-subscription.
    RequeueSubscriptions,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Emit an event to the application.
    EmitEvent(ConnectionEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Link established.
    Connected {
        /// Which attempt succeeded (1 = first try).
        attempt: u32,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// Which attempt failed.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// An established link dropped.
    LinkLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Reconnects keep failing; emitted once when the threshold is crossed.
    RealtimeUnavailable {
        /// Consecutive failures at the time of the notice.
        failures: u32,
    },
}

/// Generate random jitter between 0 and `max` milliseconds inclusive.
fn random_jitter_ms(max: Duration) -> u64 {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % (max_ms + 1),
        // No entropy source: fall back to the plain exponential delay.
        Err(_) => 0,
    }
}
