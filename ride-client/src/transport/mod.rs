//! Transport abstraction for the pub/sub broker.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying broker link (STOMP over WebSocket, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes the link
//! - `subscribe()` / `unsubscribe()` manage broker subscriptions
//! - `send()` publishes a JSON body to a destination
//! - `recv()` yields the next message for any live subscription
//! - `close()` tears the link down
//!
//! `recv()` must be cancel-safe: the connection manager races it against
//! timers and engine input.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("ws://broker").await?;
//! let sub = transport.subscribe("/topic/ride-updates/42").await?;
//! let frame = transport.recv().await?;
//! assert_eq!(frame.subscription, sub);
//! ```

mod mock;
mod stomp;

pub use mock::MockTransport;
pub use stomp::{StompFrame, StompTransport};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use ride_core::QueueError;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Subscribe or unsubscribe failed.
    #[error("subscription failed: {0}")]
    SubscribeFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Broker sent something that is not valid STOMP.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation could not be queued for replay.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Connection attempt did not resolve within the bounded wait.
    #[error("connection timeout")]
    Timeout,
}

/// Opaque broker subscription handle.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wrap a transport-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form, as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Subscription that matched.
    pub subscription: SubscriptionId,
    /// Destination the message was published to.
    pub destination: String,
    /// Raw body (JSON).
    pub body: String,
}

/// Transport trait for the broker link.
///
/// Implementations handle the underlying connection mechanism
/// (STOMP over WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker at `address`.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Subscribe to a destination.
    async fn subscribe(&self, destination: &str) -> Result<SubscriptionId, TransportError>;

    /// Cancel a subscription.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError>;

    /// Publish a body to a destination.
    async fn send(&self, destination: &str, body: &str) -> Result<(), TransportError>;

    /// Receive the next message.
    ///
    /// Blocks until a message arrives or the link closes. Cancel-safe.
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the link.
    async fn close(&self) -> Result<(), TransportError>;
}
