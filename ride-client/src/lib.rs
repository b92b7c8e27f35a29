//! # ridesync-client
//!
//! Client engine for ridesync ride-state synchronization.
//!
//! One [`RideEngine`] per signed-in participant keeps a ride's local state
//! converged with the server across push events, polled snapshots and app
//! restarts.
//!
//! ## Features
//!
//! - **Single writer**: every input goes through the pure `ride-core` machine
//! - **Transport Abstraction**: STOMP over WebSocket, or an in-memory mock
//! - **Resilient link**: queued operations, subscription replay, backoff
//! - **Poll fallback**: reconciliation keeps working without the broker
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ride_client::{EngineConfig, FileSessionStore, HttpRideApi, RideEngine, StompTransport};
//!
//! let config = EngineConfig::default();
//! let api = HttpRideApi::new(&config.api_base, config.request_timeout())?;
//! let (mut engine, mut notices) = RideEngine::new(
//!     config,
//!     Role::Requester,
//!     ParticipantId::new("c1"),
//!     Arc::new(StompTransport::new()),
//!     Arc::new(api),
//!     Arc::new(FileSessionStore::new("active_ride.json")),
//! );
//!
//! engine.resume().await?;
//! loop {
//!     engine.step().await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod connection;
pub mod engine;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod transport;

pub use api::{ApiError, HttpRideApi, MockRideApi, Published, RideApi};
pub use config::{ConfigError, EngineConfig};
pub use connection::{ConnectionManager, LinkSignal};
pub use engine::{EngineError, RideEngine, RideNotice, CODE_LENGTH};
pub use registry::{typed_handler, Decode, Handler, SubscriptionRegistry};
pub use schedule::ScheduledTask;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
pub use transport::{
    Frame, MockTransport, StompFrame, StompTransport, SubscriptionId, Transport, TransportError,
};
