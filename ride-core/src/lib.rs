//! # ride-core
//!
//! Pure logic for ridesync (no I/O, instant tests).
//!
//! This crate implements the state machines and policies for ride-state
//! synchronization without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in as an [`std::time::Instant`], never
//! read from a clock. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (broker link, HTTP, disk) is performed by `ride-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod freshness;
pub mod hydration;
pub mod ride;
pub mod smoother;
pub mod state;

pub use buffer::{PendingOperation, PendingQueue, QueueError};
pub use freshness::{PollContext, PollDecision, PollPolicy, StalenessMonitor};
pub use hydration::{HydrationBudget, HydrationPlan, HydrationPolicy, HydrationStep, HydrationTracker};
pub use ride::{
    CounterpartInfo, MergeOutcome, RideAction, RideInput, RideMachine, RidePhase, RideSession,
    RideSummary, Role,
};
pub use smoother::{LocationSample, LocationSmoother, SampleSource};
pub use state::{Action, ConnectionEvent, ConnectionState, Event, ReconnectPolicy};
