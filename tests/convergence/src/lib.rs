//! # convergence-tests
//!
//! Two-party convergence harness for ridesync.
//!
//! A requester engine and a provider engine run against one in-memory
//! backend. A [`broker::Broker`] carries messages between them and can drop,
//! duplicate or hold them back. Scenarios drive both engines under paused
//! tokio time and check that they agree on the ride:
//!
//! - both sides converge on the server's phase and booking
//! - phases never move backwards, whatever order pushes arrive in
//! - a verification code, once known, is never lost
//! - operations issued while offline are delivered once, in order
//! - a restart resumes live rides and never terminal ones

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assertions;
pub mod broker;
pub mod harness;

#[cfg(test)]
mod scenarios;
