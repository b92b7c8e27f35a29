//! Convergence scenarios.
//!
//! - `lifecycle` - a full ride, cancellation and chat between both parties
//! - `faults` - dropped, duplicated and reordered broker messages
//! - `restart` - process restarts against the persisted ride
//! - `link` - broker outages, offline queueing and the poller fallback
//!
//! All scenarios run under paused tokio time.

mod faults;
mod lifecycle;
mod link;
mod restart;
