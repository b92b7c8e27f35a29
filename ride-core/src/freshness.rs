//! Reconciliation poll policy and staleness tracking.
//!
//! Push delivery is trusted while it keeps arriving. The policy decides, on
//! every poll tick, whether a fetch of the ride resource is worth making:
//! - BOOKING: fast match polls for a bounded window, then slow polls
//! - TRACKING / IN_PROGRESS: poll when the last trusted update is older than
//!   the staleness threshold, when pushes left the ride incomplete (no
//!   verification code after hydration gave up), or unconditionally once
//!   real-time updates have been reported unavailable
//! - anything else: never
//!
//! [`StalenessMonitor`] adds the ceiling: after a long stretch without any
//! trusted update it reports the ride unreachable once, and re-arms when
//! updates resume.

use std::time::{Duration, Instant};

use crate::ride::RidePhase;

/// Poll cadence and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Tick interval while tracking or in progress.
    pub poll_interval: Duration,
    /// Age of the last trusted update after which a tick fetches.
    pub stale_after: Duration,
    /// Tick interval while waiting for a match.
    pub match_interval: Duration,
    /// How long after booking the fast match poll runs.
    pub match_window: Duration,
    /// Age after which the ride is reported unreachable.
    pub stale_ceiling: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            stale_after: Duration::from_millis(6000),
            match_interval: Duration::from_millis(3000),
            match_window: Duration::from_millis(120_000),
            stale_ceiling: Duration::from_millis(600_000),
        }
    }
}

/// Result of a poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Nothing to do this tick.
    Skip,
    /// Fetch while waiting for a match.
    MatchPoll,
    /// Fetch to reconcile a stale or push-less ride.
    Reconcile,
}

/// Inputs the policy reads on each tick.
#[derive(Debug, Clone, Copy)]
pub struct PollContext {
    /// Current ride phase.
    pub phase: RidePhase,
    /// When the current phase was entered.
    pub phase_since: Instant,
    /// Last trusted update, if any.
    pub last_trusted: Option<Instant>,
    /// Real-time updates were reported unavailable and the link is still down.
    pub realtime_unavailable: bool,
    /// Data the participant needs is still missing and no other fetch is
    /// chasing it.
    pub incomplete: bool,
}

impl PollPolicy {
    /// Interval until the next tick in `phase` entered at `phase_since`.
    pub fn interval(&self, phase: RidePhase, phase_since: Instant, now: Instant) -> Duration {
        match phase {
            RidePhase::Booking if now.saturating_duration_since(phase_since) < self.match_window => {
                self.match_interval
            }
            _ => self.poll_interval,
        }
    }

    /// Decide what a tick should do.
    pub fn decide(&self, ctx: &PollContext, now: Instant) -> PollDecision {
        match ctx.phase {
            RidePhase::Booking => {
                if now.saturating_duration_since(ctx.phase_since) < self.match_window {
                    PollDecision::MatchPoll
                } else {
                    PollDecision::Reconcile
                }
            }
            RidePhase::Tracking | RidePhase::InProgress => {
                if ctx.realtime_unavailable
                    || ctx.incomplete
                    || self.is_stale(ctx.last_trusted, now)
                {
                    PollDecision::Reconcile
                } else {
                    PollDecision::Skip
                }
            }
            _ => PollDecision::Skip,
        }
    }

    /// Whether `last_trusted` is older than the staleness threshold.
    pub fn is_stale(&self, last_trusted: Option<Instant>, now: Instant) -> bool {
        match last_trusted {
            Some(at) => now.saturating_duration_since(at) > self.stale_after,
            None => true,
        }
    }
}

/// One-shot "ride unreachable" reporting per staleness episode.
#[derive(Debug, Clone, Default)]
pub struct StalenessMonitor {
    reported: bool,
}

impl StalenessMonitor {
    /// Create a monitor with nothing reported.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once when the ceiling is first exceeded.
    pub fn check(&mut self, last_trusted: Instant, ceiling: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(last_trusted) <= ceiling {
            self.reported = false;
            return false;
        }
        if self.reported {
            return false;
        }
        self.reported = true;
        true
    }

    /// Whether the current episode has been reported.
    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Forget the current episode.
    pub fn reset(&mut self) {
        self.reported = false;
    }
}
