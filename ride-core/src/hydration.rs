//! Bounded-retry bookkeeping for the verification code.
//!
//! The tracker only counts; ride-client performs the fetches and the waits.
//! At most one run exists per booking id, so a second trigger while a run is
//! in flight is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use ride_types::BookingId;

/// Which trigger started the run; the budgets differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HydrationBudget {
    /// The session entered tracking from a push or a local confirmation.
    AfterPush,
    /// The session entered tracking because a poll saw the acceptance.
    AfterPoll,
}

/// Attempt count and spacing for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationPlan {
    /// Total fetch attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

/// Plans for both budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationPolicy {
    /// Plan used after a push.
    pub after_push: HydrationPlan,
    /// Plan used after a poll.
    pub after_poll: HydrationPlan,
}

impl Default for HydrationPolicy {
    fn default() -> Self {
        Self {
            after_push: HydrationPlan {
                attempts: 3,
                delay: Duration::from_millis(500),
            },
            after_poll: HydrationPlan {
                attempts: 5,
                delay: Duration::from_millis(800),
            },
        }
    }
}

impl HydrationPolicy {
    /// The plan for a budget.
    pub fn plan(&self, budget: HydrationBudget) -> HydrationPlan {
        match budget {
            HydrationBudget::AfterPush => self.after_push,
            HydrationBudget::AfterPoll => self.after_poll,
        }
    }
}

/// What to do after an attempt resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationStep {
    /// The code arrived; the run is over.
    Done,
    /// Fetch again after the delay.
    RetryAfter(Duration),
    /// Attempts exhausted; the reconciliation poller is the remaining path.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
    /// No run exists for this booking (cancelled or never started).
    NotRunning,
}

#[derive(Debug, Clone)]
struct Run {
    plan: HydrationPlan,
    attempts_made: u32,
}

/// In-flight hydration runs keyed by booking id.
#[derive(Debug, Default)]
pub struct HydrationTracker {
    runs: HashMap<BookingId, Run>,
}

impl HydrationTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run. Returns `false` if one is already in flight.
    pub fn begin(&mut self, booking_id: &BookingId, plan: HydrationPlan) -> bool {
        if self.runs.contains_key(booking_id) || plan.attempts == 0 {
            return false;
        }
        self.runs.insert(
            booking_id.clone(),
            Run {
                plan,
                attempts_made: 0,
            },
        );
        true
    }

    /// Record that an attempt is being made. Returns its 1-based number.
    pub fn attempt(&mut self, booking_id: &BookingId) -> Option<u32> {
        let run = self.runs.get_mut(booking_id)?;
        run.attempts_made += 1;
        Some(run.attempts_made)
    }

    /// Record the outcome of the latest attempt.
    pub fn record(&mut self, booking_id: &BookingId, code_present: bool) -> HydrationStep {
        let Some(run) = self.runs.get(booking_id) else {
            return HydrationStep::NotRunning;
        };
        if code_present {
            self.runs.remove(booking_id);
            return HydrationStep::Done;
        }
        if run.attempts_made >= run.plan.attempts {
            let attempts = run.attempts_made;
            self.runs.remove(booking_id);
            return HydrationStep::GaveUp { attempts };
        }
        HydrationStep::RetryAfter(run.plan.delay)
    }

    /// Stop a run early (ride ended). Returns whether one existed.
    pub fn cancel(&mut self, booking_id: &BookingId) -> bool {
        self.runs.remove(booking_id).is_some()
    }

    /// Check whether a run is in flight.
    pub fn is_running(&self, booking_id: &BookingId) -> bool {
        self.runs.contains_key(booking_id)
    }

    /// Drop every run.
    pub fn clear(&mut self) {
        self.runs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(attempts: u32) -> HydrationPlan {
        HydrationPlan {
            attempts,
            delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn second_begin_is_noop_while_running() {
        let mut tracker = HydrationTracker::new();
        let id = BookingId::new("BK1");

        assert!(tracker.begin(&id, plan(3)));
        assert!(!tracker.begin(&id, plan(5)));
        assert!(tracker.is_running(&id));
    }

    #[test]
    fn success_ends_the_run() {
        let mut tracker = HydrationTracker::new();
        let id = BookingId::new("BK1");
        tracker.begin(&id, plan(3));

        assert_eq!(tracker.attempt(&id), Some(1));
        assert_eq!(tracker.record(&id, true), HydrationStep::Done);
        assert!(!tracker.is_running(&id));
        assert!(tracker.begin(&id, plan(3)), "finished runs may be restarted");
    }

    #[test]
    fn gives_up_after_budget() {
        let mut tracker = HydrationTracker::new();
        let id = BookingId::new("BK1");
        tracker.begin(&id, plan(3));

        for _ in 0..2 {
            tracker.attempt(&id);
            assert_eq!(
                tracker.record(&id, false),
                HydrationStep::RetryAfter(Duration::from_millis(500))
            );
        }
        tracker.attempt(&id);
        assert_eq!(
            tracker.record(&id, false),
            HydrationStep::GaveUp { attempts: 3 }
        );
        assert!(!tracker.is_running(&id));
    }

    #[test]
    fn cancelled_run_reports_not_running() {
        let mut tracker = HydrationTracker::new();
        let id = BookingId::new("BK1");
        tracker.begin(&id, plan(3));

        assert!(tracker.cancel(&id));
        assert_eq!(tracker.attempt(&id), None);
        assert_eq!(tracker.record(&id, false), HydrationStep::NotRunning);
    }

    #[test]
    fn budgets_map_to_plans() {
        let policy = HydrationPolicy::default();
        assert_eq!(policy.plan(HydrationBudget::AfterPush).attempts, 3);
        assert_eq!(
            policy.plan(HydrationBudget::AfterPoll).delay,
            Duration::from_millis(800)
        );
    }

    #[test]
    fn zero_attempt_plan_never_starts() {
        let mut tracker = HydrationTracker::new();
        assert!(!tracker.begin(&BookingId::new("BK1"), plan(0)));
    }
}
