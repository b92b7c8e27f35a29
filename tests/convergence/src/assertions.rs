//! Assertion helpers for convergence scenarios.
//!
//! These are pure functions over what the parties observed. They return an
//! [`AssertionResult`] instead of panicking so a scenario can report every
//! broken property at once with [`require_all`].

use std::collections::HashMap;

use ride_client::RideNotice;
use ride_core::RidePhase;
use ride_types::BookingId;

/// One party's state at the end of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct PartyView {
    /// Participant label for messages.
    pub label: String,
    /// Current phase.
    pub phase: RidePhase,
    /// Active booking, if any.
    pub booking_id: Option<BookingId>,
    /// Known verification code, if any.
    pub code: Option<String>,
}

/// Result of an assertion check.
#[derive(Debug, Clone)]
pub struct AssertionResult {
    /// Whether the assertion passed
    pub passed: bool,
    /// Description of what was checked
    pub description: String,
    /// Details on failure
    pub failure_details: Option<String>,
}

impl AssertionResult {
    /// Create a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.into(),
            failure_details: None,
        }
    }

    /// Create a failing result.
    pub fn fail(description: &str, details: &str) -> Self {
        Self {
            passed: false,
            description: description.into(),
            failure_details: Some(details.into()),
        }
    }
}

/// Panic with every failed result, if any.
pub fn require_all(results: &[AssertionResult]) {
    let failures: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| {
            format!(
                "{}: {}",
                r.description,
                r.failure_details.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}

/// Both parties see the same phase of the same ride.
pub fn assert_converged(a: &PartyView, b: &PartyView) -> AssertionResult {
    let description = format!("{} and {} converged", a.label, b.label);
    if a.phase != b.phase {
        return AssertionResult::fail(
            &description,
            &format!("{} is {}, {} is {}", a.label, a.phase, b.label, b.phase),
        );
    }
    if a.booking_id != b.booking_id {
        return AssertionResult::fail(
            &description,
            &format!(
                "{} tracks {:?}, {} tracks {:?}",
                a.label, a.booking_id, b.label, b.booking_id
            ),
        );
    }
    AssertionResult::pass(&description)
}

/// A party is in `expected`.
pub fn assert_phase(view: &PartyView, expected: RidePhase) -> AssertionResult {
    let description = format!("{} in {}", view.label, expected);
    if view.phase == expected {
        AssertionResult::pass(&description)
    } else {
        AssertionResult::fail(&description, &format!("phase is {}", view.phase))
    }
}

/// No phase change within one ride moved backwards.
///
/// A change back to SEARCH ends the ride and starts the next one.
pub fn assert_phases_monotonic(label: &str, notices: &[RideNotice]) -> AssertionResult {
    let description = format!("{label} phases never regress");
    for notice in notices {
        if let RideNotice::PhaseChanged { from, to } = notice {
            if *to != RidePhase::Search && to.rank() < from.rank() {
                return AssertionResult::fail(&description, &format!("{from} -> {to}"));
            }
        }
    }
    AssertionResult::pass(&description)
}

/// Each booking announced at most one code, and never changed it.
pub fn assert_code_write_once(label: &str, notices: &[RideNotice]) -> AssertionResult {
    let description = format!("{label} code written once per ride");
    let mut seen: HashMap<&BookingId, &str> = HashMap::new();
    for notice in notices {
        if let RideNotice::CodeAvailable { booking_id, code } = notice {
            if let Some(previous) = seen.insert(booking_id, code) {
                return AssertionResult::fail(
                    &description,
                    &format!("{booking_id}: {previous} announced again as {code}"),
                );
            }
        }
    }
    AssertionResult::pass(&description)
}

/// The party knows `expected` as its verification code.
pub fn assert_code_present(view: &PartyView, expected: Option<&str>) -> AssertionResult {
    let description = format!("{} holds the verification code", view.label);
    match (view.code.as_deref(), expected) {
        (Some(code), Some(want)) if code == want => AssertionResult::pass(&description),
        (Some(code), Some(want)) => {
            AssertionResult::fail(&description, &format!("holds {code}, server has {want}"))
        }
        (None, _) => AssertionResult::fail(&description, "no code"),
        (Some(_), None) => AssertionResult::fail(&description, "server has no code"),
    }
}

/// `received` is exactly `expected`: nothing lost, repeated or reordered.
pub fn assert_delivered_once_in_order(received: &[String], expected: &[&str]) -> AssertionResult {
    let description = "messages delivered once, in order";
    if received.len() == expected.len() && received.iter().zip(expected).all(|(r, e)| r == e) {
        AssertionResult::pass(description)
    } else {
        AssertionResult::fail(
            description,
            &format!("expected {expected:?}, got {received:?}"),
        )
    }
}

/// Exactly `expected` notices matched.
pub fn assert_notice_count(
    label: &str,
    notices: &[RideNotice],
    what: &str,
    expected: usize,
    predicate: impl Fn(&RideNotice) -> bool,
) -> AssertionResult {
    let description = format!("{label} saw {what} {expected} time(s)");
    let actual = notices.iter().filter(|n| predicate(n)).count();
    if actual == expected {
        AssertionResult::pass(&description)
    } else {
        AssertionResult::fail(&description, &format!("saw it {actual} time(s)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(label: &str, phase: RidePhase, booking: Option<&str>) -> PartyView {
        PartyView {
            label: label.into(),
            phase,
            booking_id: booking.map(BookingId::new),
            code: None,
        }
    }

    #[test]
    fn converged_needs_same_phase_and_booking() {
        let a = view("c1", RidePhase::Tracking, Some("BK1"));
        assert!(assert_converged(&a, &view("d1", RidePhase::Tracking, Some("BK1"))).passed);

        let lagging = assert_converged(&a, &view("d1", RidePhase::Booking, Some("BK1")));
        assert!(!lagging.passed);
        assert!(lagging.failure_details.unwrap().contains("BOOKING"));

        assert!(!assert_converged(&a, &view("d1", RidePhase::Tracking, Some("BK2"))).passed);
    }

    #[test]
    fn regression_is_caught_but_a_new_ride_is_not() {
        let ok = [
            RideNotice::PhaseChanged {
                from: RidePhase::Booking,
                to: RidePhase::Tracking,
            },
            RideNotice::PhaseChanged {
                from: RidePhase::Completed,
                to: RidePhase::Search,
            },
        ];
        assert!(assert_phases_monotonic("c1", &ok).passed);

        let bad = [RideNotice::PhaseChanged {
            from: RidePhase::InProgress,
            to: RidePhase::Tracking,
        }];
        assert!(!assert_phases_monotonic("c1", &bad).passed);
    }

    #[test]
    fn code_announced_twice_fails() {
        let id = BookingId::new("BK1");
        let notices = [
            RideNotice::CodeAvailable {
                booking_id: id.clone(),
                code: "1234".into(),
            },
            RideNotice::CodeAvailable {
                booking_id: id,
                code: "1234".into(),
            },
        ];
        assert!(assert_code_write_once("c1", &notices[..1]).passed);
        assert!(!assert_code_write_once("c1", &notices).passed);
    }

    #[test]
    fn delivery_order_matters() {
        let got = vec!["a".to_string(), "b".to_string()];
        assert!(assert_delivered_once_in_order(&got, &["a", "b"]).passed);
        assert!(!assert_delivered_once_in_order(&got, &["b", "a"]).passed);
        assert!(!assert_delivered_once_in_order(&got, &["a", "b", "b"]).passed);
    }

    #[test]
    #[should_panic(expected = "c1 in TRACKING")]
    fn require_all_reports_failures() {
        let view = view("c1", RidePhase::Booking, Some("BK1"));
        require_all(&[assert_phase(&view, RidePhase::Tracking)]);
    }
}
