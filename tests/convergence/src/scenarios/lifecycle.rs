//! Ride lifecycle across both parties.

use std::time::Duration;

use ride_client::RideNotice;
use ride_core::RidePhase;
use ride_types::Coordinates;

use crate::assertions::{
    assert_code_present, assert_code_write_once, assert_converged, assert_phase,
    assert_phases_monotonic, require_all,
};
use crate::harness::{RidePair, PROVIDER, REQUESTER};

// ============================================================================
// Full ride
// ============================================================================

/// Request, match, code, start, live location and completion all reach
/// both sides, and both end on the server's state.
#[tokio::test(start_paused = true)]
async fn full_ride_converges_on_both_sides() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();

    let id = pair.book_and_match().await.unwrap();
    let server_code = pair.api.ride_record(&id).unwrap().otp;
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Tracking),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_code_present(&pair.requester.view(), server_code.as_deref()),
    ]);

    pair.start_trip(&id).await.unwrap();
    require_all(&[
        assert_phase(&pair.provider.view(), RidePhase::InProgress),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
    ]);

    let here = Coordinates::new(12.9760, 77.6055);
    assert!(pair
        .provider
        .engine
        .send_location(here, 90.0, 6.5)
        .await
        .unwrap());
    pair.pump(Duration::from_secs(3)).await;
    let seen = pair.requester.engine.counterpart_position().unwrap();
    assert!(seen.distance_km(&here) < 0.001, "requester sees {seen:?}");

    let summary = pair.provider.engine.complete_ride().await.unwrap();
    assert_eq!(summary.booking_id, id);
    pair.pump(Duration::from_millis(200)).await;

    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Completed),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_phases_monotonic(REQUESTER, &pair.requester.notices),
        assert_phases_monotonic(PROVIDER, &pair.provider.notices),
        assert_code_write_once(REQUESTER, &pair.requester.notices),
    ]);
    assert_eq!(
        pair.requester.engine.last_finished().map(|s| &s.booking_id),
        Some(&id)
    );
    assert_eq!(pair.requester.store.current(), None);
    assert_eq!(pair.provider.store.current(), None);
}

// ============================================================================
// Cancellation
// ============================================================================

/// A requester cancel ends the ride on the provider too.
#[tokio::test(start_paused = true)]
async fn requester_cancel_reaches_the_provider() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();

    pair.requester.engine.cancel_ride().await.unwrap();
    assert_eq!(pair.requester.phase(), RidePhase::Cancelled);
    pair.pump(Duration::from_millis(500)).await;

    require_all(&[
        assert_phase(&pair.provider.view(), RidePhase::Cancelled),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
    ]);
    assert_eq!(
        pair.requester
            .count(|n| matches!(n, RideNotice::CancelConfirmed { booking_id } if *booking_id == id)),
        1
    );
    assert_eq!(pair.provider.store.current(), None);
    assert_eq!(pair.requester.store.current(), None);
}

/// After a cancel the requester can book again straight away.
#[tokio::test(start_paused = true)]
async fn a_new_ride_follows_a_cancelled_one() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let first = pair.book_and_match().await.unwrap();
    pair.requester.engine.cancel_ride().await.unwrap();
    pair.pump(Duration::from_millis(500)).await;

    let second = pair.book_and_match().await.unwrap();
    assert_ne!(first, second);
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Tracking),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_code_write_once(REQUESTER, &pair.requester.notices),
    ]);
}

// ============================================================================
// Chat
// ============================================================================

/// Each side sees the other's messages and never its own.
#[tokio::test(start_paused = true)]
async fn chat_flows_both_ways_without_echo() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    pair.book_and_match().await.unwrap();

    pair.requester.engine.send_chat("Where are you?").await.unwrap();
    pair.provider.engine.send_chat("Two minutes away").await.unwrap();
    pair.pump(Duration::from_millis(200)).await;

    assert_eq!(pair.requester.chat_texts(), ["Two minutes away"]);
    assert_eq!(pair.provider.chat_texts(), ["Where are you?"]);
}
