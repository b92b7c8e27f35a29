//! Broker faults: lost, repeated and out-of-order messages.

use std::time::Duration;

use ride_client::RideNotice;
use ride_core::RidePhase;
use ride_types::{RideSnapshot, RideStatus};

use crate::assertions::{
    assert_code_present, assert_code_write_once, assert_converged, assert_notice_count,
    assert_phase, assert_phases_monotonic, require_all,
};
use crate::broker::{ride_updates_of, Fault};
use crate::harness::{RidePair, REQUESTER};

// ============================================================================
// Lost pushes
// ============================================================================

/// The match push never arrives; the booking poll finds the match and the
/// code anyway.
#[tokio::test(start_paused = true)]
async fn dropped_match_push_is_recovered_by_polling() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    pair.broker.inject(&ride_updates_of(REQUESTER), Fault::Drop, 1);

    let id = pair.book_and_match().await.unwrap();
    assert_eq!(pair.broker.stats().dropped, 1);
    pair.pump(Duration::from_secs(3)).await;

    let server_code = pair.api.ride_record(&id).unwrap().otp;
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Tracking),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_code_present(&pair.requester.view(), server_code.as_deref()),
    ]);
}

// ============================================================================
// Repeated and reordered pushes
// ============================================================================

/// "Started" overtakes "matched", and "completed" arrives twice. The
/// requester only ever moves forward and finishes once.
#[tokio::test(start_paused = true)]
async fn duplicated_and_reordered_pushes_never_regress() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    pair.broker.inject(&ride_updates_of(REQUESTER), Fault::Hold, 2);

    let id = pair.book_and_match().await.unwrap();
    pair.start_trip(&id).await.unwrap();
    assert_eq!(pair.broker.held(), 2);
    assert_eq!(pair.requester.phase(), RidePhase::Booking);

    assert_eq!(pair.release_held().await, 2);
    assert_eq!(pair.requester.phase(), RidePhase::InProgress);

    pair.broker
        .inject(&ride_updates_of(REQUESTER), Fault::Duplicate, 1);
    pair.provider.engine.complete_ride().await.unwrap();
    pair.pump(Duration::from_millis(200)).await;
    assert_eq!(pair.broker.stats().duplicated, 1);

    let notices = &pair.requester.notices;
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Completed),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_phases_monotonic(REQUESTER, notices),
        assert_notice_count(REQUESTER, notices, "ride finished", 1, |n| {
            matches!(n, RideNotice::Finished(_))
        }),
    ]);
}

/// Duplicate match pushes start code hydration once, and hydration gives
/// up after its bounded attempts while the server keeps withholding.
#[tokio::test(start_paused = true)]
async fn hydration_runs_once_under_duplicate_pushes() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    pair.broker
        .inject(&ride_updates_of(REQUESTER), Fault::Duplicate, 1);

    let id = pair.book().await.unwrap();
    pair.api.withhold_code(&id, 100);
    pair.pump(Duration::from_millis(100)).await;
    pair.provider.engine.accept(&id).await.unwrap();
    pair.pump(Duration::from_millis(1500)).await;

    assert_eq!(pair.broker.stats().duplicated, 1);
    assert_eq!(pair.api.fetch_count(&id), 3);
    assert_eq!(pair.requester.phase(), RidePhase::Tracking);
    assert_eq!(pair.requester.code(), None);

    let notices = &pair.requester.notices;
    require_all(&[
        assert_notice_count(REQUESTER, notices, "code pending", 1, |n| {
            matches!(n, RideNotice::CodePending { .. })
        }),
        assert_notice_count(REQUESTER, notices, "tracking", 1, |n| {
            matches!(
                n,
                RideNotice::PhaseChanged {
                    to: RidePhase::Tracking,
                    ..
                }
            )
        }),
    ]);
}

// ============================================================================
// Partial payloads
// ============================================================================

/// Snapshots without the code (pushes and polls alike) never erase a code
/// the requester already holds.
#[tokio::test(start_paused = true)]
async fn code_survives_partial_payloads() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();
    let server_code = pair.api.ride_record(&id).unwrap().otp;
    assert_eq!(pair.requester.code(), server_code);

    for _ in 0..3 {
        pair.api.script_fetch(
            &id,
            RideSnapshot {
                booking_id: Some(id.clone()),
                status: Some(RideStatus::Accepted),
                ..Default::default()
            },
        );
    }
    let fetches = pair.api.fetch_count(&id);
    pair.start_trip(&id).await.unwrap();
    pair.pump(Duration::from_secs(15)).await;

    assert!(pair.api.fetch_count(&id) > fetches, "no poll ran");
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::InProgress),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_code_present(&pair.requester.view(), server_code.as_deref()),
        assert_code_write_once(REQUESTER, &pair.requester.notices),
        assert_phases_monotonic(REQUESTER, &pair.requester.notices),
    ]);
}
