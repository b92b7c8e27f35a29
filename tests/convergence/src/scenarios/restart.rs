//! Process restarts against the persisted ride.

use std::time::Duration;

use ride_client::RideNotice;
use ride_core::RidePhase;

use crate::assertions::{assert_converged, assert_notice_count, assert_phase, require_all};
use crate::broker::ride_updates_of;
use crate::harness::{RidePair, Side, PROVIDER, REQUESTER};

// ============================================================================
// Live rides
// ============================================================================

/// A requester restarted mid-trip comes straight back in IN_PROGRESS and
/// follows the ride to its end.
#[tokio::test(start_paused = true)]
async fn restart_mid_trip_resumes_in_progress() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();
    pair.start_trip(&id).await.unwrap();

    let resumed = pair.restart(Side::Requester).await.unwrap();
    assert_eq!(resumed, Some(id.clone()));
    assert_eq!(pair.requester.store.current(), Some(id.clone()));

    let notices = &pair.requester.notices;
    assert!(notices.contains(&RideNotice::Resumed {
        booking_id: id.clone(),
        phase: RidePhase::InProgress,
    }));
    let changes: Vec<_> = notices
        .iter()
        .filter_map(|n| match n {
            RideNotice::PhaseChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(changes, [(RidePhase::Search, RidePhase::InProgress)]);

    pair.pump(Duration::from_millis(100)).await;
    require_all(&[assert_converged(
        &pair.requester.view(),
        &pair.provider.view(),
    )]);

    pair.provider.engine.complete_ride().await.unwrap();
    pair.pump(Duration::from_millis(200)).await;
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Completed),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
    ]);
}

/// A provider restarted while tracking resumes without re-accepting and
/// can still verify the code.
#[tokio::test(start_paused = true)]
async fn restarted_provider_can_still_start_the_trip() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();

    assert_eq!(pair.restart(Side::Provider).await.unwrap(), Some(id.clone()));
    assert_eq!(pair.provider.phase(), RidePhase::Tracking);

    pair.start_trip(&id).await.unwrap();
    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::InProgress),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
    ]);
    assert_eq!(
        pair.api
            .calls()
            .iter()
            .filter(|call| call.starts_with("accept"))
            .count(),
        1
    );
}

// ============================================================================
// Finished rides
// ============================================================================

/// The ride completed while the requester was away. The restart clears the
/// record instead of resuming.
#[tokio::test(start_paused = true)]
async fn restart_never_resumes_a_completed_ride() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();
    pair.start_trip(&id).await.unwrap();

    pair.requester.go_offline();
    pair.provider.engine.complete_ride().await.unwrap();
    pair.pump(Duration::from_secs(1)).await;
    assert_eq!(pair.requester.phase(), RidePhase::InProgress);
    assert_eq!(pair.requester.store.current(), Some(id));

    assert_eq!(pair.restart(Side::Requester).await.unwrap(), None);
    assert_eq!(pair.requester.phase(), RidePhase::Search);
    assert_eq!(pair.requester.store.current(), None);
    let notices = &pair.requester.notices;
    require_all(&[
        assert_notice_count(REQUESTER, notices, "resume", 0, |n| {
            matches!(n, RideNotice::Resumed { .. })
        }),
        assert_notice_count(REQUESTER, notices, "phase change", 0, |n| {
            matches!(n, RideNotice::PhaseChanged { .. })
        }),
    ]);
}

/// Same for a provider that missed the requester's cancel.
#[tokio::test(start_paused = true)]
async fn restart_never_resumes_a_cancelled_ride() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();

    pair.provider.go_offline();
    pair.requester.engine.cancel_ride().await.unwrap();
    pair.pump(Duration::from_secs(1)).await;
    assert_eq!(pair.provider.phase(), RidePhase::Tracking);
    assert_eq!(pair.provider.store.current(), Some(id));

    assert_eq!(pair.restart(Side::Provider).await.unwrap(), None);
    assert_eq!(pair.provider.phase(), RidePhase::Search);
    assert_eq!(pair.provider.store.current(), None);
    require_all(&[assert_notice_count(
        PROVIDER,
        &pair.provider.notices,
        "resume",
        0,
        |n| matches!(n, RideNotice::Resumed { .. }),
    )]);
}

// ============================================================================
// Resubscription
// ============================================================================

/// Resuming twice leaves one subscription per topic, so every push is
/// handled once.
#[tokio::test(start_paused = true)]
async fn resuming_twice_delivers_each_push_once() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    assert_eq!(pair.requester.engine.resume().await.unwrap(), None);

    let updates = ride_updates_of(REQUESTER);
    let live = pair.requester.transport.active_subscriptions();
    assert_eq!(live.iter().filter(|d| **d == updates).count(), 1);

    pair.book_and_match().await.unwrap();
    let notices = &pair.requester.notices;
    require_all(&[
        assert_notice_count(REQUESTER, notices, "tracking", 1, |n| {
            matches!(
                n,
                RideNotice::PhaseChanged {
                    to: RidePhase::Tracking,
                    ..
                }
            )
        }),
        assert_notice_count(REQUESTER, notices, "code pending", 1, |n| {
            matches!(n, RideNotice::CodePending { .. })
        }),
    ]);
    assert_eq!(pair.broker.stats().delivered, 2);
}
