//! Broker outages: offline queueing, reconnects and the poller fallback.

use std::time::Duration;

use ride_client::RideNotice;
use ride_core::RidePhase;
use ride_types::Coordinates;

use crate::assertions::{
    assert_converged, assert_delivered_once_in_order, assert_notice_count, assert_phase,
    require_all,
};
use crate::harness::{RidePair, REQUESTER};

const PICKUP: Coordinates = Coordinates {
    lat: 12.9756,
    lng: 77.6050,
};

// ============================================================================
// Offline queueing
// ============================================================================

/// Chat sent while the provider's link is down arrives once and in order
/// after it comes back.
#[tokio::test(start_paused = true)]
async fn offline_messages_are_delivered_once_in_order() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    pair.book_and_match().await.unwrap();

    pair.provider.go_offline();
    pair.pump(Duration::from_millis(100)).await;
    for text in ["one", "two", "three"] {
        pair.provider.engine.send_chat(text).await.unwrap();
    }
    assert!(pair.provider.engine.pending_operations() >= 3);

    pair.pump(Duration::from_secs(1)).await;
    assert!(pair.requester.chat_texts().is_empty());

    pair.provider.go_online();
    pair.pump(Duration::from_secs(10)).await;

    require_all(&[assert_delivered_once_in_order(
        &pair.requester.chat_texts(),
        &["one", "two", "three"],
    )]);
    assert!(pair.provider.chat_texts().is_empty());
    assert_eq!(pair.provider.engine.pending_operations(), 0);
    assert!(pair
        .provider
        .notices
        .iter()
        .any(|n| matches!(n, RideNotice::Connected)));
}

// ============================================================================
// Poller fallback
// ============================================================================

/// While the requester's link is down the poller keeps the provider's
/// position moving; after reconnect pushes take over again.
#[tokio::test(start_paused = true)]
async fn poller_keeps_position_fresh_while_link_is_down() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();
    pair.start_trip(&id).await.unwrap();

    pair.requester.go_offline();
    let fetches = pair.api.fetch_count(&id);
    for step in 1..=10 {
        let position = Coordinates::new(PICKUP.lat + 0.001 * f64::from(step), PICKUP.lng);
        assert!(pair
            .provider
            .engine
            .send_location(position, 0.0, 8.0)
            .await
            .unwrap());
        pair.pump(Duration::from_secs(2)).await;
    }

    assert!(pair.api.fetch_count(&id) > fetches, "no poll while offline");
    let seen = pair.requester.engine.counterpart_position().unwrap();
    assert!(seen.lat > PICKUP.lat + 0.0025, "requester stuck at {seen:?}");
    assert_eq!(pair.requester.phase(), RidePhase::InProgress);

    pair.requester.go_online();
    pair.pump(Duration::from_secs(35)).await;
    assert!(pair
        .requester
        .notices
        .iter()
        .any(|n| matches!(n, RideNotice::Connected)));

    let last = Coordinates::new(12.9900, 77.6100);
    assert!(pair
        .provider
        .engine
        .send_location(last, 45.0, 8.0)
        .await
        .unwrap());
    pair.pump(Duration::from_secs(3)).await;
    let seen = pair.requester.engine.counterpart_position().unwrap();
    assert!(seen.distance_km(&last) < 0.001, "requester sees {seen:?}");
    require_all(&[assert_converged(
        &pair.requester.view(),
        &pair.provider.view(),
    )]);
}

/// Reconnects keep failing: the engine reports real-time updates as
/// unavailable once and polls on every tick from then on.
#[tokio::test(start_paused = true)]
async fn long_outage_switches_to_steady_polling() {
    let mut pair = RidePair::new();
    pair.start().await.unwrap();
    let id = pair.book_and_match().await.unwrap();

    pair.requester.go_offline();
    pair.pump(Duration::from_secs(65)).await;
    assert!(pair.requester.engine.is_realtime_unavailable());

    let before = pair.api.fetch_count(&id);
    pair.pump(Duration::from_secs(15)).await;
    assert!(
        pair.api.fetch_count(&id) >= before + 3,
        "expected steady polling, got {} fetches",
        pair.api.fetch_count(&id) - before
    );

    require_all(&[
        assert_phase(&pair.requester.view(), RidePhase::Tracking),
        assert_converged(&pair.requester.view(), &pair.provider.view()),
        assert_notice_count(
            REQUESTER,
            &pair.requester.notices,
            "realtime unavailable",
            1,
            |n| matches!(n, RideNotice::RealtimeUnavailable { .. }),
        ),
    ]);
}
