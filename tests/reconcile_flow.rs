#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Reconciliation against a mock Snapcast server: convergence of group
//! membership, idempotence, and coalescing of concurrent triggers.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use snapdog::bus::commands::{ClientOp, Command, CommandEnvelope, CommandSource};
use snapdog::grouping::ReconcileHealth;

use support::{build_stack, fixture_config, wait_connected, MockClient, MockGroup, MockModel,
    MockSnapcast};

/// Two zones, two clients; both clients start in zone 1's group.
fn two_zone_model() -> MockModel {
    MockModel {
        groups: vec![
            MockGroup {
                id: "g1".into(),
                stream_id: "/snapsinks/zone1".into(),
                clients: vec![
                    MockClient {
                        id: "snap-c1".into(),
                        mac: "aa:bb:cc:dd:ee:01".into(),
                        name: "Client 1".into(),
                        connected: true,
                        volume: 50,
                        muted: false,
                        latency: 0,
                    },
                    MockClient {
                        id: "snap-c2".into(),
                        mac: "aa:bb:cc:dd:ee:02".into(),
                        name: "Client 2".into(),
                        connected: true,
                        volume: 50,
                        muted: false,
                        latency: 0,
                    },
                ],
            },
            MockGroup {
                id: "g2".into(),
                stream_id: "/snapsinks/zone2".into(),
                clients: vec![MockClient {
                    id: "snap-idle".into(),
                    mac: "00:00:00:00:00:99".into(),
                    name: "Idle".into(),
                    connected: true,
                    volume: 50,
                    muted: false,
                    latency: 0,
                }],
            },
        ],
        calls: Vec::new(),
        status_delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn reconcile_adopts_reported_clients() {
    let mock = MockSnapcast::start(two_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 2, 2)).await;
    wait_connected(&stack.snapcast).await;

    let outcome = stack.grouping.reconcile().await;
    assert_ne!(outcome.health, ReconcileHealth::Degraded);

    let c1 = stack.store.client(1).await.unwrap();
    assert!(c1.connected);
    assert_eq!(c1.snapcast_id.as_deref(), Some("snap-c1"));
    let c2 = stack.store.client(2).await.unwrap();
    assert_eq!(c2.snapcast_id.as_deref(), Some("snap-c2"));
}

#[tokio::test]
async fn zone_reassignment_converges_on_snapcast() {
    let mock = MockSnapcast::start(two_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 2, 2)).await;
    wait_connected(&stack.snapcast).await;

    // Adopt ids + membership first
    stack.grouping.reconcile().await;

    // Move client 2 to zone 2; the handler triggers reconciliation
    stack
        .mediator
        .send(
            CommandEnvelope::new(
                CommandSource::Api,
                Command::Client {
                    client: 2,
                    op: ClientOp::AssignZone { zone: 2 },
                },
            )
            .with_deadline(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    assert_eq!(stack.store.client(2).await.unwrap().current_zone, Some(2));
    assert!(stack.store.zone(2).await.unwrap().clients.contains(&2));
    assert!(!stack.store.zone(1).await.unwrap().clients.contains(&2));

    // Snapcast's group for zone 2 now holds the client
    let model = mock.model.lock().await;
    let zone2_group = model
        .groups
        .iter()
        .find(|g| g.stream_id == "/snapsinks/zone2")
        .expect("zone 2 group");
    assert!(zone2_group.clients.iter().any(|c| c.id == "snap-c2"));
}

#[tokio::test]
async fn reassigning_same_zone_emits_nothing_and_skips_reconcile() {
    let mock = MockSnapcast::start(two_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 2, 2)).await;
    wait_connected(&stack.snapcast).await;
    stack.grouping.reconcile().await;

    let passes_before = stack.stats.counters.reconcile_passes.load(Ordering::Relaxed);
    let mut rx = stack.notify.subscribe();

    // Client 1 already lives in zone 1 (its default)
    stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Api,
            Command::Client {
                client: 1,
                op: ClientOp::AssignZone { zone: 1 },
            },
        ))
        .await
        .unwrap();

    let seen = support::drain_notifications(&mut rx, Duration::from_millis(100)).await;
    assert!(
        !seen.contains_key("client_zone_assignment_changed"),
        "no assignment notification expected, saw {:?}",
        seen
    );
    assert_eq!(
        stack.stats.counters.reconcile_passes.load(Ordering::Relaxed),
        passes_before
    );
}

#[tokio::test]
async fn steady_state_pass_is_healthy() {
    let mock = MockSnapcast::start(two_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 2, 2)).await;
    wait_connected(&stack.snapcast).await;

    // First pass may rename/move; the second should find nothing to do
    stack.grouping.reconcile().await;
    let second = stack.grouping.reconcile().await;
    assert_eq!(second.health, ReconcileHealth::Healthy);
    assert_eq!(second.mutations, 0);
}

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_pass() {
    let mut model = two_zone_model();
    model.status_delay = Duration::from_millis(200);
    let mock = MockSnapcast::start(model).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 2, 2)).await;
    wait_connected(&stack.snapcast).await;

    let a = {
        let grouping = stack.grouping.clone();
        tokio::spawn(async move { grouping.reconcile().await })
    };
    // Let the first pass take the run lock before triggering again
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = {
        let grouping = stack.grouping.clone();
        tokio::spawn(async move { grouping.reconcile().await })
    };
    let outcome_a = a.await.unwrap();
    let outcome_b = b.await.unwrap();

    // Both observers see the same pass's outcome; it executed exactly once
    assert_eq!(outcome_a.health, outcome_b.health);
    assert_eq!(
        stack.stats.counters.reconcile_passes.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn reconcile_without_snapcast_is_degraded() {
    let stack = build_stack(fixture_config(1, 1, 1)).await;
    let outcome = stack.grouping.reconcile().await;
    assert_eq!(outcome.health, ReconcileHealth::Degraded);
}
