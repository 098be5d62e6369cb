#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end command flow over a mock Snapcast server: mediator dispatch,
//! state mutation, side effects on the wire, and notification fan-out.

mod support;

use std::time::Duration;

use snapdog::bus::commands::{
    ClientOp, Command, CommandEnvelope, CommandReply, CommandSource, ZoneOp,
};
use snapdog::bus::events::Notification;
use snapdog::error::ErrorKind;

use support::{build_stack, fixture_config, single_zone_model, wait_connected, MockSnapcast};

/// Mark the configured client as present so handlers push side effects.
async fn adopt_client(stack: &support::Stack) {
    stack
        .store
        .mutate_client(1, |c| {
            c.connected = true;
            c.snapcast_id = Some("snap-c1".into());
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn zone_volume_mutates_state_and_pushes_to_members() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;
    adopt_client(&stack).await;

    let mut rx = stack.notify.subscribe();

    let reply = stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Mqtt,
            Command::Zone {
                zone: 1,
                op: ZoneOp::SetVolume { volume: 60 },
            },
        ))
        .await
        .unwrap();

    match reply {
        CommandReply::Zone(zone) => assert_eq!(zone.volume, 60),
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(stack.store.zone(1).await.unwrap().volume, 60);

    // Side effect reached the (mock) Snapcast server
    tokio::time::sleep(Duration::from_millis(50)).await;
    {
        let model = mock.model.lock().await;
        assert_eq!(model.groups[0].clients[0].volume, 60);
        assert!(model.calls_of("Client.SetVolume") >= 1);
    }

    // Notification carries the originating source for echo suppression
    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.origin, CommandSource::Mqtt);
    assert!(matches!(
        envelope.notification,
        Notification::ZoneVolumeChanged { zone: 1, volume: 60 }
    ));
}

#[tokio::test]
async fn invalid_volume_is_rejected_without_mutation_or_notification() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;

    let mut rx = stack.notify.subscribe();

    let err = stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Api,
            Command::Zone {
                zone: 1,
                op: ZoneOp::SetVolume { volume: 101 },
            },
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert_eq!(err.message, "Volume must be between 0 and 100");
    assert_eq!(stack.store.zone(1).await.unwrap().volume, 50);

    let seen = support::drain_notifications(&mut rx, Duration::from_millis(100)).await;
    assert!(seen.is_empty(), "no notification expected, saw {:?}", seen);
}

#[tokio::test]
async fn snapcast_originated_volume_is_clamped_not_rejected() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;

    let reply = stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Internal,
            Command::Client {
                client: 1,
                op: ClientOp::SetVolume { volume: 150 },
            },
        ))
        .await
        .unwrap();
    match reply {
        CommandReply::Client(client) => assert_eq!(client.volume, 100),
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn commands_fail_unavailable_while_disconnected() {
    // Point at a port nothing listens on
    let stack = build_stack(fixture_config(1, 1, 1)).await;
    adopt_client(&stack).await;

    let err = stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Api,
            Command::Zone {
                zone: 1,
                op: ZoneOp::SetVolume { volume: 60 },
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    // State untouched
    assert_eq!(stack.store.zone(1).await.unwrap().volume, 50);
}

#[tokio::test]
async fn client_mute_preserves_and_restores_volume() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;
    adopt_client(&stack).await;

    stack
        .store
        .mutate_client(1, |c| c.volume = 70)
        .await
        .unwrap();

    let send = |op: ClientOp| {
        let mediator = stack.mediator.clone();
        async move {
            mediator
                .send(CommandEnvelope::new(
                    CommandSource::Api,
                    Command::Client { client: 1, op },
                ))
                .await
        }
    };

    send(ClientOp::SetMute { mute: true }).await.unwrap();
    let muted = stack.store.client(1).await.unwrap();
    assert!(muted.mute);
    assert_eq!(muted.volume, 70);
    assert_eq!(muted.volume_before_mute, Some(70));

    // Lower the stored level while muted, then unmute: pre-mute level wins
    send(ClientOp::SetVolume { volume: 10 }).await.unwrap();
    send(ClientOp::SetMute { mute: false }).await.unwrap();
    let restored = stack.store.client(1).await.unwrap();
    assert!(!restored.mute);
    assert_eq!(restored.volume, 70);
    assert_eq!(restored.volume_before_mute, None);
}

#[tokio::test]
async fn playback_command_reaches_stream_and_state() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;

    stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Knx,
            Command::Zone {
                zone: 1,
                op: ZoneOp::Play,
            },
        ))
        .await
        .unwrap();

    assert_eq!(
        stack.store.zone(1).await.unwrap().playback,
        snapdog::state::zone::PlaybackState::Playing
    );
    let model = mock.model.lock().await;
    assert_eq!(model.calls_of("Stream.Control"), 1);
}

#[tokio::test]
async fn position_sync_updates_without_track_change_notification() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;

    stack
        .store
        .mutate_zone(1, |z| {
            z.playback = snapdog::state::zone::PlaybackState::Playing;
            z.track = Some(snapdog::state::zone::TrackInfo {
                index: 1,
                id: "t-1".into(),
                title: "Song".into(),
                artist: "Artist".into(),
                album: "Album".into(),
                duration_ms: Some(200_000),
                position_ms: 0,
                cover_id: None,
            });
        })
        .await
        .unwrap();

    let mut rx = stack.notify.subscribe();
    stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Internal,
            Command::Zone {
                zone: 1,
                op: ZoneOp::SyncPosition {
                    position_ms: 12_500,
                    playing: Some(true),
                },
            },
        ))
        .await
        .unwrap();

    assert_eq!(
        stack
            .store
            .zone(1)
            .await
            .unwrap()
            .track
            .unwrap()
            .position_ms,
        12_500
    );
    let seen = support::drain_notifications(&mut rx, Duration::from_millis(100)).await;
    assert!(seen.contains_key("zone_position_changed"));
    assert!(!seen.contains_key("zone_track_changed"));
}

#[tokio::test]
async fn unknown_zone_is_not_found() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let stack = build_stack(fixture_config(mock.addr.port(), 1, 1)).await;
    wait_connected(&stack.snapcast).await;

    let err = stack
        .mediator
        .send(CommandEnvelope::new(
            CommandSource::Api,
            Command::Zone {
                zone: 9,
                op: ZoneOp::SetMute { mute: true },
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
