//! KNX status publisher
//!
//! Writes typed group values to the configured status group addresses.
//! Integer statuses use DPT 5.010 (out-of-range values are sent as 0 with a
//! warning), playback state is 0=Stopped / 1=Playing / 2=Paused, booleans
//! are 1-bit. Notifications originating from KNX are suppressed; KNX has no
//! error channel, so failures are only counted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::knx::addr::GroupAddress;
use crate::adapters::knx::dpt::GroupValue;
use crate::adapters::knx::KnxAdapter;
use crate::bus::commands::CommandSource;
use crate::bus::events::{Notification, NotificationEnvelope};
use crate::bus::NotificationTx;
use crate::config::{AppConfig, ClientKnxConfig, ZoneKnxConfig};
use crate::error::Result;
use crate::stats::{bump, Stats};

pub struct KnxPublisher {
    adapter: Arc<KnxAdapter>,
    zone_maps: Vec<Option<ZoneKnxConfig>>,
    client_maps: Vec<Option<ClientKnxConfig>>,
    stats: Arc<Stats>,
}

impl KnxPublisher {
    pub fn new(adapter: Arc<KnxAdapter>, config: &AppConfig, stats: Arc<Stats>) -> Self {
        Self {
            adapter,
            zone_maps: config.zones.iter().map(|z| z.knx.clone()).collect(),
            client_maps: config.clients.iter().map(|c| c.knx.clone()).collect(),
            stats,
        }
    }

    fn zone_map(&self, index: usize) -> Option<&ZoneKnxConfig> {
        self.zone_maps.get(index - 1)?.as_ref()
    }

    fn client_map(&self, index: usize) -> Option<&ClientKnxConfig> {
        self.client_maps.get(index - 1)?.as_ref()
    }

    /// Status writes for one notification.
    fn render(&self, notification: &Notification) -> Vec<(GroupAddress, GroupValue)> {
        let mut out = Vec::new();

        match notification {
            Notification::ZonePlaybackStateChanged { zone, state } => {
                if let Some(ga) = self.zone_map(*zone).and_then(|m| m.playback_status) {
                    out.push((ga, GroupValue::playback(*state)));
                }
            }
            Notification::ZoneVolumeChanged { zone, volume } => {
                if let Some(ga) = self.zone_map(*zone).and_then(|m| m.volume_status) {
                    out.push((ga, GroupValue::dpt5(*volume as i64)));
                }
            }
            Notification::ZoneMuteChanged { zone, mute } => {
                if let Some(ga) = self.zone_map(*zone).and_then(|m| m.mute_status) {
                    out.push((ga, GroupValue::Bool(*mute)));
                }
            }
            Notification::ZoneTrackChanged { zone, track } => {
                if let Some(ga) = self.zone_map(*zone).and_then(|m| m.track_status) {
                    // Index form only; KNX strings are length-limited and
                    // unreliable for UTF-8 metadata
                    let index = track.as_ref().map(|t| t.index as i64).unwrap_or(0);
                    out.push((ga, GroupValue::dpt5(index)));
                }
            }
            Notification::ZonePlaylistChanged { zone, playlist } => {
                if let Some(ga) = self.zone_map(*zone).and_then(|m| m.playlist_status) {
                    let index = playlist.as_ref().map(|p| p.index as i64).unwrap_or(0);
                    out.push((ga, GroupValue::dpt5(index)));
                }
            }
            Notification::ClientConnectedChanged { client, connected } => {
                if let Some(ga) = self.client_map(*client).and_then(|m| m.connected_status) {
                    out.push((ga, GroupValue::Bool(*connected)));
                }
            }
            Notification::ClientVolumeChanged { client, volume } => {
                if let Some(ga) = self.client_map(*client).and_then(|m| m.volume_status) {
                    out.push((ga, GroupValue::dpt5(*volume as i64)));
                }
            }
            Notification::ClientMuteChanged { client, mute } => {
                if let Some(ga) = self.client_map(*client).and_then(|m| m.mute_status) {
                    out.push((ga, GroupValue::Bool(*mute)));
                }
            }
            Notification::ClientZoneAssignmentChanged { client, next, .. } => {
                if let Some(ga) = self.client_map(*client).and_then(|m| m.zone_status) {
                    out.push((ga, GroupValue::dpt5(*next as i64)));
                }
            }
            // Composites render every mapped status field, used for the
            // startup full publish
            Notification::ZoneStateChanged { new, .. } => {
                if let Some(map) = self.zone_map(new.index) {
                    if let Some(ga) = map.playback_status {
                        out.push((ga, GroupValue::playback(new.playback)));
                    }
                    if let Some(ga) = map.volume_status {
                        out.push((ga, GroupValue::dpt5(new.volume as i64)));
                    }
                    if let Some(ga) = map.mute_status {
                        out.push((ga, GroupValue::Bool(new.mute)));
                    }
                    if let Some(ga) = map.track_status {
                        let index = new.track.as_ref().map(|t| t.index as i64).unwrap_or(0);
                        out.push((ga, GroupValue::dpt5(index)));
                    }
                    if let Some(ga) = map.playlist_status {
                        let index =
                            new.playlist.as_ref().map(|p| p.index as i64).unwrap_or(0);
                        out.push((ga, GroupValue::dpt5(index)));
                    }
                }
            }
            Notification::ClientStateChanged { new, .. } => {
                if let Some(map) = self.client_map(new.index) {
                    if let Some(ga) = map.connected_status {
                        out.push((ga, GroupValue::Bool(new.connected)));
                    }
                    if let Some(ga) = map.volume_status {
                        out.push((ga, GroupValue::dpt5(new.volume as i64)));
                    }
                    if let Some(ga) = map.mute_status {
                        out.push((ga, GroupValue::Bool(new.mute)));
                    }
                    if let Some(ga) = map.zone_status {
                        out.push((ga, GroupValue::dpt5(new.desired_zone() as i64)));
                    }
                }
            }
            // Position, flags, membership, and system status have no KNX
            // representation
            _ => {}
        }
        out
    }

    async fn publish_one(&self, envelope: NotificationEnvelope) -> Result<()> {
        if envelope.origin == CommandSource::Knx {
            debug!(
                event = envelope.notification.event_type(),
                "suppressing knx echo"
            );
            return Ok(());
        }
        if !self.adapter.is_connected() {
            return Ok(());
        }

        for (ga, value) in self.render(&envelope.notification) {
            if let Err(e) = self.adapter.write_group_value(ga, value).await {
                bump(&self.stats.counters.knx_publish_failures);
                warn!(ga = %ga, error = %e, "knx status write failed");
            }
        }
        Ok(())
    }

    /// Subscriber loop; spawned once per process.
    pub async fn run(self, notify: NotificationTx, shutdown: CancellationToken) {
        let rx = notify.subscribe();
        let publisher = Arc::new(self);
        crate::bus::run_subscriber("knx-publisher", rx, shutdown, move |envelope| {
            let publisher = publisher.clone();
            async move { publisher.publish_one(envelope).await }
        })
        .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, BackoffPolicy, ClientConfig, KnxConfig, KnxConnectionType, ReconcileConfig,
        ServicesConfig, SnapcastConfig, ZoneConfig,
    };
    use crate::state::zone::PlaybackState;

    fn app_config() -> AppConfig {
        AppConfig {
            api: ApiConfig::default(),
            services: ServicesConfig {
                snapcast: SnapcastConfig {
                    host: "localhost".into(),
                    port: 1705,
                    timeout_secs: 5,
                    expect_free_port: false,
                    reconnect: BackoffPolicy::default(),
                },
                mqtt: None,
                knx: Some(KnxConfig {
                    connection: KnxConnectionType::Tunnel,
                    host: "gateway".into(),
                    port: 3671,
                    reconnect_secs: 30,
                    outbound_queue: 16,
                }),
                subsonic: None,
            },
            zones: vec![ZoneConfig {
                name: "Kitchen".into(),
                sink: "/snapsinks/kitchen".into(),
                mqtt: None,
                knx: Some(ZoneKnxConfig {
                    volume_status: Some("4/0/1".parse().unwrap()),
                    mute_status: Some("4/0/2".parse().unwrap()),
                    playback_status: Some("4/0/3".parse().unwrap()),
                    playlist_status: Some("4/0/4".parse().unwrap()),
                    track_status: Some("4/0/5".parse().unwrap()),
                    ..Default::default()
                }),
                icon: None,
            }],
            clients: vec![ClientConfig {
                name: "Speaker".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                default_zone: 1,
                mqtt: None,
                knx: Some(ClientKnxConfig {
                    zone_status: Some("5/0/1".parse().unwrap()),
                    ..Default::default()
                }),
                icon: None,
            }],
            directories: vec![],
            reconcile: ReconcileConfig::default(),
        }
    }

    fn test_publisher() -> KnxPublisher {
        let config = app_config();
        let mediator = Arc::new(crate::bus::Mediator::builder().build());
        let adapter = KnxAdapter::new(
            config.services.knx.clone().unwrap(),
            &config,
            mediator,
            Arc::new(Stats::new()),
            CancellationToken::new(),
        );
        KnxPublisher::new(adapter, &config, Arc::new(Stats::new()))
    }

    #[test]
    fn test_volume_status_uses_dpt5() {
        let writes = test_publisher().render(&Notification::ZoneVolumeChanged {
            zone: 1,
            volume: 60,
        });
        assert_eq!(
            writes,
            vec![("4/0/1".parse().unwrap(), GroupValue::Byte(60))]
        );
    }

    #[test]
    fn test_playback_status_encoding() {
        let p = test_publisher();
        for (state, byte) in [
            (PlaybackState::Stopped, 0u8),
            (PlaybackState::Playing, 1),
            (PlaybackState::Paused, 2),
        ] {
            let writes = p.render(&Notification::ZonePlaybackStateChanged { zone: 1, state });
            assert_eq!(writes, vec![("4/0/3".parse().unwrap(), GroupValue::Byte(byte))]);
        }
    }

    #[test]
    fn test_playlist_status_is_index_not_string() {
        let playlist = crate::state::zone::PlaylistInfo {
            index: 7,
            id: "pl-7".into(),
            name: "Jazz Evenings with a Very Long Name".into(),
            track_count: 12,
        };
        let writes = test_publisher().render(&Notification::ZonePlaylistChanged {
            zone: 1,
            playlist: Some(playlist),
        });
        assert_eq!(
            writes,
            vec![("4/0/4".parse().unwrap(), GroupValue::Byte(7))]
        );
    }

    #[test]
    fn test_client_zone_status() {
        let writes = test_publisher().render(&Notification::ClientZoneAssignmentChanged {
            client: 1,
            previous: 1,
            next: 3,
        });
        assert_eq!(
            writes,
            vec![("5/0/1".parse().unwrap(), GroupValue::Byte(3))]
        );
    }

    #[test]
    fn test_unmapped_notifications_render_nothing() {
        let writes = test_publisher().render(&Notification::ZoneShuffleChanged {
            zone: 1,
            enabled: true,
        });
        assert!(writes.is_empty());
    }
}
