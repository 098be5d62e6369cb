//! MQTT status publisher
//!
//! Translates notifications into retained status topics under each entity's
//! base topic. Notifications that originated from MQTT are skipped (echo
//! suppression); everything else is published so late subscribers always see
//! current state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::mqtt::MqttAdapter;
use crate::bus::commands::CommandSource;
use crate::bus::events::{Notification, NotificationEnvelope};
use crate::bus::NotificationTx;
use crate::config::AppConfig;
use crate::error::Result;
use crate::stats::{bump, Stats};

pub struct MqttPublisher {
    adapter: Arc<MqttAdapter>,
    /// 1-based entity index -> base topic
    zone_topics: Vec<Option<String>>,
    client_topics: Vec<Option<String>>,
    system_base: String,
    stats: Arc<Stats>,
}

impl MqttPublisher {
    pub fn new(adapter: Arc<MqttAdapter>, config: &AppConfig, stats: Arc<Stats>) -> Self {
        let base = |topic: &Option<crate::config::EntityMqttConfig>| {
            topic
                .as_ref()
                .map(|t| t.base_topic.trim_end_matches('/').to_string())
        };
        Self {
            adapter,
            zone_topics: config.zones.iter().map(|z| base(&z.mqtt)).collect(),
            client_topics: config.clients.iter().map(|c| base(&c.mqtt)).collect(),
            system_base: config
                .services
                .mqtt
                .as_ref()
                .map(|m| m.system_base_topic.clone())
                .unwrap_or_else(|| "snapdog/system".to_string()),
            stats,
        }
    }

    fn zone_base(&self, index: usize) -> Option<&str> {
        self.zone_topics.get(index - 1)?.as_deref()
    }

    fn client_base(&self, index: usize) -> Option<&str> {
        self.client_topics.get(index - 1)?.as_deref()
    }

    /// Wire rendering for one notification: retained `(topic, payload)`
    /// writes.
    fn render(&self, notification: &Notification) -> Vec<(String, String)> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        let mut out = Vec::new();

        match notification {
            Notification::ZoneClientsChanged { zone, clients } => {
                if let Some(base) = self.zone_base(*zone) {
                    if let Ok(json) = serde_json::to_string(clients) {
                        out.push((format!("{}/clients", base), json));
                    }
                }
            }
            Notification::ZonePlaybackStateChanged { zone, state } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/state", base), state.to_string()));
                }
            }
            Notification::ZoneVolumeChanged { zone, volume } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/volume", base), volume.to_string()));
                }
            }
            Notification::ZoneMuteChanged { zone, mute } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/mute", base), flag(*mute)));
                }
            }
            Notification::ZoneTrackRepeatChanged { zone, enabled } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/repeat/track", base), flag(*enabled)));
                }
            }
            Notification::ZonePlaylistRepeatChanged { zone, enabled } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/repeat/playlist", base), flag(*enabled)));
                }
            }
            Notification::ZoneShuffleChanged { zone, enabled } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/shuffle", base), flag(*enabled)));
                }
            }
            Notification::ZonePlaylistChanged { zone, playlist } => {
                if let Some(base) = self.zone_base(*zone) {
                    if let Ok(json) = serde_json::to_string(playlist) {
                        out.push((format!("{}/playlist", base), json));
                    }
                }
            }
            Notification::ZoneTrackChanged { zone, track } => {
                if let Some(base) = self.zone_base(*zone) {
                    if let Ok(json) = serde_json::to_string(track) {
                        out.push((format!("{}/track", base), json));
                    }
                }
            }
            Notification::ZonePositionChanged { zone, position_ms } => {
                if let Some(base) = self.zone_base(*zone) {
                    out.push((format!("{}/position", base), position_ms.to_string()));
                }
            }
            Notification::ZoneStateChanged { new, .. } => {
                if let Some(base) = self.zone_base(new.index) {
                    if let Ok(json) = serde_json::to_string(new) {
                        out.push((format!("{}/status", base), json));
                    }
                }
            }
            Notification::ClientConnectedChanged { client, connected } => {
                if let Some(base) = self.client_base(*client) {
                    out.push((format!("{}/connected", base), flag(*connected)));
                }
            }
            Notification::ClientVolumeChanged { client, volume } => {
                if let Some(base) = self.client_base(*client) {
                    out.push((format!("{}/volume", base), volume.to_string()));
                }
            }
            Notification::ClientMuteChanged { client, mute } => {
                if let Some(base) = self.client_base(*client) {
                    out.push((format!("{}/mute", base), flag(*mute)));
                }
            }
            Notification::ClientLatencyChanged { client, latency_ms } => {
                if let Some(base) = self.client_base(*client) {
                    out.push((format!("{}/latency", base), latency_ms.to_string()));
                }
            }
            Notification::ClientZoneAssignmentChanged { client, next, .. } => {
                if let Some(base) = self.client_base(*client) {
                    out.push((format!("{}/zone", base), next.to_string()));
                }
            }
            Notification::ClientStateChanged { new, .. } => {
                if let Some(base) = self.client_base(new.index) {
                    if let Ok(json) = serde_json::to_string(new) {
                        out.push((format!("{}/status", base), json));
                    }
                }
            }
            Notification::SystemStatusChanged { status } => {
                if let Ok(json) = serde_json::to_string(status) {
                    out.push((format!("{}/state", self.system_base), json));
                }
            }
        }
        out
    }

    async fn publish_one(&self, envelope: NotificationEnvelope) -> Result<()> {
        // Echo suppression: changes MQTT itself commanded are not written
        // back to MQTT
        if envelope.origin == CommandSource::Mqtt {
            debug!(
                event = envelope.notification.event_type(),
                "suppressing mqtt echo"
            );
            return Ok(());
        }

        for (topic, payload) in self.render(&envelope.notification) {
            if let Err(e) = self.adapter.publish_retained(&topic, &payload).await {
                bump(&self.stats.counters.mqtt_publish_failures);
                warn!(topic = %topic, error = %e, "status publish failed");
            }
        }
        Ok(())
    }

    /// Subscriber loop; spawned once per process.
    pub async fn run(self, notify: NotificationTx, shutdown: CancellationToken) {
        let rx = notify.subscribe();
        let publisher = Arc::new(self);
        crate::bus::run_subscriber("mqtt-publisher", rx, shutdown, move |envelope| {
            let publisher = publisher.clone();
            async move { publisher.publish_one(envelope).await }
        })
        .await;
    }
}
