//! MQTT adapter
//!
//! Bridges the mediator to an MQTT broker. Command topics
//! (`{base}/cmd/...`) are subscribed at QoS 1 and translated into
//! `Source=Mqtt` commands; status topics are published retained so late
//! subscribers see current state. Parse failures are surfaced on the
//! entity's `/error` sub-topic and the command is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::commands::{ClientOp, Command, CommandEnvelope, CommandSource, ZoneOp};
use crate::bus::SharedMediator;
use crate::config::{AppConfig, MqttConfig};
use crate::error::{Error, Result};
use crate::stats::{bump, Stats};

// =============================================================================
// Topic routing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Zone,
    Client,
}

#[derive(Debug, Clone)]
struct TopicEntry {
    kind: EntityKind,
    index: usize,
    base: String,
}

/// Result of routing one inbound publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Command(Command),
    /// Unroutable payload: publish `message` to `error_topic`, drop
    Failure { error_topic: String, message: String },
    /// Topic does not belong to any configured entity
    Unknown,
}

/// Maps configured entity base topics to command parsers.
pub struct TopicRouter {
    entries: Vec<TopicEntry>,
}

impl TopicRouter {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut entries = Vec::new();
        for (i, zone) in config.zones.iter().enumerate() {
            if let Some(mqtt) = &zone.mqtt {
                entries.push(TopicEntry {
                    kind: EntityKind::Zone,
                    index: i + 1,
                    base: mqtt.base_topic.trim_end_matches('/').to_string(),
                });
            }
        }
        for (i, client) in config.clients.iter().enumerate() {
            if let Some(mqtt) = &client.mqtt {
                entries.push(TopicEntry {
                    kind: EntityKind::Client,
                    index: i + 1,
                    base: mqtt.base_topic.trim_end_matches('/').to_string(),
                });
            }
        }
        Self { entries }
    }

    /// Command subscription patterns, one per entity.
    pub fn subscriptions(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{}/cmd/#", e.base))
            .collect()
    }

    pub fn route(&self, topic: &str, payload: &str) -> Routed {
        let Some((entry, suffix)) = self.entries.iter().find_map(|e| {
            topic
                .strip_prefix(e.base.as_str())
                .and_then(|rest| rest.strip_prefix("/cmd/"))
                .map(|suffix| (e, suffix))
        }) else {
            return Routed::Unknown;
        };

        let payload = payload.trim();
        match self.parse(entry, suffix, payload) {
            Ok(command) => Routed::Command(command),
            Err(message) => Routed::Failure {
                error_topic: format!("{}/error", entry.base),
                message,
            },
        }
    }

    fn parse(
        &self,
        entry: &TopicEntry,
        suffix: &str,
        payload: &str,
    ) -> std::result::Result<Command, String> {
        let int = |payload: &str| -> std::result::Result<i64, String> {
            payload
                .parse::<i64>()
                .map_err(|_| format!("expected integer payload, got {:?}", payload))
        };
        let flag = |payload: &str| -> std::result::Result<bool, String> {
            match payload {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(format!("expected 0 or 1, got {:?}", other)),
            }
        };

        match entry.kind {
            EntityKind::Zone => {
                let zone = entry.index;
                let op = match suffix {
                    "play" => ZoneOp::Play,
                    "pause" => ZoneOp::Pause,
                    "stop" => ZoneOp::Stop,
                    "next" => ZoneOp::NextTrack,
                    "prev" => ZoneOp::PreviousTrack,
                    "track" => ZoneOp::PlayTrack { index: int(payload)? },
                    "playlist" => ZoneOp::LoadPlaylist { index: int(payload)? },
                    "volume" => ZoneOp::SetVolume { volume: int(payload)? },
                    "mute" => ZoneOp::SetMute { mute: flag(payload)? },
                    "repeat/track" => ZoneOp::SetTrackRepeat { enabled: flag(payload)? },
                    "repeat/playlist" => ZoneOp::SetPlaylistRepeat { enabled: flag(payload)? },
                    "shuffle" => ZoneOp::SetShuffle { enabled: flag(payload)? },
                    other => return Err(format!("unknown zone command {:?}", other)),
                };
                Ok(Command::Zone { zone, op })
            }
            EntityKind::Client => {
                let client = entry.index;
                let op = match suffix {
                    "volume" => ClientOp::SetVolume { volume: int(payload)? },
                    "mute" => ClientOp::SetMute { mute: flag(payload)? },
                    "zone" => ClientOp::AssignZone { zone: int(payload)? },
                    other => return Err(format!("unknown client command {:?}", other)),
                };
                Ok(Command::Client { client, op })
            }
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

pub struct MqttAdapter {
    config: MqttConfig,
    router: TopicRouter,
    client: RwLock<Option<AsyncClient>>,
    connected: AtomicBool,
    connected_tx: watch::Sender<bool>,
    mediator: SharedMediator,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl MqttAdapter {
    pub fn new(
        config: MqttConfig,
        app: &AppConfig,
        mediator: SharedMediator,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            router: TopicRouter::from_config(app),
            config,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
            connected_tx,
            mediator,
            stats,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.config.system_base_topic)
    }

    /// Start the broker connection and the event-loop task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            self.status_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, self.config.outbound_queue);
        *self.client.write().await = Some(client.clone());

        info!(
            host = %self.config.host,
            port = self.config.port,
            "mqtt connecting"
        );

        let adapter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = adapter.shutdown.cancelled() => {
                        info!("mqtt event loop shutting down");
                        break;
                    }
                    polled = eventloop.poll() => match polled {
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                            info!(code = ?ack.code, "mqtt connected");
                            adapter.connected.store(true, Ordering::SeqCst);
                            let _ = adapter.connected_tx.send(true);
                            adapter.on_connected().await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload =
                                String::from_utf8_lossy(&publish.payload).to_string();
                            adapter.on_publish(&publish.topic, &payload).await;
                        }
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            warn!("mqtt disconnected");
                            adapter.connected.store(false, Ordering::SeqCst);
                            let _ = adapter.connected_tx.send(false);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "mqtt error");
                            adapter.connected.store(false, Ordering::SeqCst);
                            let _ = adapter.connected_tx.send(false);
                            tokio::select! {
                                _ = adapter.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Subscriptions and the retained liveness flag, (re)applied on every
    /// ConnAck so a broker restart restores them.
    async fn on_connected(&self) {
        let Some(client) = self.client.read().await.clone() else {
            return;
        };
        for pattern in self.router.subscriptions() {
            if let Err(e) = client.subscribe(&pattern, QoS::AtLeastOnce).await {
                warn!(pattern = %pattern, error = %e, "mqtt subscribe failed");
            }
        }
        if let Err(e) = client
            .publish(self.status_topic(), QoS::AtLeastOnce, true, "online")
            .await
        {
            warn!(error = %e, "mqtt liveness publish failed");
        }
    }

    async fn on_publish(&self, topic: &str, payload: &str) {
        match self.router.route(topic, payload) {
            Routed::Command(command) => {
                debug!(topic, ?command, "mqtt command");
                let mediator = self.mediator.clone();
                let stats = self.stats.clone();
                tokio::spawn(async move {
                    bump(&stats.counters.commands_processed);
                    if let Err(e) = mediator
                        .send(CommandEnvelope::new(CommandSource::Mqtt, command))
                        .await
                    {
                        bump(&stats.counters.commands_failed);
                        stats.record_error("mqtt", &e);
                        warn!(error = %e, "mqtt command failed");
                    }
                });
            }
            Routed::Failure {
                error_topic,
                message,
            } => {
                bump(&self.stats.counters.commands_dropped);
                warn!(topic, %message, "unroutable mqtt command");
                let _ = self
                    .publish(&error_topic, message.as_bytes(), QoS::AtMostOnce, false)
                    .await;
            }
            Routed::Unknown => {
                debug!(topic, "publish on unrecognized topic");
            }
        }
    }

    /// Publish a message. Retained status writes use [`Self::publish_retained`]
    /// which maps queue overflow to `Backpressure`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::unavailable("mqtt is not connected"));
        }
        let client = self.client.read().await.clone();
        let Some(client) = client else {
            return Err(Error::unavailable("mqtt is not connected"));
        };
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| Error::external(format!("mqtt publish: {}", e)))
    }

    /// Retained status write. A full outbound queue fails with
    /// `Backpressure` rather than blocking the publisher.
    pub async fn publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::unavailable("mqtt is not connected"));
        }
        let client = self.client.read().await.clone();
        let Some(client) = client else {
            return Err(Error::unavailable("mqtt is not connected"));
        };
        client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| match e {
                rumqttc::ClientError::TryRequest(_) => {
                    bump(&self.stats.counters.mqtt_publish_failures);
                    Error::backpressure("mqtt outbound queue full")
                }
                other => Error::external(format!("mqtt publish: {}", other)),
            })
    }

    pub async fn stop(&self) {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            // Replace the LWT with an explicit clean offline
            let _ = client
                .publish(self.status_topic(), QoS::AtLeastOnce, true, "offline")
                .await;
            let _ = client.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.connected_tx.send(false);
        info!("mqtt adapter stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, BackoffPolicy, ClientConfig, EntityMqttConfig, ReconcileConfig,
        ServicesConfig, SnapcastConfig, ZoneConfig,
    };

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
                knx: None,
                subsonic: None,
            },
            zones: vec![ZoneConfig {
                name: "Kitchen".into(),
                sink: "/snapsinks/kitchen".into(),
                mqtt: Some(EntityMqttConfig {
                    base_topic: "snapdog/zones/kitchen".into(),
                }),
                knx: None,
                icon: None,
            }],
            clients: vec![ClientConfig {
                name: "Speaker".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                default_zone: 1,
                mqtt: Some(EntityMqttConfig {
                    base_topic: "snapdog/clients/speaker".into(),
                }),
                knx: None,
                icon: None,
            }],
            directories: vec![],
            reconcile: ReconcileConfig::default(),
        }
    }

    fn router() -> TopicRouter {
        TopicRouter::from_config(&app_config())
    }

    #[test]
    fn test_subscriptions_cover_all_entities() {
        let subs = router().subscriptions();
        assert_eq!(
            subs,
            vec![
                "snapdog/zones/kitchen/cmd/#".to_string(),
                "snapdog/clients/speaker/cmd/#".to_string(),
            ]
        );
    }

    #[test]
    fn test_zone_volume_command() {
        let routed = router().route("snapdog/zones/kitchen/cmd/volume", "60");
        assert_eq!(
            routed,
            Routed::Command(Command::Zone {
                zone: 1,
                op: ZoneOp::SetVolume { volume: 60 }
            })
        );
    }

    #[test]
    fn test_playback_and_nav_commands() {
        let r = router();
        for (suffix, op) in [
            ("play", ZoneOp::Play),
            ("pause", ZoneOp::Pause),
            ("stop", ZoneOp::Stop),
            ("next", ZoneOp::NextTrack),
            ("prev", ZoneOp::PreviousTrack),
        ] {
            let topic = format!("snapdog/zones/kitchen/cmd/{}", suffix);
            assert_eq!(
                r.route(&topic, ""),
                Routed::Command(Command::Zone { zone: 1, op })
            );
        }
    }

    #[test]
    fn test_repeat_and_shuffle_flags() {
        let r = router();
        assert_eq!(
            r.route("snapdog/zones/kitchen/cmd/repeat/track", "1"),
            Routed::Command(Command::Zone {
                zone: 1,
                op: ZoneOp::SetTrackRepeat { enabled: true }
            })
        );
        assert_eq!(
            r.route("snapdog/zones/kitchen/cmd/shuffle", "0"),
            Routed::Command(Command::Zone {
                zone: 1,
                op: ZoneOp::SetShuffle { enabled: false }
            })
        );
    }

    #[test]
    fn test_client_zone_command() {
        assert_eq!(
            router().route("snapdog/clients/speaker/cmd/zone", "3"),
            Routed::Command(Command::Client {
                client: 1,
                op: ClientOp::AssignZone { zone: 3 }
            })
        );
    }

    #[test]
    fn test_parse_failure_routes_to_error_topic() {
        match router().route("snapdog/zones/kitchen/cmd/volume", "loud") {
            Routed::Failure { error_topic, message } => {
                assert_eq!(error_topic, "snapdog/zones/kitchen/error");
                assert!(message.contains("loud"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_suffix_is_a_failure() {
        assert!(matches!(
            router().route("snapdog/zones/kitchen/cmd/eject", ""),
            Routed::Failure { .. }
        ));
    }

    #[test]
    fn test_mute_payload_is_strict() {
        assert!(matches!(
            router().route("snapdog/zones/kitchen/cmd/mute", "true"),
            Routed::Failure { .. }
        ));
        assert_eq!(
            router().route("snapdog/zones/kitchen/cmd/mute", "1"),
            Routed::Command(Command::Zone {
                zone: 1,
                op: ZoneOp::SetMute { mute: true }
            })
        );
    }

    #[test]
    fn test_foreign_topic_is_unknown() {
        assert_eq!(
            router().route("some/other/topic", "x"),
            Routed::Unknown
        );
        // Status topic (no /cmd/) is not a command either
        assert_eq!(
            router().route("snapdog/zones/kitchen/volume", "60"),
            Routed::Unknown
        );
    }
}
