#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Shared test fixtures: a mock Snapcast JSON-RPC server and a fully wired
//! control-plane stack bound to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use snapdog::adapters::snapcast::{SnapcastAdapter, SnapcastEvent};
use snapdog::bus::commands::CommandKind;
use snapdog::bus::{Mediator, NotificationTx, SharedMediator};
use snapdog::config::{
    ApiConfig, AppConfig, BackoffPolicy, ClientConfig, EntityMqttConfig, ReconcileConfig,
    ServicesConfig, SnapcastConfig, ZoneConfig,
};
use snapdog::grouping::GroupingService;
use snapdog::handlers::{ClientHandler, ZoneHandler};
use snapdog::state::{SharedStore, StateStore};
use snapdog::stats::Stats;

// =============================================================================
// Mock Snapcast server
// =============================================================================

#[derive(Debug, Clone)]
pub struct MockClient {
    pub id: String,
    pub mac: String,
    pub name: String,
    pub connected: bool,
    pub volume: i64,
    pub muted: bool,
    pub latency: i64,
}

#[derive(Debug, Clone)]
pub struct MockGroup {
    pub id: String,
    pub stream_id: String,
    pub clients: Vec<MockClient>,
}

#[derive(Debug, Default)]
pub struct MockModel {
    pub groups: Vec<MockGroup>,
    /// Method call log, in order
    pub calls: Vec<String>,
    /// Artificial latency applied to Server.GetStatus, for tests that need
    /// a window to observe in-flight passes
    pub status_delay: Duration,
}

impl MockModel {
    fn render_status(&self) -> Value {
        json!({
            "groups": self.groups.iter().map(|g| json!({
                "id": g.id,
                "muted": false,
                "stream_id": g.stream_id,
                "clients": g.clients.iter().map(|c| json!({
                    "id": c.id,
                    "connected": c.connected,
                    "host": { "mac": c.mac, "name": c.name },
                    "config": {
                        "latency": c.latency,
                        "name": c.name,
                        "volume": { "muted": c.muted, "percent": c.volume }
                    }
                })).collect::<Vec<_>>()
            })).collect::<Vec<_>>(),
            "streams": self.groups.iter().map(|g| json!({
                "id": g.stream_id,
                "status": "playing"
            })).collect::<Vec<_>>()
        })
    }

    fn find_client_mut(&mut self, id: &str) -> Option<&mut MockClient> {
        self.groups
            .iter_mut()
            .find_map(|g| g.clients.iter_mut().find(|c| c.id == id))
    }

    fn apply(&mut self, method: &str, params: &Value) -> Value {
        self.calls.push(method.to_string());
        match method {
            "Server.GetStatus" => json!({ "server": self.render_status() }),
            "Client.SetVolume" => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                if let Some(client) = self.find_client_mut(&id) {
                    client.volume = params["volume"]["percent"].as_i64().unwrap_or(0);
                    client.muted = params["volume"]["muted"].as_bool().unwrap_or(false);
                }
                json!({})
            }
            "Client.SetLatency" => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                if let Some(client) = self.find_client_mut(&id) {
                    client.latency = params["latency"].as_i64().unwrap_or(0);
                }
                json!({})
            }
            "Client.SetName" => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                if let Some(client) = self.find_client_mut(&id) {
                    client.name = params["name"].as_str().unwrap_or_default().to_string();
                }
                json!({})
            }
            "Group.SetStream" => {
                let id = params["id"].as_str().unwrap_or_default();
                if let Some(group) = self.groups.iter_mut().find(|g| g.id == id) {
                    group.stream_id =
                        params["stream_id"].as_str().unwrap_or_default().to_string();
                }
                json!({})
            }
            "Group.SetClients" => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                let wanted: Vec<String> = params["clients"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();

                // Pull the wanted clients out of whatever group holds them
                let mut moved = Vec::new();
                for group in &mut self.groups {
                    let (take, keep): (Vec<_>, Vec<_>) = group
                        .clients
                        .drain(..)
                        .partition(|c| wanted.contains(&c.id) && group.id != id);
                    moved.extend(take);
                    group.clients = keep;
                }
                if let Some(group) = self.groups.iter_mut().find(|g| g.id == id) {
                    group.clients.extend(moved);
                    group.clients.retain(|c| wanted.contains(&c.id));
                } else if !moved.is_empty() {
                    self.groups.push(MockGroup {
                        id,
                        stream_id: "auto".into(),
                        clients: moved,
                    });
                }
                // Snapcast garbage-collects empty groups
                self.groups.retain(|g| !g.clients.is_empty());
                json!({ "server": self.render_status() })
            }
            "Stream.Control" => json!({}),
            _ => json!({}),
        }
    }

    pub fn calls_of(&self, method: &str) -> usize {
        self.calls.iter().filter(|m| m.as_str() == method).count()
    }
}

pub struct MockSnapcast {
    pub addr: SocketAddr,
    pub model: Arc<Mutex<MockModel>>,
}

impl MockSnapcast {
    pub async fn start(model: MockModel) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let model = Arc::new(Mutex::new(model));

        let shared = model.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let model = shared.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = socket.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        let method = request["method"].as_str().unwrap_or_default();
                        let params = request["params"].clone();
                        let delay = model.lock().await.status_delay;
                        if method == "Server.GetStatus" && !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let result = model.lock().await.apply(method, &params);
                        let reply = json!({
                            "id": request["id"],
                            "jsonrpc": "2.0",
                            "result": result
                        });
                        if write_half
                            .write_all(format!("{}\n", reply).as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });

        Self { addr, model }
    }
}

// =============================================================================
// Config + stack fixtures
// =============================================================================

pub fn fixture_config(snapcast_port: u16, zones: usize, clients: usize) -> AppConfig {
    AppConfig {
        api: ApiConfig::default(),
        services: ServicesConfig {
            snapcast: SnapcastConfig {
                host: "127.0.0.1".into(),
                port: snapcast_port,
                timeout_secs: 2,
                expect_free_port: false,
                reconnect: BackoffPolicy {
                    base_ms: 20,
                    factor: 2.0,
                    jitter: 0.0,
                    cap_ms: 100,
                },
            },
            mqtt: None,
            knx: None,
            subsonic: None,
        },
        zones: (0..zones)
            .map(|i| ZoneConfig {
                name: format!("Zone {}", i + 1),
                sink: format!("/snapsinks/zone{}", i + 1),
                mqtt: Some(EntityMqttConfig {
                    base_topic: format!("snapdog/zones/zone{}", i + 1),
                }),
                knx: None,
                icon: None,
            })
            .collect(),
        clients: (0..clients)
            .map(|i| ClientConfig {
                name: format!("Client {}", i + 1),
                mac: format!("aa:bb:cc:dd:ee:{:02x}", i + 1),
                default_zone: 1,
                mqtt: None,
                knx: None,
                icon: None,
            })
            .collect(),
        directories: vec![],
        reconcile: ReconcileConfig {
            interval_secs: 3600,
            budget_secs: 5,
        },
    }
}

pub struct Stack {
    pub config: Arc<AppConfig>,
    pub store: SharedStore,
    pub mediator: SharedMediator,
    pub notify: NotificationTx,
    pub snapcast: Arc<SnapcastAdapter>,
    pub grouping: Arc<GroupingService>,
    pub stats: Arc<Stats>,
    pub shutdown: CancellationToken,
    pub snapcast_events: tokio::sync::mpsc::Receiver<SnapcastEvent>,
}

/// Wire a full stack against the given config. The Snapcast adapter's run
/// loop is spawned; callers that need it connected should wait with
/// [`wait_connected`].
pub async fn build_stack(config: AppConfig) -> Stack {
    let config = Arc::new(config);
    let stats = Arc::new(Stats::new());
    let shutdown = CancellationToken::new();

    let store: SharedStore = Arc::new(StateStore::from_config(&config));
    store.seed_zone_membership().await.unwrap();

    let builder = Mediator::builder();
    let notify = builder.notification_tx();

    let (snapcast, snapcast_events) = SnapcastAdapter::new(
        config.services.snapcast.clone(),
        stats.clone(),
        shutdown.clone(),
    );
    tokio::spawn(snapcast.clone().run());

    let grouping = GroupingService::new(
        store.clone(),
        snapcast.clone(),
        notify.clone(),
        stats.clone(),
        config.reconcile.clone(),
    );

    let zone_handler = ZoneHandler::new(store.clone(), snapcast.clone(), None, notify.clone());
    let client_handler = ClientHandler::new(
        store.clone(),
        snapcast.clone(),
        grouping.clone(),
        notify.clone(),
        stats.clone(),
    );

    let mediator = Arc::new(
        builder
            .register_all(
                &[
                    CommandKind::ZonePlayback,
                    CommandKind::ZoneTrackNav,
                    CommandKind::ZonePlayTrack,
                    CommandKind::ZoneLoadPlaylist,
                    CommandKind::ZoneVolume,
                    CommandKind::ZoneMute,
                    CommandKind::ZoneModeFlags,
                    CommandKind::ZoneSyncPosition,
                ],
                zone_handler,
            )
            .register_all(
                &[
                    CommandKind::ClientVolume,
                    CommandKind::ClientMute,
                    CommandKind::ClientLatency,
                    CommandKind::ClientZone,
                    CommandKind::ClientPresence,
                ],
                client_handler,
            )
            .build(),
    );
    mediator.verify_registry().unwrap();

    Stack {
        config,
        store,
        mediator,
        notify,
        snapcast,
        grouping,
        stats,
        shutdown,
        snapcast_events,
    }
}

/// Wait until the adapter reports connected (or panic after 2 s).
pub async fn wait_connected(snapcast: &SnapcastAdapter) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !snapcast.is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapcast adapter did not connect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A one-group, one-client model matching `fixture_config(_, 1, 1)`.
pub fn single_zone_model() -> MockModel {
    MockModel {
        groups: vec![MockGroup {
            id: "g1".into(),
            stream_id: "/snapsinks/zone1".into(),
            clients: vec![MockClient {
                id: "snap-c1".into(),
                mac: "aa:bb:cc:dd:ee:01".into(),
                name: "Client 1".into(),
                connected: true,
                volume: 50,
                muted: false,
                latency: 0,
            }],
        }],
        calls: Vec::new(),
        status_delay: Duration::ZERO,
    }
}

/// Map of notification event types seen on a receiver within the window.
pub async fn drain_notifications(
    rx: &mut tokio::sync::broadcast::Receiver<snapdog::bus::events::NotificationEnvelope>,
    window: Duration,
) -> HashMap<String, usize> {
    let mut seen = HashMap::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(envelope)) => {
                *seen
                    .entry(envelope.notification.event_type().to_string())
                    .or_insert(0) += 1;
            }
            _ => break,
        }
    }
    seen
}
