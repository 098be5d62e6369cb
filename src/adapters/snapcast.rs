//! Snapcast JSON-RPC client
//!
//! Implements JSON-RPC 2.0 over a persistent TCP connection, newline
//! delimited. Requests carry a monotonically increasing id and are matched
//! to replies through a pending map; server-initiated notifications are
//! forwarded to the control loop as [`SnapcastEvent`]s.
//!
//! Resilience: on socket close or request timeout the adapter transitions to
//! reconnecting, fails all pending requests with `Unavailable`, and retries
//! with exponential backoff (base 1 s, factor 2, jitter +/-25%, cap 30 s).
//! While disconnected every outbound call fails fast with `Unavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SnapcastConfig;
use crate::error::{Error, Result};
use crate::stats::{bump, Stats};

/// Bound on events queued toward the control loop. Overflow drops the event;
/// the periodic reconciliation pass repairs any missed state.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Bound on lines queued toward the writer task.
const WRITE_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Wire model
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapVolume {
    pub muted: bool,
    pub percent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapHost {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapClientConfig {
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub name: String,
    pub volume: SnapVolume,
}

/// A client as Snapcast reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapClient {
    pub id: String,
    pub connected: bool,
    pub host: SnapHost,
    pub config: SnapClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapGroup {
    pub id: String,
    #[serde(default)]
    pub muted: bool,
    pub stream_id: String,
    pub clients: Vec<SnapClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapStream {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStatus {
    pub groups: Vec<SnapGroup>,
    #[serde(default)]
    pub streams: Vec<SnapStream>,
}

impl ServerStatus {
    pub fn find_client(&self, id: &str) -> Option<(&SnapGroup, &SnapClient)> {
        self.groups.iter().find_map(|g| {
            g.clients
                .iter()
                .find(|c| c.id == id)
                .map(|c| (g, c))
        })
    }

    pub fn group_for_stream(&self, stream_id: &str) -> Option<&SnapGroup> {
        self.groups.iter().find(|g| g.stream_id == stream_id)
    }
}

/// Server-initiated notifications the control loop consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapcastNotification {
    ClientConnected { client: SnapClient },
    ClientDisconnected { id: String },
    ClientVolumeChanged { id: String, volume: SnapVolume },
    ClientLatencyChanged { id: String, latency: i64 },
    GroupStreamChanged { id: String, stream_id: String },
    GroupMuteChanged { id: String, mute: bool },
    /// Full server state changed (client added/removed, server restart)
    ServerUpdated { status: ServerStatus },
    /// Stream playback properties (position feeds TrackInfo.position_ms)
    StreamProperties {
        id: String,
        position_ms: Option<u64>,
        playing: Option<bool>,
    },
}

/// Connection lifecycle + notifications, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapcastEvent {
    Connected,
    Disconnected,
    Notification(SnapcastNotification),
}

fn parse_notification(method: &str, params: &Value) -> Option<SnapcastNotification> {
    match method {
        "Client.OnConnect" => serde_json::from_value(params.get("client")?.clone())
            .ok()
            .map(|client| SnapcastNotification::ClientConnected { client }),
        "Client.OnDisconnect" => {
            let id = params
                .get("client")
                .and_then(|c| c.get("id"))
                .or_else(|| params.get("id"))?
                .as_str()?
                .to_string();
            Some(SnapcastNotification::ClientDisconnected { id })
        }
        "Client.OnVolumeChanged" => Some(SnapcastNotification::ClientVolumeChanged {
            id: params.get("id")?.as_str()?.to_string(),
            volume: serde_json::from_value(params.get("volume")?.clone()).ok()?,
        }),
        "Client.OnLatencyChanged" => Some(SnapcastNotification::ClientLatencyChanged {
            id: params.get("id")?.as_str()?.to_string(),
            latency: params.get("latency")?.as_i64()?,
        }),
        "Group.OnStreamChanged" => Some(SnapcastNotification::GroupStreamChanged {
            id: params.get("id")?.as_str()?.to_string(),
            stream_id: params.get("stream_id")?.as_str()?.to_string(),
        }),
        "Group.OnMute" => Some(SnapcastNotification::GroupMuteChanged {
            id: params.get("id")?.as_str()?.to_string(),
            mute: params.get("mute")?.as_bool()?,
        }),
        "Server.OnUpdate" => serde_json::from_value(params.get("server")?.clone())
            .ok()
            .map(|status| SnapcastNotification::ServerUpdated { status }),
        "Stream.OnProperties" => {
            let id = params.get("id")?.as_str()?.to_string();
            let props = params.get("properties")?;
            let position_ms = props
                .get("position")
                .and_then(|p| p.as_f64())
                .map(|secs| (secs * 1000.0) as u64);
            let playing = props
                .get("playbackStatus")
                .and_then(|s| s.as_str())
                .map(|s| s == "playing");
            Some(SnapcastNotification::StreamProperties {
                id,
                position_ms,
                playing,
            })
        }
        _ => None,
    }
}

// =============================================================================
// Adapter
// =============================================================================

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

pub struct SnapcastAdapter {
    config: SnapcastConfig,
    connected: AtomicBool,
    connected_tx: watch::Sender<bool>,
    next_id: AtomicU64,
    pending: PendingMap,
    /// Cancelling this resets the live connection (armed per connection)
    conn_abort: Mutex<Option<CancellationToken>>,
    write_tx: Mutex<Option<mpsc::Sender<String>>>,
    events: mpsc::Sender<SnapcastEvent>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl SnapcastAdapter {
    /// Create the adapter and the receiving end of its event stream.
    pub fn new(
        config: SnapcastConfig,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<SnapcastEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (connected_tx, _) = watch::channel(false);
        let adapter = Arc::new(Self {
            config,
            connected: AtomicBool::new(false),
            connected_tx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            conn_abort: Mutex::new(None),
            write_tx: Mutex::new(None),
            events,
            stats,
            shutdown,
        });
        (adapter, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Observe connectivity transitions (drives `SystemStatusChanged`).
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Minimum connection lifetime that resets the reconnect backoff.
    const STABLE_RUN: Duration = Duration::from_secs(30);

    /// Run the connection loop until shutdown. Spawned once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let started = tokio::time::Instant::now();
            match self.connect_and_serve().await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    bump(&self.stats.counters.snapcast_reconnects);
                    if started.elapsed() >= Self::STABLE_RUN {
                        attempt = 0;
                    }
                    let delay = self.config.reconnect.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, ?delay, "snapcast connection lost, reconnecting");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.mark_disconnected().await;
        info!("snapcast adapter stopped");
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!(addr = %addr, "connecting to snapcast");

        let stream = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| Error::unavailable(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::unavailable(format!("connect to {}: {}", addr, e)))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        *self.write_tx.lock().await = Some(write_tx);
        let conn_abort = CancellationToken::new();
        *self.conn_abort.lock().await = Some(conn_abort.clone());

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.connected_tx.send(true);
        self.forward_event(SnapcastEvent::Connected).await;
        info!(addr = %addr, "snapcast connected");

        let result: Result<()> = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),

                // A request timeout resets the connection; replies for a
                // stalled socket are not coming
                _ = conn_abort.cancelled() => {
                    break Err(Error::unavailable("request timed out, resetting connection"));
                }

                outbound = write_rx.recv() => match outbound {
                    Some(line) => {
                        if let Err(e) = write_half.write_all(line.as_bytes()).await {
                            break Err(Error::unavailable(format!("write: {}", e)));
                        }
                    }
                    None => break Err(Error::internal("write queue closed")),
                },

                inbound = reader.next_line() => match inbound {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => break Err(Error::unavailable("snapcast closed the connection")),
                    Err(e) => break Err(Error::unavailable(format!("read: {}", e))),
                },
            }
        };

        self.mark_disconnected().await;
        result
    }

    async fn mark_disconnected(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let _ = self.connected_tx.send(false);
        *self.write_tx.lock().await = None;
        *self.conn_abort.lock().await = None;

        // Close every pending request; callers see Unavailable, not a hang
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::unavailable("snapcast disconnected")));
        }
        drop(pending);

        if was_connected {
            self.forward_event(SnapcastEvent::Disconnected).await;
        }
    }

    async fn forward_event(&self, event: SnapcastEvent) {
        if self.events.try_send(event).is_err() {
            bump(&self.stats.counters.commands_dropped);
            warn!("snapcast event queue full, dropping event");
        }
    }

    async fn handle_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable line from snapcast");
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            // Reply to one of our requests
            let sender = self.pending.lock().await.remove(&id);
            let Some(sender) = sender else {
                debug!(id, "reply for unknown request id");
                return;
            };
            let outcome = if let Some(err) = value.get("error") {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown");
                Err(Error::external(format!("snapcast: {}", message)))
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = sender.send(outcome);
        } else if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            match parse_notification(method, &params) {
                Some(n) => {
                    self.forward_event(SnapcastEvent::Notification(n)).await;
                }
                None => debug!(method, "ignoring snapcast notification"),
            }
        }
    }

    /// Issue one JSON-RPC request and await the matched reply.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::unavailable("snapcast is not connected"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut payload = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
        });
        if !params.is_null() {
            payload["params"] = params;
        }
        let line = format!("{}\n", payload);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let write_tx = self.write_tx.lock().await.clone();
        let Some(write_tx) = write_tx else {
            self.pending.lock().await.remove(&id);
            return Err(Error::unavailable("snapcast is not connected"));
        };
        if write_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::unavailable("snapcast is not connected"));
        }

        match tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::unavailable("snapcast disconnected")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                // The socket is presumed wedged; reconnect
                if let Some(abort) = self.conn_abort.lock().await.as_ref() {
                    abort.cancel();
                }
                Err(Error::timeout(format!("snapcast request {} timed out", method)))
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn get_server_status(&self) -> Result<ServerStatus> {
        let result = self.request("Server.GetStatus", Value::Null).await?;
        let server = result
            .get("server")
            .cloned()
            .ok_or_else(|| Error::external("Server.GetStatus reply missing server"))?;
        Ok(serde_json::from_value(server)?)
    }

    pub async fn set_client_volume(&self, id: &str, percent: u8, muted: bool) -> Result<()> {
        self.request(
            "Client.SetVolume",
            json!({ "id": id, "volume": { "muted": muted, "percent": percent } }),
        )
        .await?;
        Ok(())
    }

    /// Mute toggles the flag only; Snapcast keeps the percent, so the
    /// pre-mute level survives in the server as well as in our state.
    pub async fn set_client_mute(&self, id: &str, percent: u8, muted: bool) -> Result<()> {
        self.set_client_volume(id, percent, muted).await
    }

    pub async fn set_client_latency(&self, id: &str, latency_ms: u16) -> Result<()> {
        self.request(
            "Client.SetLatency",
            json!({ "id": id, "latency": latency_ms }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_client_name(&self, id: &str, name: &str) -> Result<()> {
        self.request("Client.SetName", json!({ "id": id, "name": name }))
            .await?;
        Ok(())
    }

    /// Control a stream's source process (play, pause, next, previous,
    /// stop). Best-effort: not every stream type is controllable.
    pub async fn stream_control(&self, stream_id: &str, command: &str) -> Result<()> {
        self.request(
            "Stream.Control",
            json!({ "id": stream_id, "command": command }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_group_stream(&self, group_id: &str, stream_id: &str) -> Result<()> {
        self.request(
            "Group.SetStream",
            json!({ "id": group_id, "stream_id": stream_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_group_clients(&self, group_id: &str, client_ids: &[String]) -> Result<()> {
        self.request(
            "Group.SetClients",
            json!({ "id": group_id, "clients": client_ids }),
        )
        .await?;
        Ok(())
    }

    /// Move one client into the given group, preserving the group's other
    /// members. Snapcast has no Client.SetGroup; membership is edited
    /// through Group.SetClients.
    pub async fn set_client_group(&self, client_id: &str, group_id: &str) -> Result<()> {
        let status = self.get_server_status().await?;
        let group = status
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .ok_or_else(|| Error::not_found(format!("snapcast group {}", group_id)))?;

        if group.clients.iter().any(|c| c.id == client_id) {
            return Ok(());
        }

        let mut members: Vec<String> = group.clients.iter().map(|c| c.id.clone()).collect();
        members.push(client_id.to_string());
        self.set_group_clients(group_id, &members).await
    }

    /// Isolate a client into its own group and return the new group's id.
    /// Snapcast creates groups implicitly: shrinking the old group to exclude
    /// the client leaves the client in a fresh single-member group.
    pub async fn create_group(&self, seed_client_id: &str) -> Result<String> {
        let status = self.get_server_status().await?;
        let (group, _) = status
            .find_client(seed_client_id)
            .ok_or_else(|| Error::not_found(format!("snapcast client {}", seed_client_id)))?;

        if group.clients.len() == 1 {
            // Already alone in a group
            return Ok(group.id.clone());
        }

        let remaining: Vec<String> = group
            .clients
            .iter()
            .filter(|c| c.id != seed_client_id)
            .map(|c| c.id.clone())
            .collect();
        self.set_group_clients(&group.id, &remaining).await?;

        // The server re-homes the evicted client into a new group
        let status = self.get_server_status().await?;
        let (group, _) = status
            .find_client(seed_client_id)
            .ok_or_else(|| Error::external("client vanished after regroup"))?;
        Ok(group.id.clone())
    }

    /// Dissolve a group by emptying it; Snapcast garbage-collects empty
    /// groups.
    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.set_group_clients(group_id, &[]).await
    }
}
