//! Configuration management
//!
//! Loads an immutable, validated configuration record at startup: zones,
//! clients, service endpoints (Snapcast, MQTT, KNX, Subsonic), resilience
//! policies, and the per-entity MQTT topic / KNX group-address maps.
//!
//! Sources, in priority order: built-in defaults, a `snapdog` config file in
//! the config directory (toml/json/yaml), then `SNAPDOG_`-prefixed
//! environment variables with `__` as section separator
//! (e.g. `SNAPDOG_SERVICES__MQTT__HOST`).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::knx::addr::GroupAddress;
use crate::error::{Error, Result};

/// Top-level configuration record. Immutable after [`load_config`].
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,

    pub services: ServicesConfig,

    pub zones: Vec<ZoneConfig>,

    pub clients: Vec<ClientConfig>,

    /// Directories that must exist and be writable at startup
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    5000
}

#[derive(Debug, Deserialize)]
pub struct ServicesConfig {
    pub snapcast: SnapcastConfig,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    #[serde(default)]
    pub knx: Option<KnxConfig>,

    #[serde(default)]
    pub subsonic: Option<SubsonicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapcastConfig {
    pub host: String,

    #[serde(default = "default_snapcast_port")]
    pub port: u16,

    /// Per-call timeout for JSON-RPC requests
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Supervised deployments (snapserver launched next to this process)
    /// require the port to be free at startup; a conflict is fatal.
    #[serde(default)]
    pub expect_free_port: bool,

    #[serde(default)]
    pub reconnect: BackoffPolicy,
}

fn default_snapcast_port() -> u16 {
    1705
}

fn default_timeout_secs() -> u64 {
    5
}

/// Exponential backoff policy shared by adapters and the startup validator.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Jitter fraction applied symmetrically (0.25 = +/-25%)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,

    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            factor: default_backoff_factor(),
            jitter: default_backoff_jitter(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.25
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl BackoffPolicy {
    /// Delay for the given attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_ms as f64 * self.factor.powi(attempt as i32);
        let capped = base.min(self.cap_ms as f64);
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped - spread + rand::random::<f64>() * 2.0 * spread
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Supervised deployments (broker launched next to this process)
    /// require the port to be free at startup; a conflict is fatal.
    #[serde(default)]
    pub expect_free_port: bool,

    /// Base topic for system-level status (`{base}/status` carries the LWT)
    #[serde(default = "default_mqtt_system_topic")]
    pub system_base_topic: String,

    /// Bound on the retained-status outbound queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "snapdog".to_string()
}

fn default_mqtt_system_topic() -> String {
    "snapdog/system".to_string()
}

fn default_outbound_queue() -> usize {
    1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnxConnectionType {
    /// KNXnet/IP tunneling to a gateway (host:port)
    Tunnel,
    /// KNXnet/IP routing via multicast
    Routing,
    /// Attached USB interface (accepted by the model, rejected at startup)
    Usb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnxConfig {
    pub connection: KnxConnectionType,

    /// Gateway host for tunneling; multicast group for routing.
    /// DNS names are resolved at connect time.
    #[serde(default = "default_knx_host")]
    pub host: String,

    #[serde(default = "default_knx_port")]
    pub port: u16,

    /// Auto-reconnect timer armed on connect failure
    #[serde(default = "default_knx_reconnect_secs")]
    pub reconnect_secs: u64,

    /// Bound on the outbound telegram queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_knx_host() -> String {
    // Standard KNXnet/IP routing multicast group
    "224.0.23.12".to_string()
}

fn default_knx_port() -> u16 {
    3671
}

fn default_knx_reconnect_secs() -> u64 {
    30
}

/// Transcoding formats for Subsonic stream URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeFormat {
    #[default]
    Disabled,
    Mp3,
    Opus,
    Ogg,
    Aac,
    Flac,
}

impl TranscodeFormat {
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            Self::Disabled => None,
            Self::Mp3 => Some("mp3"),
            Self::Opus => Some("opus"),
            Self::Ogg => Some("ogg"),
            Self::Aac => Some("aac"),
            Self::Flac => Some("flac"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubsonicConfig {
    /// Base URL, e.g. `http://music.local:4533`
    pub url: String,

    pub username: String,

    pub password: String,

    #[serde(default = "default_subsonic_client")]
    pub client_name: String,

    #[serde(default)]
    pub transcode: TranscodeFormat,

    /// Max bitrate in kbps; only sent when transcoding is enabled
    #[serde(default)]
    pub max_bitrate: Option<u32>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: BackoffPolicy,

    /// Retry attempts per operation
    #[serde(default = "default_subsonic_retries")]
    pub retries: u32,
}

fn default_subsonic_client() -> String {
    "snapdog".to_string()
}

fn default_subsonic_retries() -> u32 {
    3
}

// =============================================================================
// Zone / client entries
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,

    /// Named pipe the Snapcast group for this zone streams from
    pub sink: String,

    #[serde(default)]
    pub mqtt: Option<EntityMqttConfig>,

    #[serde(default)]
    pub knx: Option<ZoneKnxConfig>,

    /// Icon URL exposed on /api/v1/icons
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub name: String,

    /// Lower-case, colon-separated hardware address
    pub mac: String,

    /// 1-based index into `zones`
    pub default_zone: usize,

    #[serde(default)]
    pub mqtt: Option<EntityMqttConfig>,

    #[serde(default)]
    pub knx: Option<ClientKnxConfig>,

    #[serde(default)]
    pub icon: Option<String>,
}

/// MQTT topic block shared by zones and clients. Command topics hang off
/// `{base_topic}/cmd/...`; status topics are published retained directly
/// under `{base_topic}/...`.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityMqttConfig {
    pub base_topic: String,
}

/// KNX group addresses for one zone. Every field is optional; unmapped
/// operations are simply not exposed on the bus.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneKnxConfig {
    pub play: Option<GroupAddress>,
    pub pause: Option<GroupAddress>,
    pub stop: Option<GroupAddress>,
    pub next: Option<GroupAddress>,
    pub previous: Option<GroupAddress>,
    pub volume: Option<GroupAddress>,
    pub volume_status: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub mute_status: Option<GroupAddress>,
    pub track: Option<GroupAddress>,
    pub track_status: Option<GroupAddress>,
    pub playlist: Option<GroupAddress>,
    pub playlist_status: Option<GroupAddress>,
    pub repeat_track: Option<GroupAddress>,
    pub repeat_playlist: Option<GroupAddress>,
    pub shuffle: Option<GroupAddress>,
    pub playback_status: Option<GroupAddress>,
}

/// KNX group addresses for one client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientKnxConfig {
    pub volume: Option<GroupAddress>,
    pub volume_status: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub mute_status: Option<GroupAddress>,
    pub zone: Option<GroupAddress>,
    pub zone_status: Option<GroupAddress>,
    pub connected_status: Option<GroupAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Steady-state reconciliation interval
    #[serde(default = "default_reconcile_secs")]
    pub interval_secs: u64,

    /// Bound on a single reconciliation pass
    #[serde(default = "default_reconcile_budget_secs")]
    pub budget_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_secs(),
            budget_secs: default_reconcile_budget_secs(),
        }
    }
}

fn default_reconcile_secs() -> u64 {
    30
}

fn default_reconcile_budget_secs() -> u64 {
    20
}

// =============================================================================
// Loading & validation
// =============================================================================

/// Get config directory (SNAPDOG_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SNAPDOG_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("snapdog");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/snapdog");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/snapdog");
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<AppConfig> {
    let config_dir = get_config_dir();

    let raw = ::config::Config::builder()
        .add_source(
            ::config::File::with_name(&config_dir.join("snapdog").to_string_lossy())
                .required(false),
        )
        .add_source(::config::File::with_name("snapdog").required(false))
        .add_source(
            ::config::Environment::with_prefix("SNAPDOG")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| Error::invalid(format!("config: {}", e)))?;

    let config: AppConfig = raw
        .try_deserialize()
        .map_err(|e| Error::invalid(format!("config: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts.iter().all(|p| {
            p.len() == 2
                && p.chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}

/// Validate cross-entity invariants. Called once at load; the record is
/// immutable afterwards.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.zones.is_empty() {
        return Err(Error::invalid("at least one zone must be configured"));
    }

    for (i, zone) in config.zones.iter().enumerate() {
        if zone.name.trim().is_empty() {
            return Err(Error::invalid(format!("zone {}: empty name", i + 1)));
        }
        if zone.sink.trim().is_empty() {
            return Err(Error::invalid(format!(
                "zone {} ({}): empty sink path",
                i + 1,
                zone.name
            )));
        }
    }

    let mut seen_macs = std::collections::HashSet::new();
    for (i, client) in config.clients.iter().enumerate() {
        if !valid_mac(&client.mac) {
            return Err(Error::invalid(format!(
                "client {} ({}): MAC must be lower-case colon-separated, got {:?}",
                i + 1,
                client.name,
                client.mac
            )));
        }
        if !seen_macs.insert(client.mac.clone()) {
            return Err(Error::invalid(format!(
                "client {} ({}): duplicate MAC {}",
                i + 1,
                client.name,
                client.mac
            )));
        }
        if client.default_zone == 0 || client.default_zone > config.zones.len() {
            return Err(Error::invalid(format!(
                "client {} ({}): default_zone {} out of range 1..={}",
                i + 1,
                client.name,
                client.default_zone,
                config.zones.len()
            )));
        }
    }

    // Duplicate sinks would collapse two zones onto one Snapcast group
    let mut seen_sinks = std::collections::HashSet::new();
    for zone in &config.zones {
        if !seen_sinks.insert(zone.sink.as_str()) {
            return Err(Error::invalid(format!(
                "duplicate sink path {:?} across zones",
                zone.sink
            )));
        }
    }

    if let Some(knx) = &config.services.knx {
        if knx.connection == KnxConnectionType::Usb {
            return Err(Error::invalid(
                "KNX USB interface mode is not supported; use tunnel or routing",
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Startup logging with masking
// =============================================================================

/// Mask a value when its key looks sensitive (`*PASSWORD*`, `*SECRET*`,
/// `*TOKEN*`).
pub fn mask_sensitive(key: &str, value: &str) -> String {
    let upper = key.to_uppercase();
    if upper.contains("PASSWORD") || upper.contains("SECRET") || upper.contains("TOKEN") {
        "*****".to_string()
    } else {
        value.to_string()
    }
}

/// Log the effective configuration at startup, masking credentials.
pub fn log_config(config: &AppConfig) {
    tracing::info!(port = config.api.port, "api");
    tracing::info!(
        host = %config.services.snapcast.host,
        port = config.services.snapcast.port,
        "snapcast"
    );
    if let Some(mqtt) = &config.services.mqtt {
        tracing::info!(
            host = %mqtt.host,
            port = mqtt.port,
            username = %mqtt.username.as_deref().unwrap_or("<none>"),
            password = %mask_sensitive("password", mqtt.password.as_deref().unwrap_or("<none>")),
            "mqtt"
        );
    }
    if let Some(knx) = &config.services.knx {
        tracing::info!(connection = ?knx.connection, host = %knx.host, port = knx.port, "knx");
    }
    if let Some(sub) = &config.services.subsonic {
        tracing::info!(
            url = %sub.url,
            username = %sub.username,
            password = %mask_sensitive("password", &sub.password),
            "subsonic"
        );
    }
    tracing::info!(
        zones = config.zones.len(),
        clients = config.clients.len(),
        "entities"
    );
}
