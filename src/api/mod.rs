//! HTTP API
//!
//! Thin request validators over the mediator: every endpoint builds a
//! `Source=Api` command or reads a snapshot, and renders the uniform
//! `ApiResponse<T>` envelope. Error kinds map to status codes here and
//! nowhere else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::adapters::snapcast::SnapcastAdapter;
use crate::adapters::subsonic::SharedSubsonic;
use crate::bus::commands::{
    ClientOp, Command, CommandEnvelope, CommandReply, CommandSource, ZoneOp,
};
use crate::bus::events::SystemStatus;
use crate::bus::SharedMediator;
use crate::config::AppConfig;
use crate::error::{Error, ErrorKind};
use crate::grouping::GroupingService;
use crate::orchestrator::StartupState;
use crate::state::SharedStore;
use crate::stats::Stats;

/// Deadline for commands that trigger a synchronous reconciliation.
const ASSIGN_DEADLINE: Duration = Duration::from_secs(30);

// =============================================================================
// Response envelope
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Uniform response shape: `{ success, data?, error? }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable | ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    (
        status_for(error.kind()),
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: error.kind().code().to_string(),
                message: error.message.clone(),
            }),
        }),
    )
}

// =============================================================================
// State
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub mediator: SharedMediator,
    pub snapcast: Arc<SnapcastAdapter>,
    pub subsonic: Option<SharedSubsonic>,
    pub grouping: Arc<GroupingService>,
    pub stats: Arc<Stats>,
    pub startup: watch::Receiver<StartupState>,
    pub started_at: Instant,
    pub mqtt_connected: watch::Receiver<bool>,
    pub knx_connected: watch::Receiver<bool>,
    /// `(zone icons, client icons)` keyed `zone_{i}` / `client_{i}`
    pub icons: Arc<(Vec<Option<String>>, Vec<Option<String>>)>,
}

impl AppState {
    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            version: env!("SNAPDOG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            snapcast_connected: self.snapcast.is_connected(),
            mqtt_connected: *self.mqtt_connected.borrow(),
            knx_connected: *self.knx_connected.borrow(),
            subsonic_configured: self.subsonic.is_some(),
        }
    }

    pub fn icons_from_config(config: &AppConfig) -> Arc<(Vec<Option<String>>, Vec<Option<String>>)> {
        Arc::new((
            config.zones.iter().map(|z| z.icon.clone()).collect(),
            config.clients.iter().map(|c| c.icon.clone()).collect(),
        ))
    }

    async fn send(&self, command: Command) -> crate::error::Result<CommandReply> {
        crate::stats::bump(&self.stats.counters.commands_processed);
        let result = self
            .mediator
            .send(CommandEnvelope::new(CommandSource::Api, command))
            .await;
        if let Err(e) = &result {
            crate::stats::bump(&self.stats.counters.commands_failed);
            self.stats.record_error("api", e);
        }
        result
    }

    async fn send_with_deadline(
        &self,
        command: Command,
        deadline: Duration,
    ) -> crate::error::Result<CommandReply> {
        crate::stats::bump(&self.stats.counters.commands_processed);
        let result = self
            .mediator
            .send(CommandEnvelope::new(CommandSource::Api, command).with_deadline(deadline))
            .await;
        if let Err(e) = &result {
            crate::stats::bump(&self.stats.counters.commands_failed);
            self.stats.record_error("api", e);
        }
        result
    }
}

fn reply_response(reply: CommandReply) -> axum::response::Response {
    match reply {
        CommandReply::Zone(zone) => ApiResponse::ok(zone).into_response(),
        CommandReply::Client(client) => ApiResponse::ok(client).into_response(),
        CommandReply::None => ApiResponse::ok(serde_json::json!(null)).into_response(),
    }
}

// =============================================================================
// System handlers
// =============================================================================

async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.system_status())
}

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    git_sha: &'static str,
}

async fn system_version() -> impl IntoResponse {
    ApiResponse::ok(VersionInfo {
        version: env!("SNAPDOG_VERSION"),
        git_sha: env!("SNAPDOG_GIT_SHA"),
    })
}

async fn system_stats(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.stats.snapshot())
}

async fn system_errors(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.stats.recent_errors())
}

// =============================================================================
// Zone handlers
// =============================================================================

async fn list_zones(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.zones().await)
}

async fn get_zone(State(state): State<AppState>, Path(i): Path<usize>) -> impl IntoResponse {
    match state.store.zone(i).await {
        Ok(zone) => ApiResponse::ok(zone).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_zone_track(
    State(state): State<AppState>,
    Path(i): Path<usize>,
) -> impl IntoResponse {
    match state.store.zone(i).await {
        Ok(zone) => ApiResponse::ok(zone.track).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn list_playlists(State(state): State<AppState>) -> impl IntoResponse {
    let Some(subsonic) = &state.subsonic else {
        return error_response(&Error::unavailable("subsonic is not configured"))
            .into_response();
    };
    match subsonic.get_playlists().await {
        Ok(playlists) => ApiResponse::ok(playlists).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct VolumeBody {
    volume: i64,
}

async fn put_zone_volume(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<VolumeBody>,
) -> impl IntoResponse {
    match state
        .send(Command::Zone {
            zone: i,
            op: ZoneOp::SetVolume {
                volume: body.volume,
            },
        })
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct MuteBody {
    muted: bool,
}

async fn put_zone_mute(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<MuteBody>,
) -> impl IntoResponse {
    match state
        .send(Command::Zone {
            zone: i,
            op: ZoneOp::SetMute { mute: body.muted },
        })
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn post_zone_playback(
    State(state): State<AppState>,
    Path((i, action)): Path<(usize, String)>,
) -> impl IntoResponse {
    let op = match action.as_str() {
        "play" => ZoneOp::Play,
        "pause" => ZoneOp::Pause,
        "stop" => ZoneOp::Stop,
        "next" => ZoneOp::NextTrack,
        "prev" => ZoneOp::PreviousTrack,
        other => {
            return error_response(&Error::not_found(format!("unknown action {:?}", other)))
                .into_response();
        }
    };
    match state.send(Command::Zone { zone: i, op }).await {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct IndexBody {
    index: i64,
}

async fn put_zone_playlist(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<IndexBody>,
) -> impl IntoResponse {
    match state
        .send(Command::Zone {
            zone: i,
            op: ZoneOp::LoadPlaylist { index: body.index },
        })
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

// =============================================================================
// Client handlers
// =============================================================================

async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.clients().await)
}

async fn get_client(State(state): State<AppState>, Path(i): Path<usize>) -> impl IntoResponse {
    match state.store.client(i).await {
        Ok(client) => ApiResponse::ok(client).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn put_client_volume(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<VolumeBody>,
) -> impl IntoResponse {
    match state
        .send(Command::Client {
            client: i,
            op: ClientOp::SetVolume {
                volume: body.volume,
            },
        })
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn put_client_mute(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<MuteBody>,
) -> impl IntoResponse {
    match state
        .send(Command::Client {
            client: i,
            op: ClientOp::SetMute { mute: body.muted },
        })
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneAssignBody {
    zone_index: i64,
}

async fn put_client_zone(
    State(state): State<AppState>,
    Path(i): Path<usize>,
    Json(body): Json<ZoneAssignBody>,
) -> impl IntoResponse {
    match state
        .send_with_deadline(
            Command::Client {
                client: i,
                op: ClientOp::AssignZone {
                    zone: body.zone_index,
                },
            },
            ASSIGN_DEADLINE,
        )
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => error_response(&e).into_response(),
    }
}

// =============================================================================
// Passthrough, cover art, icons, health
// =============================================================================

async fn snapcast_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.snapcast.get_server_status().await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_cover(
    State(state): State<AppState>,
    Path(cover_id): Path<String>,
) -> impl IntoResponse {
    let Some(subsonic) = &state.subsonic else {
        return error_response(&Error::unavailable("subsonic is not configured"))
            .into_response();
    };
    match subsonic.get_cover_art(&cover_id).await {
        Ok(art) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, art.content_type)],
            art.data,
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Serialize)]
struct IconMap {
    zones: std::collections::BTreeMap<String, String>,
    clients: std::collections::BTreeMap<String, String>,
}

async fn get_icons(State(state): State<AppState>) -> impl IntoResponse {
    let (zone_icons, client_icons) = state.icons.as_ref();
    let collect = |icons: &[Option<String>], prefix: &str| {
        icons
            .iter()
            .enumerate()
            .filter_map(|(i, icon)| {
                icon.as_ref()
                    .map(|url| (format!("{}_{}", prefix, i + 1), url.clone()))
            })
            .collect()
    };
    ApiResponse::ok(IconMap {
        zones: collect(zone_icons, "zone"),
        clients: collect(client_icons, "client"),
    })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let running = *state.startup.borrow() == StartupState::Running;
    if running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready =
        *state.startup.borrow() == StartupState::Running && state.snapcast.is_connected();
    if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, "live")
}

// =============================================================================
// Router
// =============================================================================

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // System
        .route("/api/v1/system/status", get(system_status))
        .route("/api/v1/system/version", get(system_version))
        .route("/api/v1/system/stats", get(system_stats))
        .route("/api/v1/system/errors", get(system_errors))
        // Zones
        .route("/api/v1/zones", get(list_zones))
        .route("/api/v1/zones/{i}", get(get_zone))
        .route("/api/v1/zones/{i}/track", get(get_zone_track))
        .route("/api/v1/zones/{i}/volume", put(put_zone_volume))
        .route("/api/v1/zones/{i}/mute", put(put_zone_mute))
        .route("/api/v1/zones/{i}/{action}", post(post_zone_playback))
        .route("/api/v1/zones/{i}/playlist", put(put_zone_playlist))
        // Playlists
        .route("/api/v1/playlists", get(list_playlists))
        // Clients
        .route("/api/v1/clients", get(list_clients))
        .route("/api/v1/clients/{i}", get(get_client))
        .route("/api/v1/clients/{i}/volume", put(put_client_volume))
        .route("/api/v1/clients/{i}/mute", put(put_client_mute))
        .route("/api/v1/clients/{i}/zone", put(put_client_zone))
        // Snapcast passthrough
        .route("/api/v1/snapcast/status", get(snapcast_status))
        // Cover art + icons
        .route("/api/v1/cover/{cover_id}", get(get_cover))
        .route("/api/v1/icons", get(get_icons))
        // Health probes
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
