//! Subsonic music library client
//!
//! Thin REST client for the playlist catalogue, stream URL synthesis, and
//! cover art. Every call runs under an operation-level resilience policy
//! (bounded retries with jittered backoff, per-request timeout).

use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SubsonicConfig;
use crate::error::{Error, Result};
use crate::state::zone::{PlaylistInfo, TrackInfo};

const API_VERSION: &str = "1.16.1";

/// Cover art bytes plus the sniffed content type.
#[derive(Debug, Clone)]
pub struct CoverArt {
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

/// Sniff image content type from magic bytes. JPEG and PNG are what
/// Subsonic servers actually serve; anything else is reported as JPEG.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, 0x50, 0x4e, 0x47]) {
        "image/png"
    } else if data.starts_with(&[0xff, 0xd8]) {
        "image/jpeg"
    } else {
        "image/jpeg"
    }
}

pub struct SubsonicAdapter {
    config: SubsonicConfig,
    http: Client,
}

/// Shared adapter handle.
pub type SharedSubsonic = Arc<SubsonicAdapter>;

impl SubsonicAdapter {
    pub fn new(config: SubsonicConfig) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::external(format!("http client: {}", e)))?;
        Ok(Arc::new(Self { config, http }))
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn auth_query(&self) -> String {
        format!(
            "u={}&p={}&v={}&c={}&f=json",
            urlencoding::encode(&self.config.username),
            urlencoding::encode(&self.config.password),
            API_VERSION,
            urlencoding::encode(&self.config.client_name),
        )
    }

    fn api_url(&self, method: &str, params: &[(&str, String)]) -> String {
        let mut url = format!(
            "{}/rest/{}?{}",
            self.base_url(),
            method,
            self.auth_query()
        );
        for (key, value) in params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    /// Synthesize the stream URL a Snapcast source process consumes.
    /// Transcoding parameters appear only when configured.
    pub fn stream_url(&self, track_id: &str) -> String {
        let mut url = format!(
            "{}/rest/stream?id={}&{}",
            self.base_url(),
            urlencoding::encode(track_id),
            self.auth_query(),
        );
        if let Some(format) = self.config.transcode.as_param() {
            url.push_str("&format=");
            url.push_str(format);
            if let Some(kbps) = self.config.max_bitrate {
                url.push_str(&format!("&maxBitRate={}", kbps));
            }
        }
        url
    }

    /// Execute one API call under the retry policy.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = self.api_url(method, params);
        let mut last_err = Error::internal("retry loop did not run");

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                let delay = self.config.retry.delay(attempt - 1);
                debug!(method, attempt, ?delay, "subsonic retry");
                tokio::time::sleep(delay).await;
            }
            match self.call_once(&url, method).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(method, attempt, error = %e, "subsonic call failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn call_once(&self, url: &str, method: &str) -> Result<Value> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "subsonic {} returned HTTP {}",
                method,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        let envelope = body
            .get("subsonic-response")
            .ok_or_else(|| Error::external("missing subsonic-response envelope"))?;
        let status = envelope
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status != "ok" {
            let message = envelope
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("subsonic returned an error");
            return Err(Error::external(format!("subsonic {}: {}", method, message)));
        }
        Ok(envelope.clone())
    }

    pub async fn ping(&self) -> Result<()> {
        self.call("ping", &[]).await?;
        Ok(())
    }

    /// Playlist catalogue in server order; indices are 1-based positions.
    pub async fn get_playlists(&self) -> Result<Vec<PlaylistInfo>> {
        let envelope = self.call("getPlaylists", &[]).await?;
        let playlists = envelope
            .get("playlists")
            .and_then(|p| p.get("playlist"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(playlists
            .iter()
            .enumerate()
            .filter_map(|(i, p)| parse_playlist(i + 1, p))
            .collect())
    }

    /// One playlist with its track entries.
    pub async fn get_playlist(&self, id: &str) -> Result<(PlaylistInfo, Vec<TrackInfo>)> {
        let envelope = self
            .call("getPlaylist", &[("id", id.to_string())])
            .await?;
        let playlist = envelope
            .get("playlist")
            .ok_or_else(|| Error::not_found(format!("playlist {}", id)))?;

        // Index within the catalogue is unknown here; the caller that looked
        // the playlist up by index patches it in
        let info = parse_playlist(0, playlist)
            .ok_or_else(|| Error::external("malformed playlist entry"))?;

        let tracks = playlist
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| parse_track(i + 1, e))
            .collect();

        Ok((info, tracks))
    }

    pub async fn get_cover_art(&self, id: &str) -> Result<CoverArt> {
        let url = self.api_url("getCoverArt", &[("id", id.to_string())]);
        let mut last_err = Error::internal("retry loop did not run");

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.delay(attempt - 1)).await;
            }
            match self.fetch_cover(&url).await {
                Ok(art) => return Ok(art),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn fetch_cover(&self, url: &str) -> Result<CoverArt> {
        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("cover art"));
        }
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "getCoverArt returned HTTP {}",
                response.status()
            )));
        }
        // A JSON body here is a Subsonic error envelope, not an image
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let data = response.bytes().await?.to_vec();
        if content_type.contains("json") {
            return Err(Error::not_found("cover art"));
        }
        Ok(CoverArt {
            content_type: sniff_content_type(&data),
            data,
        })
    }
}

fn parse_playlist(index: usize, value: &Value) -> Option<PlaylistInfo> {
    Some(PlaylistInfo {
        index,
        id: value.get("id")?.as_str().map(str::to_string).or_else(|| {
            // Some servers hand out numeric ids
            value.get("id")?.as_i64().map(|n| n.to_string())
        })?,
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unnamed")
            .to_string(),
        track_count: value
            .get("songCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize,
    })
}

fn parse_track(index: usize, value: &Value) -> Option<TrackInfo> {
    Some(TrackInfo {
        index,
        id: value.get("id")?.as_str().map(str::to_string).or_else(|| {
            value.get("id")?.as_i64().map(|n| n.to_string())
        })?,
        title: value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Title")
            .to_string(),
        artist: value
            .get("artist")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Artist")
            .to_string(),
        album: value
            .get("album")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Album")
            .to_string(),
        duration_ms: value
            .get("duration")
            .and_then(Value::as_u64)
            .map(|secs| secs * 1000),
        position_ms: 0,
        cover_id: value
            .get("coverArt")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
