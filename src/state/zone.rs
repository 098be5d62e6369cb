//! Zone state: a logical room backed by one Snapcast group.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::events::Notification;

/// Position deltas below this threshold do not emit `ZonePositionChanged`.
pub const POSITION_EMIT_THRESHOLD_MS: u64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Immutable playlist metadata mirrored from the music library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfo {
    /// 1-based index into the library's playlist catalogue
    pub index: usize,
    pub id: String,
    pub name: String,
    pub track_count: usize,
}

/// Track metadata; `position_ms` is the only field refreshed in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// 1-based index within the current playlist
    pub index: usize,
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: Option<u64>,
    pub position_ms: u64,
    pub cover_id: Option<String>,
}

impl TrackInfo {
    /// Track equality for diffing ignores playback position.
    pub fn same_track(&self, other: &TrackInfo) -> bool {
        self.index == other.index
            && self.id == other.id
            && self.title == other.title
            && self.artist == other.artist
            && self.album == other.album
            && self.duration_ms == other.duration_ms
            && self.cover_id == other.cover_id
    }
}

/// Authoritative state of one zone. Snapshots handed to callers are value
/// copies; only the store mutates the live record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    /// 1-based, stable, from configuration order
    pub index: usize,
    pub name: String,
    /// Named pipe the zone's Snapcast group streams from
    pub sink: String,
    /// Client indices currently assigned to this zone
    pub clients: BTreeSet<usize>,
    pub playback: PlaybackState,
    pub volume: u8,
    pub mute: bool,
    pub track_repeat: bool,
    pub playlist_repeat: bool,
    pub shuffle: bool,
    pub playlist: Option<PlaylistInfo>,
    pub track: Option<TrackInfo>,
    pub last_mutated: DateTime<Utc>,
}

impl ZoneState {
    pub fn from_config(index: usize, config: &crate::config::ZoneConfig) -> Self {
        Self {
            index,
            name: config.name.clone(),
            sink: config.sink.clone(),
            clients: BTreeSet::new(),
            playback: PlaybackState::Stopped,
            volume: 50,
            mute: false,
            track_repeat: false,
            playlist_repeat: false,
            shuffle: false,
            playlist: None,
            track: None,
            last_mutated: Utc::now(),
        }
    }
}

/// Field-wise diff between two zone snapshots, one notification per changed
/// field in declaration order, plus the composite `ZoneStateChanged` when
/// anything changed at all.
pub fn diff(old: &ZoneState, new: &ZoneState) -> Vec<Notification> {
    let mut out = Vec::new();
    let zone = new.index;

    if old.clients != new.clients {
        out.push(Notification::ZoneClientsChanged {
            zone,
            clients: new.clients.iter().copied().collect(),
        });
    }
    if old.playback != new.playback {
        out.push(Notification::ZonePlaybackStateChanged {
            zone,
            state: new.playback,
        });
    }
    if old.volume != new.volume {
        out.push(Notification::ZoneVolumeChanged {
            zone,
            volume: new.volume,
        });
    }
    if old.mute != new.mute {
        out.push(Notification::ZoneMuteChanged {
            zone,
            mute: new.mute,
        });
    }
    if old.track_repeat != new.track_repeat {
        out.push(Notification::ZoneTrackRepeatChanged {
            zone,
            enabled: new.track_repeat,
        });
    }
    if old.playlist_repeat != new.playlist_repeat {
        out.push(Notification::ZonePlaylistRepeatChanged {
            zone,
            enabled: new.playlist_repeat,
        });
    }
    if old.shuffle != new.shuffle {
        out.push(Notification::ZoneShuffleChanged {
            zone,
            enabled: new.shuffle,
        });
    }
    if old.playlist != new.playlist {
        out.push(Notification::ZonePlaylistChanged {
            zone,
            playlist: new.playlist.clone(),
        });
    }

    let track_changed = match (&old.track, &new.track) {
        (None, None) => false,
        (Some(a), Some(b)) => !a.same_track(b),
        _ => true,
    };
    if track_changed {
        out.push(Notification::ZoneTrackChanged {
            zone,
            track: new.track.clone(),
        });
    }

    // Position updates are rate-limited: a dedicated notification when the
    // delta crosses the threshold or playback transitioned.
    if let (Some(a), Some(b)) = (&old.track, &new.track) {
        if a.same_track(b) && a.position_ms != b.position_ms {
            let delta = b.position_ms.abs_diff(a.position_ms);
            if delta >= POSITION_EMIT_THRESHOLD_MS || old.playback != new.playback {
                out.push(Notification::ZonePositionChanged {
                    zone,
                    position_ms: b.position_ms,
                });
            }
        }
    }

    if !out.is_empty() {
        out.push(Notification::ZoneStateChanged {
            old: Box::new(old.clone()),
            new: Box::new(new.clone()),
        });
    }

    out
}
