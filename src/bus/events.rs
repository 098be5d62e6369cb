//! Typed notifications published on the mediator bus.
//!
//! A notification describes a state change that already happened. Delivery
//! is fan-out to every subscriber; the envelope records which surface
//! originated the change so integration publishers can suppress echo back to
//! that surface.

use serde::{Deserialize, Serialize};

use crate::bus::commands::CommandSource;
use crate::state::client::ClientState;
use crate::state::zone::{PlaybackState, PlaylistInfo, TrackInfo, ZoneState};

/// All state-change notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[allow(clippy::large_enum_variant)] // composites intentionally carry full snapshots
pub enum Notification {
    // =========================================================================
    // Zone field notifications (diff order = declaration order)
    // =========================================================================
    ZoneClientsChanged {
        zone: usize,
        clients: Vec<usize>,
    },
    ZonePlaybackStateChanged {
        zone: usize,
        state: PlaybackState,
    },
    ZoneVolumeChanged {
        zone: usize,
        volume: u8,
    },
    ZoneMuteChanged {
        zone: usize,
        mute: bool,
    },
    ZoneTrackRepeatChanged {
        zone: usize,
        enabled: bool,
    },
    ZonePlaylistRepeatChanged {
        zone: usize,
        enabled: bool,
    },
    ZoneShuffleChanged {
        zone: usize,
        enabled: bool,
    },
    ZonePlaylistChanged {
        zone: usize,
        playlist: Option<PlaylistInfo>,
    },
    ZoneTrackChanged {
        zone: usize,
        track: Option<TrackInfo>,
    },
    /// Rate-limited position updates (>= 500 ms delta or playback transition)
    ZonePositionChanged {
        zone: usize,
        position_ms: u64,
    },
    /// Composite: both snapshots, for consumers preferring coarse updates
    ZoneStateChanged {
        old: Box<ZoneState>,
        new: Box<ZoneState>,
    },

    // =========================================================================
    // Client field notifications
    // =========================================================================
    ClientConnectedChanged {
        client: usize,
        connected: bool,
    },
    ClientVolumeChanged {
        client: usize,
        volume: u8,
    },
    ClientMuteChanged {
        client: usize,
        mute: bool,
    },
    ClientLatencyChanged {
        client: usize,
        latency_ms: u16,
    },
    ClientZoneAssignmentChanged {
        client: usize,
        previous: usize,
        next: usize,
    },
    ClientStateChanged {
        old: Box<ClientState>,
        new: Box<ClientState>,
    },

    // =========================================================================
    // System notifications
    // =========================================================================
    SystemStatusChanged {
        status: SystemStatus,
    },
}

impl Notification {
    /// Event type identifier for logging and metrics.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ZoneClientsChanged { .. } => "zone_clients_changed",
            Self::ZonePlaybackStateChanged { .. } => "zone_playback_state_changed",
            Self::ZoneVolumeChanged { .. } => "zone_volume_changed",
            Self::ZoneMuteChanged { .. } => "zone_mute_changed",
            Self::ZoneTrackRepeatChanged { .. } => "zone_track_repeat_changed",
            Self::ZonePlaylistRepeatChanged { .. } => "zone_playlist_repeat_changed",
            Self::ZoneShuffleChanged { .. } => "zone_shuffle_changed",
            Self::ZonePlaylistChanged { .. } => "zone_playlist_changed",
            Self::ZoneTrackChanged { .. } => "zone_track_changed",
            Self::ZonePositionChanged { .. } => "zone_position_changed",
            Self::ZoneStateChanged { .. } => "zone_state_changed",
            Self::ClientConnectedChanged { .. } => "client_connected_changed",
            Self::ClientVolumeChanged { .. } => "client_volume_changed",
            Self::ClientMuteChanged { .. } => "client_mute_changed",
            Self::ClientLatencyChanged { .. } => "client_latency_changed",
            Self::ClientZoneAssignmentChanged { .. } => "client_zone_assignment_changed",
            Self::ClientStateChanged { .. } => "client_state_changed",
            Self::SystemStatusChanged { .. } => "system_status_changed",
        }
    }

    /// Zone index this notification concerns, if any.
    pub fn zone(&self) -> Option<usize> {
        match self {
            Self::ZoneClientsChanged { zone, .. }
            | Self::ZonePlaybackStateChanged { zone, .. }
            | Self::ZoneVolumeChanged { zone, .. }
            | Self::ZoneMuteChanged { zone, .. }
            | Self::ZoneTrackRepeatChanged { zone, .. }
            | Self::ZonePlaylistRepeatChanged { zone, .. }
            | Self::ZoneShuffleChanged { zone, .. }
            | Self::ZonePlaylistChanged { zone, .. }
            | Self::ZoneTrackChanged { zone, .. }
            | Self::ZonePositionChanged { zone, .. } => Some(*zone),
            Self::ZoneStateChanged { new, .. } => Some(new.index),
            _ => None,
        }
    }

    /// Client index this notification concerns, if any.
    pub fn client(&self) -> Option<usize> {
        match self {
            Self::ClientConnectedChanged { client, .. }
            | Self::ClientVolumeChanged { client, .. }
            | Self::ClientMuteChanged { client, .. }
            | Self::ClientLatencyChanged { client, .. }
            | Self::ClientZoneAssignmentChanged { client, .. } => Some(*client),
            Self::ClientStateChanged { new, .. } => Some(new.index),
            _ => None,
        }
    }
}

/// System-level status snapshot carried by `SystemStatusChanged` and served
/// on `/api/v1/system/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub snapcast_connected: bool,
    pub mqtt_connected: bool,
    pub knx_connected: bool,
    pub subsonic_configured: bool,
}

/// A notification plus the surface that originated the underlying change.
/// Fan-out is unconditional; origin exists solely for echo suppression in
/// the integration publishers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub origin: CommandSource,
    pub notification: Notification,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_entity_accessors() {
        let n = Notification::ZoneVolumeChanged { zone: 3, volume: 60 };
        assert_eq!(n.event_type(), "zone_volume_changed");
        assert_eq!(n.zone(), Some(3));
        assert_eq!(n.client(), None);

        let n = Notification::ClientMuteChanged {
            client: 2,
            mute: true,
        };
        assert_eq!(n.client(), Some(2));
        assert_eq!(n.zone(), None);
    }

    #[test]
    fn test_envelope_serializes() {
        let envelope = NotificationEnvelope {
            origin: CommandSource::Mqtt,
            notification: Notification::ZoneMuteChanged {
                zone: 1,
                mute: true,
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("ZoneMuteChanged"));
        assert!(json.contains("mqtt"));
    }
}
