//! Source-tagged commands dispatched through the mediator.
//!
//! Integer parameters arrive as raw `i64` so that validation (or, for
//! Snapcast-originated values, clamping) happens in exactly one place: the
//! handler. External surfaces never pre-clamp.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which surface produced a command. Handlers thread this through to the
/// resulting notifications for echo suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Api,
    Mqtt,
    Knx,
    /// Snapcast server notifications fed back into the loop
    Internal,
}

impl std::fmt::Display for CommandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Mqtt => write!(f, "mqtt"),
            Self::Knx => write!(f, "knx"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Zone-scoped operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZoneOp {
    Play,
    Pause,
    Stop,
    NextTrack,
    PreviousTrack,
    /// Play the given 1-based track index of the current playlist
    PlayTrack { index: i64 },
    /// Load the given 1-based playlist index from the library
    LoadPlaylist { index: i64 },
    SetVolume { volume: i64 },
    SetMute { mute: bool },
    SetTrackRepeat { enabled: bool },
    SetPlaylistRepeat { enabled: bool },
    SetShuffle { enabled: bool },
    /// Snapcast stream properties feeding back: refresh position and, when
    /// reported, the playing flag. Only ever `Source=Internal`.
    SyncPosition {
        position_ms: u64,
        playing: Option<bool>,
    },
}

/// Client-scoped operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientOp {
    SetVolume { volume: i64 },
    SetMute { mute: bool },
    SetLatency { latency_ms: i64 },
    AssignZone { zone: i64 },
    /// Snapcast reported the client (re)connected under the given id
    Connected { snapcast_id: String },
    Disconnected,
}

/// A command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Zone { zone: usize, op: ZoneOp },
    Client { client: usize, op: ClientOp },
}

/// Registry key: one handler per command kind, enumerated at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ZonePlayback,
    ZoneTrackNav,
    ZonePlayTrack,
    ZoneLoadPlaylist,
    ZoneVolume,
    ZoneMute,
    ZoneModeFlags,
    ZoneSyncPosition,
    ClientVolume,
    ClientMute,
    ClientLatency,
    ClientZone,
    ClientPresence,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Zone { op, .. } => match op {
                ZoneOp::Play | ZoneOp::Pause | ZoneOp::Stop => CommandKind::ZonePlayback,
                ZoneOp::NextTrack | ZoneOp::PreviousTrack => CommandKind::ZoneTrackNav,
                ZoneOp::PlayTrack { .. } => CommandKind::ZonePlayTrack,
                ZoneOp::LoadPlaylist { .. } => CommandKind::ZoneLoadPlaylist,
                ZoneOp::SetVolume { .. } => CommandKind::ZoneVolume,
                ZoneOp::SetMute { .. } => CommandKind::ZoneMute,
                ZoneOp::SetTrackRepeat { .. }
                | ZoneOp::SetPlaylistRepeat { .. }
                | ZoneOp::SetShuffle { .. } => CommandKind::ZoneModeFlags,
                ZoneOp::SyncPosition { .. } => CommandKind::ZoneSyncPosition,
            },
            Command::Client { op, .. } => match op {
                ClientOp::SetVolume { .. } => CommandKind::ClientVolume,
                ClientOp::SetMute { .. } => CommandKind::ClientMute,
                ClientOp::SetLatency { .. } => CommandKind::ClientLatency,
                ClientOp::AssignZone { .. } => CommandKind::ClientZone,
                ClientOp::Connected { .. } | ClientOp::Disconnected => {
                    CommandKind::ClientPresence
                }
            },
        }
    }

    /// All kinds that must be registered for the control plane to function.
    pub fn all_kinds() -> &'static [CommandKind] {
        &[
            CommandKind::ZonePlayback,
            CommandKind::ZoneTrackNav,
            CommandKind::ZonePlayTrack,
            CommandKind::ZoneLoadPlaylist,
            CommandKind::ZoneVolume,
            CommandKind::ZoneMute,
            CommandKind::ZoneModeFlags,
            CommandKind::ZoneSyncPosition,
            CommandKind::ClientVolume,
            CommandKind::ClientMute,
            CommandKind::ClientLatency,
            CommandKind::ClientZone,
            CommandKind::ClientPresence,
        ]
    }
}

/// Default command deadline when the caller does not specify one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// A command plus its source tag and deadline.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub source: CommandSource,
    pub command: Command,
    pub deadline: Duration,
}

impl CommandEnvelope {
    pub fn new(source: CommandSource, command: Command) -> Self {
        Self {
            source,
            command,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Reply produced by a command handler.
#[derive(Debug, Clone)]
pub enum CommandReply {
    None,
    Zone(crate::state::zone::ZoneState),
    Client(crate::state::client::ClientState),
}
