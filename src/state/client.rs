//! Client state: a Snapcast endpoint bound by default to a zone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::events::Notification;

/// Authoritative state of one client. `snapcast_id` and `connected` are
/// populated when Snapcast reports the client and cleared on disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    /// 1-based, stable, from configuration order
    pub index: usize,
    pub name: String,
    /// Lower-case, colon-separated
    pub mac: String,
    /// Opaque id assigned by Snapcast, known once the client connects
    pub snapcast_id: Option<String>,
    pub default_zone: usize,
    /// May differ from `default_zone` transiently during reconciliation
    pub current_zone: Option<usize>,
    pub connected: bool,
    pub volume: u8,
    pub mute: bool,
    /// Volume level to restore on unmute
    pub volume_before_mute: Option<u8>,
    pub latency_ms: u16,
    pub last_mutated: DateTime<Utc>,
}

impl ClientState {
    pub fn from_config(index: usize, config: &crate::config::ClientConfig) -> Self {
        Self {
            index,
            name: config.name.clone(),
            mac: config.mac.clone(),
            snapcast_id: None,
            default_zone: config.default_zone,
            current_zone: None,
            connected: false,
            volume: 50,
            mute: false,
            volume_before_mute: None,
            latency_ms: 0,
        last_mutated: Utc::now(),
        }
    }

    /// Zone this client should belong to: the explicit assignment, falling
    /// back to the configured default.
    pub fn desired_zone(&self) -> usize {
        self.current_zone.unwrap_or(self.default_zone)
    }
}

/// Field-wise diff, one notification per changed field in declaration order,
/// plus the composite `ClientStateChanged`.
pub fn diff(old: &ClientState, new: &ClientState) -> Vec<Notification> {
    let mut out = Vec::new();
    let client = new.index;

    if old.connected != new.connected {
        out.push(Notification::ClientConnectedChanged {
            client,
            connected: new.connected,
        });
    }
    if old.volume != new.volume {
        out.push(Notification::ClientVolumeChanged {
            client,
            volume: new.volume,
        });
    }
    if old.mute != new.mute {
        out.push(Notification::ClientMuteChanged {
            client,
            mute: new.mute,
        });
    }
    if old.latency_ms != new.latency_ms {
        out.push(Notification::ClientLatencyChanged {
            client,
            latency_ms: new.latency_ms,
        });
    }
    if old.desired_zone() != new.desired_zone() {
        out.push(Notification::ClientZoneAssignmentChanged {
            client,
            previous: old.desired_zone(),
            next: new.desired_zone(),
        });
    }

    if !out.is_empty() {
        out.push(Notification::ClientStateChanged {
            old: Box::new(old.clone()),
            new: Box::new(new.clone()),
        });
    }

    out
}
