//! Command handlers
//!
//! Translate mediator commands into state mutations and adapter calls.
//! Validation short-circuits before any side effect; side effects are issued
//! before the local mutation so an unreachable backend fails the command
//! with the state untouched. Values arriving from Snapcast itself
//! (`Source=Internal`) are clamped instead of rejected.

pub mod bridge;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapters::snapcast::SnapcastAdapter;
use crate::adapters::subsonic::SharedSubsonic;
use crate::bus::commands::{
    ClientOp, Command, CommandEnvelope, CommandReply, CommandSource, ZoneOp,
};
use crate::bus::{CommandHandler, NotificationTx};
use crate::error::{Error, ErrorKind, Result};
use crate::grouping::GroupingService;
use crate::state::zone::PlaybackState;
use crate::state::SharedStore;
use crate::stats::Stats;

/// Validate a volume, clamping only for Snapcast-originated values.
fn checked_volume(source: CommandSource, raw: i64) -> Result<u8> {
    if (0..=100).contains(&raw) {
        return Ok(raw as u8);
    }
    if source == CommandSource::Internal {
        let clamped = raw.clamp(0, 100) as u8;
        warn!(raw, clamped, "clamping out-of-range volume from snapcast");
        return Ok(clamped);
    }
    Err(Error::invalid("Volume must be between 0 and 100"))
}

/// Validate a latency, clamping only for Snapcast-originated values.
fn checked_latency(source: CommandSource, raw: i64) -> Result<u16> {
    if (0..=u16::MAX as i64).contains(&raw) {
        return Ok(raw as u16);
    }
    if source == CommandSource::Internal {
        let clamped = raw.clamp(0, u16::MAX as i64) as u16;
        warn!(raw, clamped, "clamping out-of-range latency from snapcast");
        return Ok(clamped);
    }
    Err(Error::invalid("Latency must be between 0 and 65535"))
}

/// A stream-control failure that only means "this stream type is not
/// controllable" must not fail the command; the zone state is still
/// authoritative.
fn tolerate_uncontrollable(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::External => {
            debug!(error = %e, "stream not controllable, continuing");
            Ok(())
        }
        other => other,
    }
}

// =============================================================================
// Zone handler
// =============================================================================

pub struct ZoneHandler {
    store: SharedStore,
    snapcast: Arc<SnapcastAdapter>,
    subsonic: Option<SharedSubsonic>,
    notify: NotificationTx,
}

impl ZoneHandler {
    pub fn new(
        store: SharedStore,
        snapcast: Arc<SnapcastAdapter>,
        subsonic: Option<SharedSubsonic>,
        notify: NotificationTx,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapcast,
            subsonic,
            notify,
        })
    }

    fn subsonic(&self) -> Result<&SharedSubsonic> {
        self.subsonic
            .as_ref()
            .ok_or_else(|| Error::unavailable("subsonic is not configured"))
    }

    /// Push a zone-wide volume/mute to every connected member client.
    async fn push_to_members(
        &self,
        zone_index: usize,
        volume: Option<u8>,
        mute: Option<bool>,
    ) -> Result<()> {
        if !self.snapcast.is_connected() {
            return Err(Error::unavailable("snapcast is not connected"));
        }
        let zone = self.store.zone(zone_index).await?;
        for member in &zone.clients {
            let Ok(client) = self.store.client(*member).await else {
                continue;
            };
            let Some(id) = client.snapcast_id else {
                continue;
            };
            if !client.connected {
                continue;
            }
            let target_volume = volume.unwrap_or(client.volume);
            let target_mute = mute.unwrap_or(client.mute);
            if let Err(e) = self
                .snapcast
                .set_client_volume(&id, target_volume, target_mute)
                .await
            {
                warn!(client = client.index, error = %e, "volume push failed");
            }
        }
        Ok(())
    }

    async fn playback(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        target: PlaybackState,
    ) -> Result<CommandReply> {
        let zone = self.store.zone(zone_index).await?;

        if envelope.source != CommandSource::Internal {
            let command = match target {
                PlaybackState::Playing => "play",
                PlaybackState::Paused => "pause",
                PlaybackState::Stopped => "stop",
            };
            tolerate_uncontrollable(self.snapcast.stream_control(&zone.sink, command).await)?;
        }

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, |z| z.playback = target)
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    /// Resolve the zone's current playlist tracks from the library.
    async fn current_tracks(
        &self,
        zone_index: usize,
    ) -> Result<Vec<crate::state::zone::TrackInfo>> {
        let zone = self.store.zone(zone_index).await?;
        let playlist = zone
            .playlist
            .ok_or_else(|| Error::conflict("no playlist loaded"))?;
        let (_, tracks) = self.subsonic()?.get_playlist(&playlist.id).await?;
        Ok(tracks)
    }

    async fn navigate(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        forward: bool,
    ) -> Result<CommandReply> {
        let zone = self.store.zone(zone_index).await?;
        let current = zone
            .track
            .as_ref()
            .ok_or_else(|| Error::conflict("no track loaded"))?
            .index;
        let tracks = self.current_tracks(zone_index).await?;
        if tracks.is_empty() {
            return Err(Error::conflict("playlist is empty"));
        }

        let next_index = if forward {
            if current < tracks.len() {
                current + 1
            } else if zone.playlist_repeat {
                1
            } else {
                return Err(Error::conflict("already at the last track"));
            }
        } else if current > 1 {
            current - 1
        } else if zone.playlist_repeat {
            tracks.len()
        } else {
            return Err(Error::conflict("already at the first track"));
        };

        let track = tracks[next_index - 1].clone();
        if envelope.source != CommandSource::Internal {
            let command = if forward { "next" } else { "previous" };
            tolerate_uncontrollable(self.snapcast.stream_control(&zone.sink, command).await)?;
        }

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, move |z| z.track = Some(track))
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn play_track(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        raw_index: i64,
    ) -> Result<CommandReply> {
        if raw_index < 1 {
            return Err(Error::invalid("track index must be >= 1"));
        }
        let tracks = self.current_tracks(zone_index).await?;
        let index = raw_index as usize;
        let track = tracks
            .get(index - 1)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("track {} of {}", index, tracks.len())))?;

        let zone = self.store.zone(zone_index).await?;
        tolerate_uncontrollable(self.snapcast.stream_control(&zone.sink, "play").await)?;

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, move |z| {
                z.track = Some(track);
                z.playback = PlaybackState::Playing;
            })
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn load_playlist(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        raw_index: i64,
    ) -> Result<CommandReply> {
        if raw_index < 1 {
            return Err(Error::invalid("playlist index must be >= 1"));
        }
        let catalogue = self.subsonic()?.get_playlists().await?;
        let index = raw_index as usize;
        let entry = catalogue
            .get(index - 1)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("playlist {} of {}", index, catalogue.len()))
            })?;

        let (mut info, tracks) = self.subsonic()?.get_playlist(&entry.id).await?;
        info.index = index;
        let first_track = tracks.first().cloned();

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, move |z| {
                z.playlist = Some(info);
                z.track = first_track;
            })
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn set_volume(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        raw: i64,
    ) -> Result<CommandReply> {
        let volume = checked_volume(envelope.source, raw)?;

        if envelope.source != CommandSource::Internal {
            self.push_to_members(zone_index, Some(volume), None).await?;
        }

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, |z| z.volume = volume)
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn set_mute(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        mute: bool,
    ) -> Result<CommandReply> {
        if envelope.source != CommandSource::Internal {
            self.push_to_members(zone_index, None, Some(mute)).await?;
        }

        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, |z| z.mute = mute)
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn set_flags(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        op: &ZoneOp,
    ) -> Result<CommandReply> {
        let op = op.clone();
        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, move |z| match op {
                ZoneOp::SetTrackRepeat { enabled } => z.track_repeat = enabled,
                ZoneOp::SetPlaylistRepeat { enabled } => z.playlist_repeat = enabled,
                ZoneOp::SetShuffle { enabled } => z.shuffle = enabled,
                _ => {}
            })
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }

    async fn sync_position(
        &self,
        envelope: &CommandEnvelope,
        zone_index: usize,
        position_ms: u64,
        playing: Option<bool>,
    ) -> Result<CommandReply> {
        let (snapshot, events) = self
            .store
            .mutate_zone(zone_index, move |z| {
                if let Some(track) = z.track.as_mut() {
                    track.position_ms = position_ms;
                }
                if let Some(playing) = playing {
                    // Only flip between playing/paused; stopped is a
                    // deliberate operator state
                    if z.playback != PlaybackState::Stopped {
                        z.playback = if playing {
                            PlaybackState::Playing
                        } else {
                            PlaybackState::Paused
                        };
                    }
                }
            })
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Zone(snapshot))
    }
}

#[async_trait]
impl CommandHandler for ZoneHandler {
    async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandReply> {
        let Command::Zone { zone, op } = &envelope.command else {
            return Err(Error::internal("zone handler received non-zone command"));
        };
        let zone = *zone;

        match op {
            ZoneOp::Play => self.playback(envelope, zone, PlaybackState::Playing).await,
            ZoneOp::Pause => self.playback(envelope, zone, PlaybackState::Paused).await,
            ZoneOp::Stop => self.playback(envelope, zone, PlaybackState::Stopped).await,
            ZoneOp::NextTrack => self.navigate(envelope, zone, true).await,
            ZoneOp::PreviousTrack => self.navigate(envelope, zone, false).await,
            ZoneOp::PlayTrack { index } => self.play_track(envelope, zone, *index).await,
            ZoneOp::LoadPlaylist { index } => self.load_playlist(envelope, zone, *index).await,
            ZoneOp::SetVolume { volume } => self.set_volume(envelope, zone, *volume).await,
            ZoneOp::SetMute { mute } => self.set_mute(envelope, zone, *mute).await,
            ZoneOp::SetTrackRepeat { .. }
            | ZoneOp::SetPlaylistRepeat { .. }
            | ZoneOp::SetShuffle { .. } => self.set_flags(envelope, zone, op).await,
            ZoneOp::SyncPosition {
                position_ms,
                playing,
            } => {
                self.sync_position(envelope, zone, *position_ms, *playing)
                    .await
            }
        }
    }
}

// =============================================================================
// Client handler
// =============================================================================

pub struct ClientHandler {
    store: SharedStore,
    snapcast: Arc<SnapcastAdapter>,
    grouping: Arc<GroupingService>,
    notify: NotificationTx,
    stats: Arc<Stats>,
}

impl ClientHandler {
    pub fn new(
        store: SharedStore,
        snapcast: Arc<SnapcastAdapter>,
        grouping: Arc<GroupingService>,
        notify: NotificationTx,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapcast,
            grouping,
            notify,
            stats,
        })
    }

    async fn set_volume(
        &self,
        envelope: &CommandEnvelope,
        client_index: usize,
        raw: i64,
    ) -> Result<CommandReply> {
        let volume = checked_volume(envelope.source, raw)?;
        let client = self.store.client(client_index).await?;

        if envelope.source != CommandSource::Internal {
            if let Some(id) = &client.snapcast_id {
                if client.connected {
                    if !self.snapcast.is_connected() {
                        return Err(Error::unavailable("snapcast is not connected"));
                    }
                    self.snapcast
                        .set_client_volume(id, volume, client.mute)
                        .await?;
                }
            }
        }

        let (snapshot, events) = self
            .store
            .mutate_client(client_index, |c| c.volume = volume)
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Client(snapshot))
    }

    /// First-class mute: the pre-mute level is preserved and restored on
    /// unmute.
    async fn set_mute(
        &self,
        envelope: &CommandEnvelope,
        client_index: usize,
        mute: bool,
    ) -> Result<CommandReply> {
        let client = self.store.client(client_index).await?;
        let restored_volume = if mute {
            client.volume
        } else {
            client.volume_before_mute.unwrap_or(client.volume)
        };

        if envelope.source != CommandSource::Internal {
            if let Some(id) = &client.snapcast_id {
                if client.connected {
                    if !self.snapcast.is_connected() {
                        return Err(Error::unavailable("snapcast is not connected"));
                    }
                    self.snapcast
                        .set_client_mute(id, restored_volume, mute)
                        .await?;
                }
            }
        }

        let (snapshot, events) = self
            .store
            .mutate_client(client_index, move |c| {
                if mute && !c.mute {
                    c.volume_before_mute = Some(c.volume);
                } else if !mute {
                    if let Some(previous) = c.volume_before_mute.take() {
                        c.volume = previous;
                    }
                }
                c.mute = mute;
            })
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Client(snapshot))
    }

    async fn set_latency(
        &self,
        envelope: &CommandEnvelope,
        client_index: usize,
        raw: i64,
    ) -> Result<CommandReply> {
        let latency = checked_latency(envelope.source, raw)?;
        let client = self.store.client(client_index).await?;

        if envelope.source != CommandSource::Internal {
            if let Some(id) = &client.snapcast_id {
                if client.connected {
                    if !self.snapcast.is_connected() {
                        return Err(Error::unavailable("snapcast is not connected"));
                    }
                    self.snapcast.set_client_latency(id, latency).await?;
                }
            }
        }

        let (snapshot, events) = self
            .store
            .mutate_client(client_index, |c| c.latency_ms = latency)
            .await?;
        self.notify.publish_all(envelope.source, events);
        Ok(CommandReply::Client(snapshot))
    }

    async fn assign_zone(
        &self,
        envelope: &CommandEnvelope,
        client_index: usize,
        raw_zone: i64,
    ) -> Result<CommandReply> {
        if raw_zone < 1 {
            return Err(Error::invalid("zone index must be >= 1"));
        }
        let (snapshot, events) = self
            .store
            .set_client_zone(client_index, raw_zone as usize)
            .await?;
        let changed = !events.is_empty();
        self.notify.publish_all(envelope.source, events);

        // Converge Snapcast promptly; the reassignment itself is already
        // committed either way
        if changed {
            let outcome = self.grouping.reconcile().await;
            debug!(client = client_index, health = ?outcome.health, "post-assign reconcile");
        }
        Ok(CommandReply::Client(snapshot))
    }

    async fn presence(
        &self,
        envelope: &CommandEnvelope,
        client_index: usize,
        op: &ClientOp,
    ) -> Result<CommandReply> {
        let op = op.clone();
        let (snapshot, events) = self
            .store
            .mutate_client(client_index, move |c| match op {
                ClientOp::Connected { snapcast_id } => {
                    c.connected = true;
                    c.snapcast_id = Some(snapcast_id);
                }
                ClientOp::Disconnected => {
                    c.connected = false;
                    c.snapcast_id = None;
                }
                _ => {}
            })
            .await?;
        let reconnected = snapshot.connected;
        self.notify.publish_all(envelope.source, events);

        if reconnected {
            // The reconnected client may sit in the wrong group; repair in
            // the background
            let grouping = self.grouping.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                let outcome = grouping.reconcile().await;
                if outcome.health == crate::grouping::ReconcileHealth::Degraded {
                    stats.record_error(
                        "reconcile",
                        &Error::internal(outcome.detail.unwrap_or_default()),
                    );
                }
            });
        }
        Ok(CommandReply::Client(snapshot))
    }
}

#[async_trait]
impl CommandHandler for ClientHandler {
    async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandReply> {
        let Command::Client { client, op } = &envelope.command else {
            return Err(Error::internal("client handler received non-client command"));
        };
        let client = *client;

        match op {
            ClientOp::SetVolume { volume } => self.set_volume(envelope, client, *volume).await,
            ClientOp::SetMute { mute } => self.set_mute(envelope, client, *mute).await,
            ClientOp::SetLatency { latency_ms } => {
                self.set_latency(envelope, client, *latency_ms).await
            }
            ClientOp::AssignZone { zone } => self.assign_zone(envelope, client, *zone).await,
            ClientOp::Connected { .. } | ClientOp::Disconnected => {
                self.presence(envelope, client, op).await
            }
        }
    }
}
