//! Snapcast event bridge
//!
//! Consumes the adapter's event stream and feeds it back into the mediator
//! as `Source=Internal` commands, closing the control loop. Connectivity
//! transitions additionally publish `SystemStatusChanged` and trigger a
//! reconciliation pass once the server is reachable again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::snapcast::{SnapcastEvent, SnapcastNotification};
use crate::bus::commands::{ClientOp, Command, CommandEnvelope, CommandSource, ZoneOp};
use crate::bus::SharedMediator;
use crate::grouping::GroupingService;
use crate::state::SharedStore;
use crate::stats::{bump, Stats};

pub struct SnapcastBridge {
    store: SharedStore,
    mediator: SharedMediator,
    grouping: Arc<GroupingService>,
    stats: Arc<Stats>,
}

impl SnapcastBridge {
    pub fn new(
        store: SharedStore,
        mediator: SharedMediator,
        grouping: Arc<GroupingService>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            store,
            mediator,
            grouping,
            stats,
        }
    }

    /// Drive the bridge until the event stream closes or shutdown.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<SnapcastEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                }
            }
        }
        info!("snapcast bridge stopped");
    }

    async fn handle(&self, event: SnapcastEvent) {
        match event {
            SnapcastEvent::Connected => {
                info!("snapcast reachable, reconciling");
                let grouping = self.grouping.clone();
                tokio::spawn(async move {
                    grouping.reconcile().await;
                });
            }
            SnapcastEvent::Disconnected => {
                // Clients are unreachable through a dead server; their
                // Connected flags stay as last reported and clear when the
                // reconnect's reconciliation observes reality
                debug!("snapcast unreachable");
            }
            SnapcastEvent::Notification(n) => self.handle_notification(n).await,
        }
    }

    async fn handle_notification(&self, notification: SnapcastNotification) {
        match notification {
            SnapcastNotification::ClientConnected { client } => {
                let Some(known) = self.store.client_by_mac(&client.host.mac).await else {
                    debug!(mac = %client.host.mac, "unconfigured snapcast client connected");
                    return;
                };
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::Connected {
                        snapcast_id: client.id.clone(),
                    },
                })
                .await;
                // Adopt the reported levels as internal state
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::SetVolume {
                        volume: client.config.volume.percent,
                    },
                })
                .await;
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::SetLatency {
                        latency_ms: client.config.latency,
                    },
                })
                .await;
            }
            SnapcastNotification::ClientDisconnected { id } => {
                let Some(known) = self.store.client_by_snapcast_id(&id).await else {
                    return;
                };
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::Disconnected,
                })
                .await;
            }
            SnapcastNotification::ClientVolumeChanged { id, volume } => {
                let Some(known) = self.store.client_by_snapcast_id(&id).await else {
                    return;
                };
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::SetVolume {
                        volume: volume.percent,
                    },
                })
                .await;
                if volume.muted != known.mute {
                    self.send(Command::Client {
                        client: known.index,
                        op: ClientOp::SetMute { mute: volume.muted },
                    })
                    .await;
                }
            }
            SnapcastNotification::ClientLatencyChanged { id, latency } => {
                let Some(known) = self.store.client_by_snapcast_id(&id).await else {
                    return;
                };
                self.send(Command::Client {
                    client: known.index,
                    op: ClientOp::SetLatency {
                        latency_ms: latency,
                    },
                })
                .await;
            }
            SnapcastNotification::GroupStreamChanged { .. }
            | SnapcastNotification::GroupMuteChanged { .. }
            | SnapcastNotification::ServerUpdated { .. } => {
                // Topology drifted; let a full pass settle it
                let grouping = self.grouping.clone();
                tokio::spawn(async move {
                    grouping.reconcile().await;
                });
            }
            SnapcastNotification::StreamProperties {
                id,
                position_ms,
                playing,
            } => {
                let Some(zone) = self.store.zone_by_sink(&id).await else {
                    return;
                };
                let Some(position_ms) = position_ms else {
                    return;
                };
                self.send(Command::Zone {
                    zone: zone.index,
                    op: ZoneOp::SyncPosition {
                        position_ms,
                        playing,
                    },
                })
                .await;
            }
        }
    }

    async fn send(&self, command: Command) {
        bump(&self.stats.counters.commands_processed);
        if let Err(e) = self
            .mediator
            .send(CommandEnvelope::new(CommandSource::Internal, command))
            .await
        {
            bump(&self.stats.counters.commands_failed);
            self.stats.record_error("snapcast-bridge", &e);
            warn!(error = %e, "internal command failed");
        }
    }
}
