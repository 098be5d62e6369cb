//! Zone grouping service
//!
//! Continuously aligns Snapcast's physical group membership with the logical
//! zone -> clients mapping. One pass: ensure every zone has a group whose
//! stream is the zone's sink, then move each connected client into the group
//! of its desired zone. At most one pass runs at a time; concurrent triggers
//! coalesce onto the in-flight pass and observe its outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::snapcast::{ServerStatus, SnapcastAdapter};
use crate::bus::commands::CommandSource;
use crate::bus::NotificationTx;
use crate::config::ReconcileConfig;
use crate::error::Error;
use crate::state::SharedStore;
use crate::stats::{bump, Stats};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileHealth {
    /// No mutations were needed
    Healthy,
    /// Mutations were needed and all succeeded
    Reconciled,
    /// At least one mutation failed or the pass could not run
    Degraded,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcileOutcome {
    pub health: ReconcileHealth,
    pub mutations: usize,
    pub detail: Option<String>,
}

impl ReconcileOutcome {
    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            health: ReconcileHealth::Degraded,
            mutations: 0,
            detail: Some(detail.into()),
        }
    }
}

pub struct GroupingService {
    store: SharedStore,
    snapcast: Arc<SnapcastAdapter>,
    notify: NotificationTx,
    stats: Arc<Stats>,
    config: ReconcileConfig,
    run_lock: Mutex<()>,
    generation: watch::Sender<u64>,
    last_outcome: RwLock<Option<ReconcileOutcome>>,
}

impl GroupingService {
    pub fn new(
        store: SharedStore,
        snapcast: Arc<SnapcastAdapter>,
        notify: NotificationTx,
        stats: Arc<Stats>,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0u64);
        Arc::new(Self {
            store,
            snapcast,
            notify,
            stats,
            config,
            run_lock: Mutex::new(()),
            generation,
            last_outcome: RwLock::new(None),
        })
    }

    pub async fn last_outcome(&self) -> Option<ReconcileOutcome> {
        self.last_outcome.read().await.clone()
    }

    /// Run one reconciliation pass, or coalesce onto the in-flight one.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A pass is in flight; await its completion and share its
                // outcome
                let mut rx = self.generation.subscribe();
                let seen = *rx.borrow();
                loop {
                    if *rx.borrow_and_update() != seen {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                return self
                    .last_outcome
                    .read()
                    .await
                    .clone()
                    .unwrap_or_else(|| ReconcileOutcome::degraded("no outcome recorded"));
            }
        };

        bump(&self.stats.counters.reconcile_passes);
        let budget = Duration::from_secs(self.config.budget_secs);
        let outcome = match tokio::time::timeout(budget, self.run_pass()).await {
            Ok(outcome) => outcome,
            Err(_) => ReconcileOutcome::degraded(format!(
                "reconciliation exceeded {:?} budget",
                budget
            )),
        };

        if outcome.health == ReconcileHealth::Degraded {
            bump(&self.stats.counters.reconcile_failures);
            warn!(detail = ?outcome.detail, "reconciliation degraded");
        } else {
            debug!(health = ?outcome.health, mutations = outcome.mutations, "reconciled");
        }

        *self.last_outcome.write().await = Some(outcome.clone());
        self.generation.send_modify(|g| *g += 1);
        drop(guard);
        outcome
    }

    /// Periodic reconciliation until shutdown.
    pub async fn run_interval(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; the startup orchestrator already ran
        // the initial pass
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.snapcast.is_connected() {
                        self.reconcile().await;
                    } else {
                        debug!("skipping reconciliation, snapcast disconnected");
                    }
                }
            }
        }
        info!("grouping service stopped");
    }

    async fn run_pass(&self) -> ReconcileOutcome {
        let status = match self.snapcast.get_server_status().await {
            Ok(status) => status,
            Err(e) => return ReconcileOutcome::degraded(format!("server status: {}", e)),
        };

        let mut mutations = 0usize;
        let mut failures: Vec<String> = Vec::new();

        // Adopt reported client presence and levels into the logical table
        // (ascending index order, one entity lock at a time)
        self.sync_clients_from_status(&status).await;

        // Phase 1: every zone gets a group streaming its sink
        let zones = self.store.zones().await;
        let mut status = status;
        for zone in &zones {
            if status.group_for_stream(&zone.sink).is_some() {
                continue;
            }
            match self.claim_group_for_zone(&status, zone.index, &zone.sink).await {
                Ok(Some(group_id)) => {
                    mutations += 1;
                    debug!(zone = zone.index, group = %group_id, "assigned stream to group");
                    // Re-fetch so later phases see the new topology
                    match self.snapcast.get_server_status().await {
                        Ok(s) => status = s,
                        Err(e) => {
                            failures.push(format!("refresh status: {}", e));
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!(zone = zone.index, "no group available for zone");
                }
                Err(e) => failures.push(format!("zone {}: {}", zone.index, e)),
            }
        }

        // Phase 2: every connected client sits in its desired zone's group
        let clients = self.store.clients().await;
        for client in &clients {
            if !client.connected {
                continue;
            }
            let Some(snapcast_id) = &client.snapcast_id else {
                continue;
            };
            let desired_zone = client.desired_zone();
            let Some(zone) = zones.iter().find(|z| z.index == desired_zone) else {
                continue;
            };
            let Some(desired_group) = status.group_for_stream(&zone.sink) else {
                continue;
            };
            let current_group = status.find_client(snapcast_id).map(|(g, _)| g.id.clone());
            if current_group.as_deref() == Some(desired_group.id.as_str()) {
                continue;
            }
            match self
                .snapcast
                .set_client_group(snapcast_id, &desired_group.id)
                .await
            {
                Ok(()) => {
                    mutations += 1;
                    debug!(client = client.index, group = %desired_group.id, "moved client");
                }
                Err(e) => failures.push(format!("client {}: {}", client.index, e)),
            }
        }

        // Phase 3: push configured names so the Snapcast UI shows room names
        for client in &clients {
            let Some(snapcast_id) = &client.snapcast_id else {
                continue;
            };
            let reported = status
                .find_client(snapcast_id)
                .map(|(_, c)| c.config.name.clone());
            if let Some(reported) = reported {
                if reported != client.name {
                    if let Err(e) = self.snapcast.set_client_name(snapcast_id, &client.name).await
                    {
                        failures.push(format!("client {} name: {}", client.index, e));
                    } else {
                        mutations += 1;
                    }
                }
            }
        }

        let health = if !failures.is_empty() {
            ReconcileHealth::Degraded
        } else if mutations == 0 {
            ReconcileHealth::Healthy
        } else {
            ReconcileHealth::Reconciled
        };
        ReconcileOutcome {
            health,
            mutations,
            detail: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }

    /// Find a group to carry the zone's stream: prefer a group already
    /// holding one of the zone's clients, else any group whose stream no
    /// zone claims. Ties break on the lexicographically lowest group id.
    async fn claim_group_for_zone(
        &self,
        status: &ServerStatus,
        zone_index: usize,
        sink: &str,
    ) -> crate::error::Result<Option<String>> {
        let zone_clients = self.store.zone(zone_index).await?.clients;
        let mut zone_client_ids = Vec::new();
        for index in &zone_clients {
            if let Ok(c) = self.store.client(*index).await {
                if let Some(id) = c.snapcast_id {
                    zone_client_ids.push(id);
                }
            }
        }

        let claimed_sinks: Vec<String> = self
            .store
            .zones()
            .await
            .iter()
            .map(|z| z.sink.clone())
            .collect();

        let mut candidates: Vec<&crate::adapters::snapcast::SnapGroup> = status
            .groups
            .iter()
            .filter(|g| {
                g.clients.iter().any(|c| zone_client_ids.contains(&c.id))
                    || !claimed_sinks.contains(&g.stream_id)
            })
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let Some(group) = candidates.first() else {
            return Ok(None);
        };
        self.snapcast.set_group_stream(&group.id, sink).await?;
        Ok(Some(group.id.clone()))
    }

    /// Fold Snapcast-reported client facts into the logical table. Values
    /// out of range are clamped and logged (they came from Snapcast itself,
    /// not from a validating surface).
    async fn sync_clients_from_status(&self, status: &ServerStatus) {
        let clients = self.store.clients().await;
        for client in clients {
            let reported = status.groups.iter().find_map(|g| {
                g.clients
                    .iter()
                    .find(|c| c.host.mac == client.mac || Some(&c.id) == client.snapcast_id.as_ref())
            });
            let Some(reported) = reported else {
                continue;
            };

            let volume = clamp_reported(reported.config.volume.percent, 100, "volume") as u8;
            let latency = clamp_reported(reported.config.latency, u16::MAX as i64, "latency")
                as u16;
            let snapcast_id = reported.id.clone();
            let connected = reported.connected;
            let muted = reported.config.volume.muted;

            let result = self
                .store
                .mutate_client(client.index, move |c| {
                    c.snapcast_id = Some(snapcast_id);
                    c.connected = connected;
                    c.volume = volume;
                    c.mute = muted;
                    c.latency_ms = latency;
                })
                .await;
            match result {
                Ok((_, events)) => self.notify.publish_all(CommandSource::Internal, events),
                Err(e) => {
                    self.stats
                        .record_error("reconcile", &Error::internal(e.to_string()));
                }
            }
        }
    }
}

/// Clamp a Snapcast-reported value into range, logging when it was out.
fn clamp_reported(value: i64, max: i64, what: &str) -> i64 {
    if value < 0 {
        warn!(value, what, "snapcast reported negative value, clamping to 0");
        0
    } else if value > max {
        warn!(value, what, max, "snapcast reported out-of-range value, clamping");
        max
    } else {
        value
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_reported() {
        assert_eq!(clamp_reported(50, 100, "volume"), 50);
        assert_eq!(clamp_reported(150, 100, "volume"), 100);
        assert_eq!(clamp_reported(-4, 100, "volume"), 0);
        assert_eq!(clamp_reported(70_000, u16::MAX as i64, "latency"), 65_535);
    }

    #[test]
    fn test_outcome_health_rules() {
        let healthy = ReconcileOutcome {
            health: ReconcileHealth::Healthy,
            mutations: 0,
            detail: None,
        };
        assert_eq!(healthy.health, ReconcileHealth::Healthy);
        let degraded = ReconcileOutcome::degraded("x");
        assert_eq!(degraded.health, ReconcileHealth::Degraded);
        assert_eq!(degraded.detail.as_deref(), Some("x"));
    }
}
