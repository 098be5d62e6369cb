//! Authoritative zone/client state store.
//!
//! One async mutex per entity serializes mutations to that entity (FIFO on
//! wait); mutations to distinct entities run concurrently. Callers only ever
//! receive value snapshots; diff notifications are returned to the caller,
//! which decides how to publish them. The store holds no references to
//! adapters or publishers.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::events::Notification;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::state::client::{self, ClientState};
use crate::state::zone::{self, ZoneState};

pub struct StateStore {
    zones: Vec<Arc<Mutex<ZoneState>>>,
    clients: Vec<Arc<Mutex<ClientState>>>,
}

/// Shared store handle.
pub type SharedStore = Arc<StateStore>;

impl StateStore {
    /// Build the tables from configuration. Entities are created here and
    /// never destroyed; only their mutable fields change afterwards.
    pub fn from_config(config: &AppConfig) -> Self {
        let zones = config
            .zones
            .iter()
            .enumerate()
            .map(|(i, z)| Arc::new(Mutex::new(ZoneState::from_config(i + 1, z))))
            .collect();
        let clients = config
            .clients
            .iter()
            .enumerate()
            .map(|(i, c)| Arc::new(Mutex::new(ClientState::from_config(i + 1, c))))
            .collect();
        Self { zones, clients }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn zone_slot(&self, index: usize) -> Result<&Arc<Mutex<ZoneState>>> {
        if index == 0 {
            return Err(Error::not_found("zone indices are 1-based"));
        }
        self.zones
            .get(index - 1)
            .ok_or_else(|| Error::not_found(format!("zone {} does not exist", index)))
    }

    fn client_slot(&self, index: usize) -> Result<&Arc<Mutex<ClientState>>> {
        if index == 0 {
            return Err(Error::not_found("client indices are 1-based"));
        }
        self.clients
            .get(index - 1)
            .ok_or_else(|| Error::not_found(format!("client {} does not exist", index)))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn zone(&self, index: usize) -> Result<ZoneState> {
        Ok(self.zone_slot(index)?.lock().await.clone())
    }

    pub async fn client(&self, index: usize) -> Result<ClientState> {
        Ok(self.client_slot(index)?.lock().await.clone())
    }

    pub async fn zones(&self) -> Vec<ZoneState> {
        let mut out = Vec::with_capacity(self.zones.len());
        for slot in &self.zones {
            out.push(slot.lock().await.clone());
        }
        out
    }

    pub async fn clients(&self) -> Vec<ClientState> {
        let mut out = Vec::with_capacity(self.clients.len());
        for slot in &self.clients {
            out.push(slot.lock().await.clone());
        }
        out
    }

    /// Find the client configured with the given MAC.
    pub async fn client_by_mac(&self, mac: &str) -> Option<ClientState> {
        for slot in &self.clients {
            let c = slot.lock().await;
            if c.mac == mac {
                return Some(c.clone());
            }
        }
        None
    }

    /// Find the zone whose Snapcast sink matches the given stream id.
    pub async fn zone_by_sink(&self, sink: &str) -> Option<ZoneState> {
        for slot in &self.zones {
            let z = slot.lock().await;
            if z.sink == sink {
                return Some(z.clone());
            }
        }
        None
    }

    /// Find the client Snapcast knows under the given opaque id.
    pub async fn client_by_snapcast_id(&self, id: &str) -> Option<ClientState> {
        for slot in &self.clients {
            let c = slot.lock().await;
            if c.snapcast_id.as_deref() == Some(id) {
                return Some(c.clone());
            }
        }
        None
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Apply a pure transform to one zone under its lock. The transform's
    /// output is validated before commit; on violation nothing changes and
    /// the caller gets `Invalid`. Returns the updated snapshot plus the field
    /// notifications produced by the diff.
    pub async fn mutate_zone<F>(
        &self,
        index: usize,
        transform: F,
    ) -> Result<(ZoneState, Vec<Notification>)>
    where
        F: FnOnce(&mut ZoneState),
    {
        let slot = self.zone_slot(index)?;
        let mut current = slot.lock().await;

        let mut next = current.clone();
        transform(&mut next);
        self.validate_zone(&current, &next)?;

        next.last_mutated = chrono::Utc::now();
        let events = zone::diff(&current, &next);
        *current = next.clone();
        Ok((next, events))
    }

    /// Apply a pure transform to one client under its lock; same contract as
    /// [`Self::mutate_zone`].
    pub async fn mutate_client<F>(
        &self,
        index: usize,
        transform: F,
    ) -> Result<(ClientState, Vec<Notification>)>
    where
        F: FnOnce(&mut ClientState),
    {
        let slot = self.client_slot(index)?;
        let mut current = slot.lock().await;

        let mut next = current.clone();
        transform(&mut next);
        self.validate_client(&current, &next)?;

        next.last_mutated = chrono::Utc::now();
        let events = client::diff(&current, &next);
        *current = next.clone();
        Ok((next, events))
    }

    /// Move a client to another zone, updating the client record and both
    /// zone membership sets. Idempotent: re-assigning the current zone
    /// succeeds without emitting anything. Locks are taken zones-first in
    /// ascending index order, then the client.
    pub async fn set_client_zone(
        &self,
        client_index: usize,
        zone_index: usize,
    ) -> Result<(ClientState, Vec<Notification>)> {
        self.zone_slot(zone_index)?;
        let client_slot = self.client_slot(client_index)?;

        let previous_zone = {
            let c = client_slot.lock().await;
            c.desired_zone()
        };

        // Re-assigning the current zone is a no-op: no mutation, no events.
        if previous_zone == zone_index {
            let c = client_slot.lock().await;
            return Ok((c.clone(), Vec::new()));
        }

        let mut events = Vec::new();

        // Membership sets: zone locks in ascending index order, matching the
        // reconciler's discipline, so the two can never deadlock.
        let (low, high) = if previous_zone < zone_index {
            (previous_zone, zone_index)
        } else {
            (zone_index, previous_zone)
        };
        let low_slot = self.zone_slot(low)?.clone();
        let high_slot = self.zone_slot(high)?.clone();

        {
            let mut low_zone = low_slot.lock().await;
            let mut high_zone = high_slot.lock().await;
            let (prev_zone, target_zone) = if low == previous_zone {
                (&mut *low_zone, &mut *high_zone)
            } else {
                (&mut *high_zone, &mut *low_zone)
            };

            let prev_snapshot = prev_zone.clone();
            prev_zone.clients.remove(&client_index);
            prev_zone.last_mutated = chrono::Utc::now();
            events.extend(zone::diff(&prev_snapshot, prev_zone));

            let target_snapshot = target_zone.clone();
            target_zone.clients.insert(client_index);
            target_zone.last_mutated = chrono::Utc::now();
            events.extend(zone::diff(&target_snapshot, target_zone));
        }

        let mut c = client_slot.lock().await;
        let old_client = c.clone();
        c.current_zone = Some(zone_index);
        c.last_mutated = chrono::Utc::now();
        events.extend(client::diff(&old_client, &c));
        Ok((c.clone(), events))
    }

    /// Record a client's zone membership without touching the client record.
    /// Used at startup to seed membership sets from configuration.
    pub async fn seed_zone_membership(&self) -> Result<()> {
        for slot in &self.clients {
            let (index, zone_index) = {
                let c = slot.lock().await;
                (c.index, c.desired_zone())
            };
            let zone_slot = self.zone_slot(zone_index)?;
            zone_slot.lock().await.clients.insert(index);
        }
        Ok(())
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    fn validate_zone(&self, old: &ZoneState, new: &ZoneState) -> Result<()> {
        if new.index != old.index || new.sink != old.sink {
            return Err(Error::invalid("zone identity fields are immutable"));
        }
        if new.volume > 100 {
            return Err(Error::invalid("Volume must be between 0 and 100"));
        }
        for client in &new.clients {
            if *client == 0 || *client > self.clients.len() {
                return Err(Error::invalid(format!(
                    "zone {} references unknown client {}",
                    new.index, client
                )));
            }
        }
        Ok(())
    }

    fn validate_client(&self, old: &ClientState, new: &ClientState) -> Result<()> {
        if new.index != old.index || new.mac != old.mac {
            return Err(Error::invalid("client identity fields are immutable"));
        }
        if new.volume > 100 {
            return Err(Error::invalid("Volume must be between 0 and 100"));
        }
        if let Some(zone) = new.current_zone {
            if zone == 0 || zone > self.zones.len() {
                return Err(Error::invalid(format!(
                    "client {} assigned to unknown zone {}",
                    new.index, zone
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, AppConfig, BackoffPolicy, ClientConfig, ReconcileConfig, ServicesConfig,
        SnapcastConfig, ZoneConfig,
    };
    use crate::state::zone::PlaybackState;

    fn test_config(zones: usize, clients: usize) -> AppConfig {
        AppConfig {
            api: ApiConfig::default(),
            services: ServicesConfig {
                snapcast: SnapcastConfig {
                    host: "localhost".into(),
                    port: 1705,
                    timeout_secs: 5,
                    expect_free_port: false,
                    reconnect: BackoffPolicy::default(),
                },
                mqtt: None,
                knx: None,
                subsonic: None,
            },
            zones: (0..zones)
                .map(|i| ZoneConfig {
                    name: format!("Zone {}", i + 1),
                    sink: format!("/snapsinks/zone{}", i + 1),
                    mqtt: None,
                    knx: None,
                    icon: None,
                })
                .collect(),
            clients: (0..clients)
                .map(|i| ClientConfig {
                    name: format!("Client {}", i + 1),
                    mac: format!("aa:bb:cc:dd:ee:{:02x}", i + 1),
                    default_zone: 1,
                    mqtt: None,
                    knx: None,
                    icon: None,
                })
                .collect(),
            directories: vec![],
            reconcile: ReconcileConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = StateStore::from_config(&test_config(1, 1));
        let mut snapshot = store.zone(1).await.unwrap();
        snapshot.volume = 99;
        assert_eq!(store.zone(1).await.unwrap().volume, 50);
    }

    #[tokio::test]
    async fn test_unknown_indices_are_not_found() {
        let store = StateStore::from_config(&test_config(2, 1));
        assert_eq!(
            store.zone(0).await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
        assert_eq!(
            store.zone(3).await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
        assert_eq!(
            store.client(2).await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_mutate_zone_emits_diff() {
        let store = StateStore::from_config(&test_config(1, 0));
        let (snapshot, events) = store
            .mutate_zone(1, |z| {
                z.volume = 60;
                z.playback = PlaybackState::Playing;
            })
            .await
            .unwrap();
        assert_eq!(snapshot.volume, 60);
        // playback + volume + composite
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_mutation_leaves_state_untouched() {
        let store = StateStore::from_config(&test_config(1, 0));
        let err = store
            .mutate_zone(1, |z| z.volume = 101)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
        assert_eq!(store.zone(1).await.unwrap().volume, 50);
    }

    #[tokio::test]
    async fn test_set_client_zone_moves_membership() {
        let store = StateStore::from_config(&test_config(3, 2));
        store.seed_zone_membership().await.unwrap();

        let (client, events) = store.set_client_zone(2, 3).await.unwrap();
        assert_eq!(client.current_zone, Some(3));
        assert!(!store.zone(1).await.unwrap().clients.contains(&2));
        assert!(store.zone(3).await.unwrap().clients.contains(&2));
        assert!(events.iter().any(|e| matches!(
            e,
            Notification::ClientZoneAssignmentChanged {
                client: 2,
                previous: 1,
                next: 3
            }
        )));
    }

    #[tokio::test]
    async fn test_set_client_zone_is_idempotent() {
        let store = StateStore::from_config(&test_config(3, 1));
        store.seed_zone_membership().await.unwrap();

        let (_, first) = store.set_client_zone(1, 2).await.unwrap();
        assert!(!first.is_empty());
        let (_, second) = store.set_client_zone(1, 2).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_set_client_zone_unknown_zone() {
        let store = StateStore::from_config(&test_config(1, 1));
        let err = store.set_client_zone(1, 9).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_to_distinct_zones() {
        let store = Arc::new(StateStore::from_config(&test_config(2, 0)));
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.mutate_zone(1, |z| z.volume = 10).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.mutate_zone(2, |z| z.volume = 20).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(store.zone(1).await.unwrap().volume, 10);
        assert_eq!(store.zone(2).await.unwrap().volume, 20);
    }

    #[tokio::test]
    async fn test_serialized_mutations_to_same_zone() {
        let store = Arc::new(StateStore::from_config(&test_config(1, 0)));
        let mut handles = Vec::new();
        for volume in 0..20u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mutate_zone(1, move |z| z.volume = volume).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Final volume is one of the attempted writes, table uncorrupted
        assert!(store.zone(1).await.unwrap().volume < 20);
    }

    #[tokio::test]
    async fn test_client_lookup_by_mac_and_id() {
        let store = StateStore::from_config(&test_config(1, 2));
        assert!(store.client_by_mac("aa:bb:cc:dd:ee:02").await.is_some());
        assert!(store.client_by_mac("00:00:00:00:00:00").await.is_none());

        store
            .mutate_client(1, |c| c.snapcast_id = Some("snap-abc".into()))
            .await
            .unwrap();
        let found = store.client_by_snapcast_id("snap-abc").await.unwrap();
        assert_eq!(found.index, 1);
    }
}
