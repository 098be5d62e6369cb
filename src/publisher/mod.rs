//! State publisher
//!
//! Startup phase: enumerate the full state (system status, one composite per
//! zone, one per client) and emit it through the mediator so every
//! integration renders its wire format once. Steady state: one dedicated
//! subscriber task per integration translates notifications, each applying
//! echo suppression against its own source tag.

pub mod knx;
pub mod mqtt;

use crate::bus::commands::CommandSource;
use crate::bus::events::{Notification, SystemStatus};
use crate::bus::NotificationTx;
use crate::state::SharedStore;

/// Emit the full current state as composite notifications. Failures inside
/// subscribers are counted by the subscribers themselves, never fatal here.
pub async fn publish_full_state(
    notify: &NotificationTx,
    store: &SharedStore,
    status: SystemStatus,
) {
    notify.publish(
        CommandSource::Internal,
        Notification::SystemStatusChanged { status },
    );

    for zone in store.zones().await {
        notify.publish(
            CommandSource::Internal,
            Notification::ZoneStateChanged {
                old: Box::new(zone.clone()),
                new: Box::new(zone),
            },
        );
    }

    for client in store.clients().await {
        notify.publish(
            CommandSource::Internal,
            Notification::ClientStateChanged {
                old: Box::new(client.clone()),
                new: Box::new(client),
            },
        );
    }
}
