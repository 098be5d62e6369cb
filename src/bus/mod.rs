//! Command/notification mediator
//!
//! A single in-process bus with two disciplines:
//!
//! - **Request/response**: each command kind has exactly one handler,
//!   registered at startup in an explicit typed registry. `send` dispatches
//!   under the command's deadline; an unregistered kind is a configuration
//!   bug surfaced as `HandlerMissing`.
//! - **Publish/subscribe**: notifications fan out over a
//!   `tokio::sync::broadcast` channel. Subscriber failures are the
//!   subscriber's problem; the producer never blocks on delivery.

pub mod commands;
pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::commands::{Command, CommandEnvelope, CommandKind, CommandReply, CommandSource};
use crate::bus::events::{Notification, NotificationEnvelope};
use crate::error::{Error, Result};

/// Capacity of the notification broadcast channel. Slow subscribers lag and
/// skip rather than block the producer.
const NOTIFICATION_CAPACITY: usize = 256;

/// A command handler. One per command kind; receives exactly the capability
/// interfaces it needs via its constructor.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandReply>;
}

/// Narrow capability for emitting notifications. Handed to handlers and the
/// grouping service so they can publish without holding the mediator (which
/// holds them).
#[derive(Clone)]
pub struct NotificationTx {
    sender: broadcast::Sender<NotificationEnvelope>,
}

impl NotificationTx {
    pub fn publish(&self, origin: CommandSource, notification: Notification) {
        debug!(origin = %origin, event = notification.event_type(), "publish");
        let _ = self.sender.send(NotificationEnvelope {
            origin,
            notification,
        });
    }

    pub fn publish_all(&self, origin: CommandSource, notifications: Vec<Notification>) {
        for n in notifications {
            self.publish(origin, n);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEnvelope> {
        self.sender.subscribe()
    }
}

/// Builder for the mediator's handler registry.
pub struct MediatorBuilder {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
    notifications: broadcast::Sender<NotificationEnvelope>,
}

impl Default for MediatorBuilder {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            handlers: HashMap::new(),
            notifications,
        }
    }
}

impl MediatorBuilder {
    /// The notification sink, available before `build` so handlers can be
    /// constructed with it.
    pub fn notification_tx(&self) -> NotificationTx {
        NotificationTx {
            sender: self.notifications.clone(),
        }
    }

    pub fn register(mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> Self {
        // Exactly one handler per kind; a double registration is a wiring bug
        let previous = self.handlers.insert(kind, handler);
        debug_assert!(previous.is_none(), "duplicate handler for {:?}", kind);
        self
    }

    /// Register one handler for several kinds (e.g. all zone playback ops).
    pub fn register_all(mut self, kinds: &[CommandKind], handler: Arc<dyn CommandHandler>) -> Self {
        for kind in kinds {
            self = self.register(*kind, handler.clone());
        }
        self
    }

    pub fn build(self) -> Mediator {
        Mediator {
            handlers: self.handlers,
            notifications: self.notifications,
        }
    }
}

/// The in-process bus.
pub struct Mediator {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
    notifications: broadcast::Sender<NotificationEnvelope>,
}

/// Shared mediator handle.
pub type SharedMediator = Arc<Mediator>;

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    /// Dispatch a command to its registered handler under its deadline.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<CommandReply> {
        let kind = envelope.command.kind();
        let handler = self.handlers.get(&kind).ok_or_else(|| {
            Error::handler_missing(format!("no handler registered for {:?}", kind))
        })?;

        debug!(source = %envelope.source, ?kind, "dispatch");

        match tokio::time::timeout(envelope.deadline, handler.handle(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "command {:?} exceeded {:?}",
                kind, envelope.deadline
            ))),
        }
    }

    /// Verify the registry covers every command kind. Called once at startup;
    /// a gap here would otherwise only surface on first dispatch.
    pub fn verify_registry(&self) -> Result<()> {
        for kind in Command::all_kinds() {
            if !self.handlers.contains_key(kind) {
                return Err(Error::handler_missing(format!(
                    "command kind {:?} has no handler",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Publish a notification to all subscribers. Fire-and-forget: delivery
    /// failures (no subscribers) are not errors.
    pub fn publish(&self, origin: CommandSource, notification: Notification) {
        debug!(origin = %origin, event = notification.event_type(), "publish");
        let _ = self.notifications.send(NotificationEnvelope {
            origin,
            notification,
        });
    }

    /// Publish a batch preserving order.
    pub fn publish_all(&self, origin: CommandSource, notifications: Vec<Notification>) {
        for n in notifications {
            self.publish(origin, n);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEnvelope> {
        self.notifications.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifications.receiver_count()
    }
}

/// Per-notification budget inside a subscriber; a stuck handler must not
/// stall the whole subscriber queue indefinitely.
const SUBSCRIBER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Drive a notification subscriber loop: receive, invoke under a timeout,
/// log-and-swallow failures. Lagged receivers log a warning and continue
/// with the next available notification.
pub async fn run_subscriber<F, Fut>(
    name: &'static str,
    mut rx: broadcast::Receiver<NotificationEnvelope>,
    shutdown: tokio_util::sync::CancellationToken,
    mut handle: F,
) where
    F: FnMut(NotificationEnvelope) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(subscriber = name, "subscriber shutting down");
                break;
            }
            received = rx.recv() => match received {
                Ok(envelope) => {
                    match tokio::time::timeout(SUBSCRIBER_TIMEOUT, handle(envelope)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(subscriber = name, error = %e, "notification handler failed");
                        }
                        Err(_) => {
                            warn!(subscriber = name, "notification handler timed out");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscriber = name, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
