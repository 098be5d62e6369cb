//! Runtime counters and the recent-error ring.
//!
//! A sink, not an observability layer: counters back `/api/v1/system/stats`,
//! the error ring backs `/api/v1/system/errors`. Nothing here is exported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorKind;

const ERROR_RING_CAPACITY: usize = 100;

/// Monotonic counters, cheap to bump from any task.
#[derive(Debug, Default)]
pub struct Counters {
    pub commands_processed: AtomicU64,
    pub commands_failed: AtomicU64,
    pub commands_dropped: AtomicU64,
    pub notifications_published: AtomicU64,
    pub mqtt_publish_failures: AtomicU64,
    pub knx_publish_failures: AtomicU64,
    pub snapcast_reconnects: AtomicU64,
    pub reconcile_passes: AtomicU64,
    pub reconcile_failures: AtomicU64,
}

/// Serializable snapshot of [`Counters`].
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub commands_processed: u64,
    pub commands_failed: u64,
    pub commands_dropped: u64,
    pub notifications_published: u64,
    pub mqtt_publish_failures: u64,
    pub knx_publish_failures: u64,
    pub snapcast_reconnects: u64,
    pub reconcile_passes: u64,
    pub reconcile_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub component: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Shared statistics hub.
#[derive(Debug, Default)]
pub struct Stats {
    pub counters: Counters,
    errors: Mutex<VecDeque<ErrorEntry>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, component: &str, error: &crate::error::Error) {
        let mut ring = match self.errors.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ErrorEntry {
            at: Utc::now(),
            component: component.to_string(),
            kind: error.kind(),
            message: error.message.clone(),
        });
    }

    /// Most recent errors, newest last.
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        match self.errors.lock() {
            Ok(g) => g.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let c = &self.counters;
        CountersSnapshot {
            commands_processed: c.commands_processed.load(Ordering::Relaxed),
            commands_failed: c.commands_failed.load(Ordering::Relaxed),
            commands_dropped: c.commands_dropped.load(Ordering::Relaxed),
            notifications_published: c.notifications_published.load(Ordering::Relaxed),
            mqtt_publish_failures: c.mqtt_publish_failures.load(Ordering::Relaxed),
            knx_publish_failures: c.knx_publish_failures.load(Ordering::Relaxed),
            snapcast_reconnects: c.snapcast_reconnects.load(Ordering::Relaxed),
            reconcile_passes: c.reconcile_passes.load(Ordering::Relaxed),
            reconcile_failures: c.reconcile_failures.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
