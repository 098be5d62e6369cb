//! snapdog - Multi-room audio control plane
//!
//! Sits atop a Snapcast server and exposes a unified control plane to
//! several surfaces: an HTTP/JSON API, an MQTT broker, a KNX bus, and a
//! Subsonic music library. Heterogeneous commands are normalized into
//! source-tagged commands over a single in-process mediator; every state
//! change is published back out to all interested surfaces.

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================

// Deny truly dangerous patterns (these will fail the build)
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod adapters;
pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod grouping;
pub mod handlers;
pub mod orchestrator;
pub mod publisher;
pub mod state;
pub mod stats;
