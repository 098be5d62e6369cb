//! Error types shared across the control plane.
//!
//! Every fallible operation returns [`Result<T>`]. The set of error kinds is
//! closed: adapters wrap third-party failures into `Unavailable` or
//! `External`, validation failures short-circuit as `Invalid`, and nothing
//! escapes the mediator as an untyped panic or anyhow blob.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, used for API status mapping and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Entity (zone, client, playlist, ...) does not exist
    NotFound,
    /// Input validation failed; no side effect occurred
    Invalid,
    /// A backing service (Snapcast, MQTT, KNX, Subsonic) is not reachable
    Unavailable,
    /// Operation exceeded its deadline
    Timeout,
    /// State precondition violated (e.g. already assigned)
    Conflict,
    /// No handler registered for a command type (configuration bug)
    HandlerMissing,
    /// Bounded outbound queue is full
    Backpressure,
    /// Wrapped error from a third party
    External,
    /// Internal invariant violation (bug)
    Internal,
}

impl ErrorKind {
    /// Stable identifier used in API error bodies and MQTT error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Invalid => "Invalid",
            Self::Unavailable => "Unavailable",
            Self::Timeout => "Timeout",
            Self::Conflict => "Conflict",
            Self::HandlerMissing => "HandlerMissing",
            Self::Backpressure => "Backpressure",
            Self::External => "External",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error carrying a kind and a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn handler_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerMissing, message)
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backpressure, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::external(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::external(format!("JSON: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else if e.is_connect() {
            Self::unavailable(e.to_string())
        } else {
            Self::external(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation deadline exceeded")
    }
}
