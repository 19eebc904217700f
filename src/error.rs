//! Error classification for pipeline activities.
//!
//! Activities return [`ActivityError`] values tagged with an [`ErrorKind`];
//! the scheduler consults the kind to decide between retry and terminal
//! failure. Component-specific error enums convert into this shape at the
//! activity boundary.

use thiserror::Error;

/// Broad failure classes the scheduler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying within the activity's retry policy.
    Transient,
    /// Retries cannot help (missing file, invariant breach, malformed input).
    Permanent,
    /// Caller-initiated cancellation; treated as permanent.
    Cancelled,
}

/// A classified activity failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }

    /// True when the scheduler may attempt the activity again.
    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}
