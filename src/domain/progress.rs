//! Status events streamed to live observers of a job.

use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// A single per-job status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: i64,
    pub status: JobStatus,
    /// Coarse completion percentage; the pipeline emits 0/60/80/100
    /// milestones, heartbeat messages omit it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn milestone(job_id: i64, status: JobStatus, progress_pct: u8) -> Self {
        Self {
            job_id,
            status,
            progress_pct: Some(progress_pct),
            message: None,
            error: None,
        }
    }

    pub fn message(job_id: i64, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            status,
            progress_pct: None,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(job_id: i64, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            progress_pct: None,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// What a subscriber receives: either an event or a gap marker after the
/// subscription's bounded buffer overflowed.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Event(ProgressEvent),
    /// `missed` events were dropped (oldest first); the stream continues.
    Lagged { missed: u64 },
}
