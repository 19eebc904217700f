//! Job state and the status machine it moves through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a transcription job.
///
/// Transitions form a DAG: `Pending → Processing → {Completed, Failed}`,
/// with `Pending → Failed` additionally allowed for jobs cancelled or
/// permanently rejected before a worker picks them up. Terminal states are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether a transition from `self` to `next` is permitted.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped span of transcribed speech, Whisper-style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Seconds into the audio where the span starts.
    pub start: f64,
    /// Seconds into the audio where the span ends.
    pub end: f64,
    /// Recognized text for the span.
    pub text: String,
}

/// One uploaded audio file and everything the pipeline derives from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Opaque owner id; scoping key for listings and search.
    pub user_id: String,
    pub filename: String,
    pub file_path: String,
    pub status: JobStatus,
    /// Full transcript text; set once by the transcribe stage.
    pub transcript: Option<String>,
    /// Ordered segments; set together with the transcript.
    pub segments: Option<Vec<Segment>>,
    /// Detected ISO language code, None until transcribed.
    pub language: Option<String>,
    /// Human-readable failure reason; meaningful only when failed.
    pub error: Option<String>,
    /// Cooperative cancellation flag observed by running activities.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The deterministic workflow run id for this job. Stable across process
    /// restarts so completion markers written before a crash are found on
    /// resume.
    pub fn workflow_run_id(job_id: i64) -> String {
        format!("transcribe-{job_id}")
    }
}
