//! Intake: the operations an HTTP layer would translate for clients.
//!
//! Turns an upload into a pending job plus a workflow start, and serves
//! status, transcript downloads and live progress subscriptions by reading
//! the store. Transport, auth and multipart parsing live outside the core.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::bus::{ProgressBus, Subscription};
use crate::config::Config;
use crate::domain::{Job, JobStatus, ProgressEvent, Segment};
use crate::store::{Store, StoreError};
use crate::workflow::Scheduler;

#[derive(Debug, Error)]
pub enum IntakeError {
    /// Maps to 404 at the API layer.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job exists but is not `completed`; transcript downloads are
    /// refused with a not-found-equivalent condition.
    #[error("job {0} is {1}, transcript not available")]
    NotReady(i64, JobStatus),

    #[error("could not persist upload: {0}")]
    Upload(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for IntakeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => IntakeError::NotFound(what),
            other => IntakeError::Store(other),
        }
    }
}

/// Transcript download format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptFormat {
    /// UTF-8 transcript, verbatim.
    Txt,
    /// SubRip subtitles rendered from the segments.
    Srt,
}

impl std::str::FromStr for TranscriptFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "txt" => Ok(TranscriptFormat::Txt),
            "srt" => Ok(TranscriptFormat::Srt),
            other => Err(format!("unknown transcript format: {other}")),
        }
    }
}

/// Front door of the core.
pub struct Intake {
    config: Arc<Config>,
    store: Arc<Store>,
    bus: Arc<ProgressBus>,
    scheduler: Arc<Scheduler>,
}

impl Intake {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: Arc<ProgressBus>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            scheduler,
        }
    }

    /// Persist uploaded bytes, create the job and start its workflow.
    pub async fn submit(
        &self,
        user_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<i64, IntakeError> {
        let safe_name = sanitize_filename(filename);
        let path: PathBuf = self
            .config
            .upload_dir
            .join(format!("{}_{safe_name}", Uuid::new_v4()));

        tokio::fs::create_dir_all(&self.config.upload_dir)
            .await
            .map_err(|e| IntakeError::Upload(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| IntakeError::Upload(e.to_string()))?;

        let job_id = self
            .store
            .create_job(user_id, filename, &path.to_string_lossy())?;
        info!(job_id, user_id, filename, "job submitted");

        self.bus.publish(
            job_id,
            ProgressEvent {
                job_id,
                status: JobStatus::Pending,
                progress_pct: None,
                message: None,
                error: None,
            },
        );
        self.scheduler.start(job_id);
        Ok(job_id)
    }

    pub fn get_status(&self, job_id: i64) -> Result<Job, IntakeError> {
        Ok(self.store.get_job(job_id)?)
    }

    pub fn list_jobs(&self, user_id: &str) -> Result<Vec<Job>, IntakeError> {
        Ok(self.store.list_jobs_by_user(user_id)?)
    }

    /// Transcript download; only `completed` jobs have one.
    pub fn get_transcript(
        &self,
        job_id: i64,
        format: TranscriptFormat,
    ) -> Result<Vec<u8>, IntakeError> {
        let job = self.store.get_job(job_id)?;
        if job.status != JobStatus::Completed {
            return Err(IntakeError::NotReady(job_id, job.status));
        }
        let transcript = job.transcript.unwrap_or_default();
        match format {
            TranscriptFormat::Txt => Ok(transcript.into_bytes()),
            TranscriptFormat::Srt => {
                let segments = job.segments.unwrap_or_default();
                Ok(render_srt(&segments).into_bytes())
            }
        }
    }

    /// Live progress stream; events published before the call are gone,
    /// observers should read current state via [`Intake::get_status`].
    pub fn subscribe_updates(&self, job_id: i64) -> Subscription {
        self.bus.subscribe(job_id)
    }

    pub fn cancel(&self, job_id: i64) -> Result<(), IntakeError> {
        Ok(self.scheduler.cancel(job_id)?)
    }
}

/// Keep a conservative character set for on-disk names.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Render segments as SubRip: 1-based index, `HH:MM:SS,mmm --> HH:MM:SS,mmm`,
/// the segment text, then a blank line. No BOM.
pub fn render_srt(segments: &[Segment]) -> String {
    let mut lines = Vec::with_capacity(segments.len() * 4);
    for (i, segment) in segments.iter().enumerate() {
        lines.push((i + 1).to_string());
        lines.push(format!(
            "{} --> {}",
            srt_timestamp(segment.start),
            srt_timestamp(segment.end)
        ));
        lines.push(segment.text.trim().to_string());
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Seconds to the SubRip `HH:MM:SS,mmm` timecode.
fn srt_timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = (seconds % 60.0) as u64;
    let millis = ((seconds % 1.0) * 1000.0) as u64;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}
