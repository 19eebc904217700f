//! The three pipeline activities and the context they execute in.
//!
//! Activities receive only a job id and re-read state from the store; large
//! payloads never travel through the scheduler. Each activity writes its
//! durable output and its completion marker in a single store transaction,
//! so a crash between attempt and commit leaves no partial state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::bus::ProgressBus;
use crate::chunking::Chunker;
use crate::config::Config;
use crate::domain::{JobStatus, ProgressEvent};
use crate::embedding::Embedder;
use crate::error::ActivityError;
use crate::store::{CompletionMarker, Store};
use crate::transcribe::{TranscribeOptions, Transcriber};
use crate::workflow::RetryPolicy;

/// Internal batch size for the embed stage; also the granularity of its
/// progress messages.
const EMBED_BATCH: usize = 32;

/// The immutable collaborator bundle created at startup and shared by the
/// scheduler and every activity.
pub struct Collaborators {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub bus: Arc<ProgressBus>,
    pub transcriber: Arc<dyn Transcriber>,
    pub chunker: Arc<Chunker>,
    pub embedder: Arc<dyn Embedder>,
}

/// Everything one activity attempt can reach.
pub struct ActivityContext {
    pub collab: Arc<Collaborators>,
    pub run_id: String,
    pub job_id: i64,
    pub heartbeat: HeartbeatHandle,
}

impl ActivityContext {
    fn marker(&self, activity: Activity, payload: serde_json::Value) -> CompletionMarker {
        CompletionMarker {
            workflow_run_id: self.run_id.clone(),
            activity_name: activity.name().to_string(),
            payload,
        }
    }
}

/// Liveness handle given to activities. Beating resets the heartbeat
/// watchdog; messages additionally surface on the progress bus.
#[derive(Clone)]
pub struct HeartbeatHandle {
    beats: mpsc::Sender<()>,
    bus: Arc<ProgressBus>,
    job_id: i64,
}

impl HeartbeatHandle {
    pub fn new(beats: mpsc::Sender<()>, bus: Arc<ProgressBus>, job_id: i64) -> Self {
        Self {
            beats,
            bus,
            job_id,
        }
    }

    /// Signal liveness. Never blocks; a full channel means the watchdog is
    /// already aware we are alive.
    pub fn beat(&self) {
        let _ = self.beats.try_send(());
    }

    /// Publish an intermediate progress message and beat.
    pub fn message(&self, text: impl Into<String>) {
        self.bus.publish(
            self.job_id,
            ProgressEvent::message(self.job_id, JobStatus::Processing, text),
        );
        self.beat();
    }
}

/// The fixed activity sequence of the transcription workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Transcribe,
    Chunk,
    Embed,
}

impl Activity {
    /// Execution order within a workflow.
    pub const ALL: [Activity; 3] = [Activity::Transcribe, Activity::Chunk, Activity::Embed];

    /// Stable name used in completion markers and logs.
    pub fn name(self) -> &'static str {
        match self {
            Activity::Transcribe => "transcribe",
            Activity::Chunk => "chunk",
            Activity::Embed => "embed",
        }
    }

    /// Progress milestone published after this activity.
    pub fn milestone_pct(self) -> u8 {
        match self {
            Activity::Transcribe => 60,
            Activity::Chunk => 80,
            Activity::Embed => 100,
        }
    }

    /// Retry/timeout policy for this activity.
    pub fn policy(self) -> RetryPolicy {
        match self {
            Activity::Transcribe => RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1000,
                max_delay_ms: 60_000,
                backoff_multiplier: 2.0,
                start_to_close: Duration::from_secs(60 * 60),
                heartbeat_timeout: Duration::from_secs(5 * 60),
            },
            Activity::Chunk => RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1000,
                max_delay_ms: 60_000,
                backoff_multiplier: 2.0,
                start_to_close: Duration::from_secs(30 * 60),
                heartbeat_timeout: Duration::from_secs(60),
            },
            Activity::Embed => RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                start_to_close: Duration::from_secs(10 * 60),
                heartbeat_timeout: Duration::from_secs(30),
            },
        }
    }

    /// Run the activity once. On success the durable output and the
    /// completion marker are committed together; the returned value is the
    /// marker's compact payload.
    pub async fn execute(self, ctx: &ActivityContext) -> Result<serde_json::Value, ActivityError> {
        match self {
            Activity::Transcribe => transcribe(ctx).await,
            Activity::Chunk => chunk(ctx).await,
            Activity::Embed => embed(ctx).await,
        }
    }
}

async fn transcribe(ctx: &ActivityContext) -> Result<serde_json::Value, ActivityError> {
    let job = ctx.collab.store.get_job(ctx.job_id)?;
    ctx.heartbeat.beat();

    let options = TranscribeOptions {
        model_size: ctx.collab.config.transcribe_model_size,
        force_language: None,
    };
    let result = ctx
        .collab
        .transcriber
        .transcribe(Path::new(&job.file_path), &options)
        .await?;

    let payload = json!({
        "character_count": result.transcript.len(),
        "segment_count": result.segments.len(),
        "language": result.language,
        "transcript_digest": digest16(&result.transcript),
    });
    let marker = ctx.marker(Activity::Transcribe, payload.clone());
    ctx.collab.store.save_transcription(
        ctx.job_id,
        &result.transcript,
        &result.segments,
        &result.language,
        Some(&marker),
    )?;
    Ok(payload)
}

async fn chunk(ctx: &ActivityContext) -> Result<serde_json::Value, ActivityError> {
    let job = ctx.collab.store.get_job(ctx.job_id)?;
    let transcript = job
        .transcript
        .ok_or_else(|| ActivityError::permanent("job has no transcript to chunk"))?;
    let segments = job.segments.unwrap_or_default();
    ctx.heartbeat.beat();

    let drafts = ctx.collab.chunker.chunk(&transcript, &segments).await?;
    ctx.heartbeat
        .message(format!("created {} chunks", drafts.len()));

    let payload = json!({
        "chunk_count": drafts.len(),
        "semantic": drafts.iter().any(|d| d.confidence > 0.0),
    });
    let marker = ctx.marker(Activity::Chunk, payload.clone());
    ctx.collab
        .store
        .replace_chunks(ctx.job_id, &drafts, Some(&marker))?;
    Ok(payload)
}

async fn embed(ctx: &ActivityContext) -> Result<serde_json::Value, ActivityError> {
    let chunks = ctx.collab.store.get_chunks(ctx.job_id)?;
    ctx.heartbeat.beat();

    let total = chunks.len();
    let mut vectors_by_index: BTreeMap<i64, Vec<f32>> = BTreeMap::new();
    let mut done = 0usize;
    for batch in chunks.chunks(EMBED_BATCH) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = ctx.collab.embedder.embed_batch(&texts).await?;
        for (chunk, vector) in batch.iter().zip(vectors) {
            vectors_by_index.insert(chunk.chunk_index, vector);
        }
        done += batch.len();
        ctx.heartbeat
            .message(format!("embedded {done}/{total} chunks"));
    }

    let payload = json!({
        "embedding_count": vectors_by_index.len(),
        "dimension": ctx.collab.embedder.dimension(),
    });
    let marker = ctx.marker(Activity::Embed, payload.clone());
    ctx.collab
        .store
        .patch_chunk_embeddings(ctx.job_id, &vectors_by_index, Some(&marker))?;
    Ok(payload)
}

/// First 16 hex chars of the SHA-256 of `text`; enough to correlate marker
/// payloads with stored transcripts without duplicating them.
fn digest16(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activities_run_in_pipeline_order() {
        assert_eq!(
            Activity::ALL.map(|a| a.name()),
            ["transcribe", "chunk", "embed"]
        );
    }

    #[test]
    fn milestones_match_the_reporting_contract() {
        assert_eq!(Activity::Transcribe.milestone_pct(), 60);
        assert_eq!(Activity::Chunk.milestone_pct(), 80);
        assert_eq!(Activity::Embed.milestone_pct(), 100);
    }

    #[test]
    fn policies_follow_the_defaults_table() {
        let transcribe = Activity::Transcribe.policy();
        assert_eq!(transcribe.max_attempts, 3);
        assert_eq!(transcribe.start_to_close, Duration::from_secs(3600));
        assert_eq!(transcribe.heartbeat_timeout, Duration::from_secs(300));

        let embed = Activity::Embed.policy();
        assert_eq!(embed.max_delay_ms, 30_000);
        assert_eq!(embed.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn digest_is_stable_and_short() {
        assert_eq!(digest16("abc"), digest16("abc"));
        assert_ne!(digest16("abc"), digest16("abd"));
        assert_eq!(digest16("abc").len(), 16);
    }
}
