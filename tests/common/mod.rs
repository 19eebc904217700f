//! Shared fixtures for integration tests: a wired-up pipeline with
//! scripted collaborators in place of whisper and the LLM oracle.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use murmur::bus::ProgressBus;
use murmur::chunking::{Chunker, OracleError, TopicOracle, TopicSpan};
use murmur::config::{ChunkingStrategy, Config};
use murmur::domain::{Job, Segment, Update};
use murmur::embedding::{Embedder, HashingEmbedder};
use murmur::intake::Intake;
use murmur::search::SearchEngine;
use murmur::store::Store;
use murmur::transcribe::{
    TranscribeError, TranscribeOptions, Transcriber, Transcription,
};
use murmur::workflow::{Collaborators, Scheduler};

pub const TRANSCRIPT: &str = "Hello world. This is a test.";

pub fn two_sentence_segments() -> Vec<Segment> {
    vec![
        Segment {
            start: 0.0,
            end: 1.0,
            text: "Hello world.".to_string(),
        },
        Segment {
            start: 1.0,
            end: 2.5,
            text: " This is a test.".to_string(),
        },
    ]
}

/// What the scripted transcriber does on every call.
#[allow(dead_code)]
pub enum Script {
    Success {
        transcript: String,
        segments: Vec<Segment>,
        language: String,
    },
    DecodeError,
    FileMissing,
    /// Sleep before succeeding; long enough for a cancel to land first.
    Slow {
        delay: Duration,
    },
}

pub struct ScriptedTranscriber {
    script: Script,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn happy() -> Arc<Self> {
        Self::new(Script::Success {
            transcript: TRANSCRIPT.to_string(),
            segments: two_sentence_segments(),
            language: "en".to_string(),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        audio_path: &Path,
        _options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Success {
                transcript,
                segments,
                language,
            } => Ok(Transcription {
                transcript: transcript.clone(),
                segments: segments.clone(),
                language: language.clone(),
            }),
            Script::DecodeError => Err(TranscribeError::Decode("corrupt frame header".into())),
            Script::FileMissing => {
                Err(TranscribeError::FileMissing(audio_path.display().to_string()))
            }
            Script::Slow { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(Transcription {
                    transcript: TRANSCRIPT.to_string(),
                    segments: two_sentence_segments(),
                    language: "en".to_string(),
                })
            }
        }
    }
}

/// Oracle returning a fixed partition with confidence 0.9.
pub struct PartitionOracle {
    pub spans: Vec<(usize, usize, &'static str)>,
}

#[async_trait]
impl TopicOracle for PartitionOracle {
    async fn suggest_chunks(&self, _transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
        Ok(self
            .spans
            .iter()
            .map(|&(start, end, topic)| TopicSpan {
                start_char_pos: start,
                end_char_pos: end,
                topic_summary: topic.to_string(),
                keywords: vec!["alpha".into(), "beta".into(), "gamma".into()],
                confidence: 0.9,
            })
            .collect())
    }
}

/// Oracle that always fails, as an unreachable LLM would.
pub struct DownOracle;

#[async_trait]
impl TopicOracle for DownOracle {
    async fn suggest_chunks(&self, _transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
        Err(OracleError::Http("connection refused".into()))
    }
}

/// Oracle that hangs long enough for cancellation to land mid-chunk.
#[allow(dead_code)]
pub struct StalledOracle {
    pub delay: Duration,
}

#[async_trait]
impl TopicOracle for StalledOracle {
    async fn suggest_chunks(&self, _transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
        tokio::time::sleep(self.delay).await;
        Err(OracleError::Http("gave up".into()))
    }
}

/// A fully wired pipeline over a temp directory.
pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub bus: Arc<ProgressBus>,
    pub scheduler: Arc<Scheduler>,
    pub intake: Intake,
    pub search: SearchEngine,
    pub embedder: Arc<dyn Embedder>,
    _tmp: TempDir,
}

pub fn harness(
    transcriber: Arc<dyn Transcriber>,
    oracle: Option<Arc<dyn TopicOracle>>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(Config {
        db_path: tmp.path().join("murmur.db"),
        upload_dir: tmp.path().join("uploads"),
        worker_pool_size: 2,
        heartbeat_interval_seconds: 1,
        sweep_interval_seconds: 1,
        sentences_per_chunk: 1,
        chunking_strategy: ChunkingStrategy::Semantic,
        ..Config::default()
    });

    let store = Arc::new(Store::open(&config.db_path, config.embedding_dim).unwrap());
    let bus = Arc::new(ProgressBus::new());
    let chunker = Arc::new(Chunker::new(
        oracle,
        config.chunking_strategy,
        config.sentences_per_chunk,
    ));
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding_dim));

    let collab = Arc::new(Collaborators {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        bus: Arc::clone(&bus),
        transcriber,
        chunker,
        embedder: Arc::clone(&embedder),
    });
    let scheduler = Arc::new(Scheduler::new(collab));
    let intake = Intake::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&scheduler),
    );
    let search = SearchEngine::new(Arc::clone(&store), Arc::clone(&embedder));

    Harness {
        config,
        store,
        bus,
        scheduler,
        intake,
        search,
        embedder,
        _tmp: tmp,
    }
}

/// Poll until the job reaches a terminal status or the deadline passes.
pub async fn wait_for_terminal(store: &Store, job_id: i64, deadline: Duration) -> Job {
    let started = std::time::Instant::now();
    loop {
        let job = store.get_job(job_id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            started.elapsed() < deadline,
            "job {job_id} still {} after {deadline:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the predicate holds for the job, or panic at the deadline.
#[allow(dead_code)]
pub async fn wait_for_job(
    store: &Store,
    job_id: i64,
    deadline: Duration,
    predicate: impl Fn(&Job) -> bool,
) -> Job {
    let started = std::time::Instant::now();
    loop {
        let job = store.get_job(job_id).unwrap();
        if predicate(&job) {
            return job;
        }
        assert!(
            started.elapsed() < deadline,
            "job {job_id} never matched predicate within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Drain every update currently buffered on a subscription.
#[allow(dead_code)]
pub fn drain_updates(sub: &mut murmur::bus::Subscription) -> Vec<Update> {
    let mut updates = Vec::new();
    while let Some(update) = sub.try_next() {
        updates.push(update);
    }
    updates
}
