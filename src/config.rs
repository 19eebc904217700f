//! Runtime configuration for murmur.
//!
//! All knobs come from environment variables with sensible defaults so the
//! pipeline can run unconfigured on a laptop. The resolved [`Config`] is
//! immutable and handed to every component at startup; nothing reads the
//! environment after that.
//!
//! Environment variables:
//! - MURMUR_HOME: state directory (database, uploads). Default: ~/.murmur
//! - MURMUR_DB_PATH: SQLite database file. Default: $MURMUR_HOME/murmur.db
//! - MURMUR_UPLOAD_DIR: uploaded audio storage. Default: $MURMUR_HOME/uploads
//! - MURMUR_WORKER_POOL_SIZE: concurrent workflows. Default: 3
//! - MURMUR_HEARTBEAT_INTERVAL_SECONDS: activity heartbeat cadence. Default: 5
//! - MURMUR_SWEEP_INTERVAL_SECONDS: pending-job sweep cadence. Default: 5
//! - MURMUR_TRANSCRIBE_MODEL_SIZE: tiny|base|small|medium|large. Default: base
//! - MURMUR_CHUNKING_STRATEGY: semantic|sentence. Default: semantic
//! - MURMUR_SENTENCES_PER_CHUNK: fallback chunk size. Default: 4
//! - MURMUR_ORACLE_BASE_URL: OpenAI-compatible endpoint for topic analysis
//! - MURMUR_ORACLE_MODEL: model name passed to the oracle
//! - MURMUR_ORACLE_TIMEOUT_SECONDS: per-call oracle timeout. Default: 30
//! - MURMUR_WHISPER_PATH: whisper binary. Default: whisper

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};

use crate::transcribe::ModelSize;

/// Embedding dimension the whole system is built around. Mixing dimensions
/// is a configuration error, checked once at startup.
pub const EMBEDDING_DIM: usize = 384;

/// Chunking strategy selection. The sentence fallback is always available
/// regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// Consult the topic oracle, fall back to sentence splitting on failure.
    Semantic,
    /// Sentence splitting only; the oracle is never contacted.
    Sentence,
}

/// Resolved, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,

    /// Directory uploaded audio files are persisted under.
    pub upload_dir: PathBuf,

    /// Number of concurrent workflow worker slots.
    pub worker_pool_size: usize,

    /// Embedding dimension; asserted equal to [`EMBEDDING_DIM`].
    pub embedding_dim: usize,

    /// Seconds between heartbeat ticks inside a running activity.
    pub heartbeat_interval_seconds: u64,

    /// Seconds between sweeps for pending jobs awaiting a worker slot.
    pub sweep_interval_seconds: u64,

    /// Whisper model size used for transcription.
    pub transcribe_model_size: ModelSize,

    /// Primary chunking strategy.
    pub chunking_strategy: ChunkingStrategy,

    /// Sentences per chunk in the fallback splitter.
    pub sentences_per_chunk: usize,

    /// Base URL of the OpenAI-compatible topic oracle (e.g. an Ollama host).
    pub oracle_base_url: String,

    /// Model name sent to the topic oracle.
    pub oracle_model: String,

    /// Per-call timeout for the topic oracle, in seconds.
    pub oracle_timeout_seconds: u64,

    /// Path to the whisper binary.
    pub whisper_path: String,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let home = murmur_home()?;

        let db_path = env_var("MURMUR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("murmur.db"));
        let upload_dir = env_var("MURMUR_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("uploads"));

        let worker_pool_size = env_parse("MURMUR_WORKER_POOL_SIZE", 3usize)?;
        let heartbeat_interval_seconds = env_parse("MURMUR_HEARTBEAT_INTERVAL_SECONDS", 5u64)?;
        let sweep_interval_seconds = env_parse("MURMUR_SWEEP_INTERVAL_SECONDS", 5u64)?;
        let sentences_per_chunk = env_parse("MURMUR_SENTENCES_PER_CHUNK", 4usize)?;
        let oracle_timeout_seconds = env_parse("MURMUR_ORACLE_TIMEOUT_SECONDS", 30u64)?;

        let transcribe_model_size = match env_var("MURMUR_TRANSCRIBE_MODEL_SIZE") {
            Some(raw) => raw
                .parse::<ModelSize>()
                .map_err(|e| anyhow::anyhow!("invalid MURMUR_TRANSCRIBE_MODEL_SIZE: {raw}: {e}"))?,
            None => ModelSize::Base,
        };

        let chunking_strategy = match env_var("MURMUR_CHUNKING_STRATEGY").as_deref() {
            None | Some("semantic") => ChunkingStrategy::Semantic,
            Some("sentence") => ChunkingStrategy::Sentence,
            Some(other) => anyhow::bail!("invalid MURMUR_CHUNKING_STRATEGY: {other}"),
        };

        let config = Self {
            db_path,
            upload_dir,
            worker_pool_size,
            embedding_dim: EMBEDDING_DIM,
            heartbeat_interval_seconds,
            sweep_interval_seconds,
            transcribe_model_size,
            chunking_strategy,
            sentences_per_chunk,
            oracle_base_url: env_var("MURMUR_ORACLE_BASE_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            oracle_model: env_var("MURMUR_ORACLE_MODEL")
                .unwrap_or_else(|| "llama3.1:8b".to_string()),
            oracle_timeout_seconds,
            whisper_path: env_var("MURMUR_WHISPER_PATH").unwrap_or_else(|| "whisper".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup assertions that cannot be expressed per-field.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.embedding_dim == EMBEDDING_DIM,
            "embedding_dim is fixed at {EMBEDDING_DIM}, got {}",
            self.embedding_dim
        );
        ensure!(self.worker_pool_size > 0, "worker_pool_size must be >= 1");
        ensure!(
            self.sentences_per_chunk > 0,
            "sentences_per_chunk must be >= 1"
        );
        ensure!(
            self.heartbeat_interval_seconds > 0,
            "heartbeat_interval_seconds must be >= 1"
        );
        Ok(())
    }
}

impl Default for Config {
    /// Defaults rooted in relative paths; tests override them explicitly.
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("murmur.db"),
            upload_dir: PathBuf::from("uploads"),
            worker_pool_size: 3,
            embedding_dim: EMBEDDING_DIM,
            heartbeat_interval_seconds: 5,
            sweep_interval_seconds: 5,
            transcribe_model_size: ModelSize::Base,
            chunking_strategy: ChunkingStrategy::Semantic,
            sentences_per_chunk: 4,
            oracle_base_url: "http://localhost:11434".to_string(),
            oracle_model: "llama3.1:8b".to_string(),
            oracle_timeout_seconds: 30,
            whisper_path: "whisper".to_string(),
        }
    }
}

/// Get the murmur home directory.
///
/// Checks MURMUR_HOME first, falls back to ~/.murmur
pub fn murmur_home() -> Result<PathBuf> {
    if let Some(home) = env_var("MURMUR_HOME") {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".murmur"))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {name}: {raw}")),
        None => Ok(default),
    }
}
