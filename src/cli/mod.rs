//! Command-line interface for murmur.
//!
//! Drives the pipeline core in-process: submitting audio, inspecting job
//! status, downloading transcripts, semantic search and a long-running
//! serve mode that recovers interrupted jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::bus::ProgressBus;
use crate::chunking::{Chunker, HttpTopicOracle, TopicOracle};
use crate::config::Config;
use crate::domain::Update;
use crate::embedding::{Embedder, HashingEmbedder};
use crate::intake::{Intake, TranscriptFormat};
use crate::search::SearchEngine;
use crate::store::Store;
use crate::transcribe::{Transcriber, WhisperTranscriber};
use crate::workflow::{Collaborators, Scheduler};

/// murmur - durable audio transcription pipeline
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit an audio file and follow its progress
    Submit {
        /// Audio file to transcribe
        file: PathBuf,

        /// Owner of the job
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Show the status of a job
    Status {
        job_id: i64,
    },

    /// List jobs for a user, newest first
    Jobs {
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Download a transcript
    Transcript {
        job_id: i64,

        /// txt or srt
        #[arg(short, long, default_value = "txt")]
        format: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Semantic search over your transcripts
    Search {
        query: String,

        #[arg(short, long, default_value = "local")]
        user: String,

        /// Maximum number of hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a running job
    Cancel {
        job_id: i64,
    },

    /// Run the worker pool until interrupted, recovering unfinished jobs
    Serve,

    /// Show resolved configuration (debug)
    Config,
}

/// Wired-up pipeline components for one process.
struct Runtime {
    scheduler: Arc<Scheduler>,
    intake: Intake,
    search: SearchEngine,
}

fn bootstrap() -> Result<Runtime> {
    let config = Arc::new(Config::from_env()?);
    let store = Arc::new(
        Store::open(&config.db_path, config.embedding_dim).context("failed to open store")?,
    );
    let bus = Arc::new(ProgressBus::new());

    let oracle: Arc<dyn TopicOracle> = Arc::new(HttpTopicOracle::new(
        config.oracle_base_url.clone(),
        config.oracle_model.clone(),
        Duration::from_secs(config.oracle_timeout_seconds),
    ));
    let chunker = Arc::new(Chunker::new(
        Some(oracle),
        config.chunking_strategy,
        config.sentences_per_chunk,
    ));
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding_dim));
    let transcriber: Arc<dyn Transcriber> =
        Arc::new(WhisperTranscriber::new(config.whisper_path.clone()));

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
    let search = SearchEngine::new(store, embedder);

    Ok(Runtime {
        scheduler,
        intake,
        search,
    })
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { file, user } => {
                let runtime = bootstrap()?;
                let filename = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string());
                let bytes = tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?;

                let job_id = runtime.intake.submit(&user, &filename, &bytes).await?;
                println!("job {job_id} submitted");

                let mut updates = runtime.intake.subscribe_updates(job_id);
                loop {
                    let update = tokio::time::timeout(Duration::from_millis(500), updates.next());
                    match update.await {
                        Ok(Some(Update::Event(event))) => {
                            match (&event.error, event.progress_pct) {
                                (Some(error), _) => println!("  {}: {error}", event.status),
                                (None, Some(pct)) => println!("  {} ({pct}%)", event.status),
                                (None, None) => {
                                    println!(
                                        "  {} {}",
                                        event.status,
                                        event.message.unwrap_or_default()
                                    )
                                }
                            }
                        }
                        Ok(Some(Update::Lagged { missed })) => {
                            println!("  ... {missed} updates skipped");
                        }
                        Ok(None) | Err(_) => {}
                    }
                    let job = runtime.intake.get_status(job_id)?;
                    if job.status.is_terminal() {
                        println!("job {job_id}: {}", job.status);
                        if let Some(error) = job.error {
                            println!("error: {error}");
                        }
                        break;
                    }
                }
            }

            Commands::Status { job_id } => {
                let runtime = bootstrap()?;
                let job = runtime.intake.get_status(job_id)?;
                println!("{}", serde_json::to_string_pretty(&job)?);
            }

            Commands::Jobs { user } => {
                let runtime = bootstrap()?;
                let jobs = runtime.intake.list_jobs(&user)?;
                if jobs.is_empty() {
                    println!("no jobs for {user}");
                }
                for job in jobs {
                    println!(
                        "{:>6}  {:<10}  {}  {}",
                        job.id,
                        job.status.as_str(),
                        job.created_at.format("%Y-%m-%d %H:%M:%S"),
                        job.filename
                    );
                }
            }

            Commands::Transcript {
                job_id,
                format,
                output,
            } => {
                let runtime = bootstrap()?;
                let format: TranscriptFormat =
                    format.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                let bytes = runtime.intake.get_transcript(job_id, format)?;
                match output {
                    Some(path) => {
                        tokio::fs::write(&path, &bytes)
                            .await
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        println!("wrote {} bytes to {}", bytes.len(), path.display());
                    }
                    None => print!("{}", String::from_utf8_lossy(&bytes)),
                }
            }

            Commands::Search { query, user, limit } => {
                let runtime = bootstrap()?;
                let hits = runtime.search.search(&user, &query, limit).await?;
                if hits.is_empty() {
                    println!("no results");
                }
                for hit in hits {
                    println!(
                        "[{:.3}] job {} chunk {} ({:.1}s-{:.1}s)",
                        hit.score, hit.job_id, hit.chunk_index, hit.start_time, hit.end_time
                    );
                    if !hit.topic_summary.is_empty() {
                        println!("        {}", hit.topic_summary);
                    }
                    println!("        {}", preview(&hit.text, 120));
                }
            }

            Commands::Cancel { job_id } => {
                let runtime = bootstrap()?;
                runtime.intake.cancel(job_id)?;
                println!("cancellation requested for job {job_id}");
            }

            Commands::Serve => {
                let runtime = bootstrap()?;
                let recovered = runtime.scheduler.recover()?;
                info!(recovered, "serving");
                println!("murmur serving; press ctrl-c to stop");

                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for ctrl-c")?;
                println!("shutting down");

                let Runtime {
                    scheduler, intake, ..
                } = runtime;
                drop(intake);
                if let Ok(scheduler) = Arc::try_unwrap(scheduler) {
                    scheduler.shutdown().await;
                }
            }

            Commands::Config => {
                let config = Config::from_env()?;
                println!("{config:#?}");
            }
        }
        Ok(())
    }
}

/// First `max` bytes of `text` on a char boundary, with an ellipsis.
fn preview(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim().to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", text[..cut].trim())
}
